use anyhow::{Context, Result, bail};
use declarative::{DirtyPolicy, LockOptions, LockStrategy, SaveMode, SessionOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the config directory path
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("rigging"))
}

/// Default location of the store database
fn default_store_path() -> String {
    match dirs::state_dir().or_else(dirs::data_local_dir) {
        Some(dir) => dir.join("rigging").join("store.db").to_string_lossy().into_owned(),
        None => "~/.rigging/store.db".to_string(),
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sqlite,
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    /// Get expanded database path
    pub fn db_path(&self) -> PathBuf {
        let expanded = shellexpand::tilde(&self.path);
        PathBuf::from(expanded.as_ref())
    }
}

// ============================================================================
// Session and Lock
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub cache_capacity: usize,
    pub save_mode: SaveMode,
    pub dirty_policy: DirtyPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let defaults = SessionOptions::default();
        Self {
            cache_capacity: defaults.cache_capacity,
            save_mode: defaults.save_mode,
            dirty_policy: defaults.dirty_policy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub retries: u32,
    pub wait_ms: u64,
    pub backoff: f64,
    pub strategy: LockStrategy,
}

impl Default for LockConfig {
    fn default() -> Self {
        let defaults = LockOptions::default();
        Self {
            retries: defaults.retries,
            wait_ms: u64::try_from(defaults.wait.as_millis()).unwrap_or(u64::MAX),
            backoff: defaults.backoff,
            strategy: defaults.strategy,
        }
    }
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub session: SessionConfig,
    pub lock: LockConfig,
}

impl Config {
    /// Load config from `path`, or from the default location
    ///
    /// A missing default file yields the defaults; a missing explicit file
    /// is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from(path),
            None => {
                let path = config_dir()?.join("config.toml");
                if path.exists() {
                    Self::load_from(&path)
                } else {
                    log::debug!("No config at {}, using defaults", path.display());
                    Ok(Self::default())
                }
            }
        }
    }

    /// Load config from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid config format in {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.session.cache_capacity == 0 {
            bail!("session.cache_capacity must be at least 1");
        }
        if !(self.lock.backoff >= 1.0 && self.lock.backoff.is_finite()) {
            bail!("lock.backoff must be a finite number of at least 1.0");
        }
        if self.store.backend == Backend::Sqlite && self.store.path.trim().is_empty() {
            bail!("store.path is required for the sqlite backend");
        }
        Ok(())
    }

    /// Session tunables derived from this config
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            cache_capacity: self.session.cache_capacity,
            save_mode: self.session.save_mode,
            dirty_policy: self.session.dirty_policy,
            lock: LockOptions {
                retries: self.lock.retries,
                wait: Duration::from_millis(self.lock.wait_ms),
                backoff: self.lock.backoff,
                strategy: self.lock.strategy,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
[store]
backend = "memory"

[lock]
strategy = "ledger"
wait_ms = 50
backoff = 2.0
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.store.backend, Backend::Memory);
        assert_eq!(config.session, SessionConfig::default());

        let options = config.session_options();
        assert_eq!(options.lock.strategy, LockStrategy::Ledger);
        assert_eq!(options.lock.wait, Duration::from_millis(50));
        assert!((options.lock.backoff - 2.0).abs() < f64::EPSILON);
        assert_eq!(options.lock.retries, LockOptions::default().retries);
    }

    #[test]
    fn test_session_modes_parse() {
        let config: Config = toml::from_str(
            r#"
[session]
cache_capacity = 8
save_mode = "lazy"
dirty_policy = "fail"
"#,
        )
        .unwrap();
        let options = config.session_options();
        assert_eq!(options.cache_capacity, 8);
        assert_eq!(options.save_mode, SaveMode::Lazy);
        assert_eq!(options.dirty_policy, DirtyPolicy::Fail);
    }

    #[test]
    fn test_invalid_configs_are_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.toml");

        fs::write(&path, "[session]\ncache_capacity = 0\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());

        fs::write(&path, "[lock]\nbackoff = 0.5\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());

        fs::write(&path, "[store]\nbackend = \"postgres\"\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());

        assert!(Config::load(Some(&temp.path().join("missing.toml"))).is_err());
    }

    #[test]
    fn test_db_path_expands_tilde() {
        let store = StoreConfig {
            backend: Backend::Sqlite,
            path: "~/rigging/store.db".into(),
        };
        let path = store.db_path();
        assert!(!path.to_string_lossy().starts_with('~'));
        assert!(path.ends_with("rigging/store.db"));
    }
}
