//! Command implementations
//!
//! Every command opens one session over the configured store, does its work
//! and flushes the session before returning.

pub mod changes;
pub mod define;

use anyhow::{Context as AnyhowContext, Result, bail};
use declarative::{BuiltinEvaluator, LedgerResolver, Session};
use keystore::{MemoryStore, ResolvingStore, SqliteStore, Store};
use std::fs;
use std::sync::Arc;

use crate::Context;
use crate::config::{Backend, Config};

/// Open a session over the store described by `config`
pub fn open_session(config: &Config) -> Result<Session> {
    let store: Arc<dyn Store> = match config.store.backend {
        Backend::Sqlite => {
            let path = config.store.db_path();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Could not create {}", parent.display()))?;
            }
            let sqlite = SqliteStore::open(&path)
                .with_context(|| format!("Could not open store at {}", path.display()))?;
            log::debug!("Using sqlite store at {}", path.display());
            Arc::new(ResolvingStore::new(sqlite).with_resolver("locks", Arc::new(LedgerResolver)))
        }
        Backend::Memory => {
            log::warn!("Using in-memory store; nothing outlives this command");
            Arc::new(ResolvingStore::new(MemoryStore::new()).with_resolver("locks", Arc::new(LedgerResolver)))
        }
    };
    Ok(Session::new(store, config.session_options()).with_evaluator(Arc::new(BuiltinEvaluator)))
}

/// Load config and open a session for a command
pub fn session(ctx: &Context) -> Result<Session> {
    let config = Config::load(ctx.config.as_deref())?;
    open_session(&config)
}

/// Write everything the session still holds
pub fn finish(session: &mut Session) -> Result<()> {
    let report = session.flush();
    if let Some((key, err)) = report.failed.first() {
        bail!(
            "{} of {} records were not saved, first {}/{}: {err}",
            report.failed.len(),
            report.failed.len() + report.saved,
            key.bucket,
            key.key
        );
    }
    Ok(())
}
