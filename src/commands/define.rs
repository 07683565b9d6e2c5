//! Blueprint loading
//!
//! A blueprint is a TOML file declaring resources, the connections between
//! them and extra event rules:
//!
//! ```toml
//! [[resource]]
//! name = "node1"
//! handler = "ansible"
//! tags = ["location=dc1"]
//! [resource.actions]
//! run = "run.yaml"
//! [resource.inputs]
//! ip = "10.0.0.3"
//! ports = { schema = ["int"], value = [22] }
//!
//! [[connection]]
//! emitter = "node1"
//! receiver = "ssh"
//! mapping = { ip = "ip" }
//!
//! [[event]]
//! kind = "dependency"
//! parent = "node1"
//! parent_action = "run"
//! child = "ssh"
//! child_action = "run"
//! ```
//!
//! Defining is idempotent: resources that exist get their missing inputs
//! added and their changed, unconnected values updated.

use anyhow::{Context as AnyhowContext, Result, bail};
use declarative::{
    EventRule, InputSchema, Model, Resource, ResourceData, ResourceSpec, Session, events, signals,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use super::{finish, session};
use crate::Context;
use crate::ui;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Blueprint {
    #[serde(rename = "resource")]
    pub resources: Vec<ResourceDef>,
    #[serde(rename = "connection")]
    pub connections: Vec<ConnectionDef>,
    #[serde(rename = "event")]
    pub events: Vec<EventRule>,
}

#[derive(Debug, Deserialize)]
pub struct ResourceDef {
    pub name: String,
    #[serde(default)]
    pub handler: String,
    #[serde(default)]
    pub actions: BTreeMap<String, String>,
    #[serde(default)]
    pub base_path: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConnectionDef {
    pub emitter: String,
    pub receiver: String,
    /// Emitter input to receiver input; empty wires the shared names
    #[serde(default)]
    pub mapping: BTreeMap<String, String>,
}

impl Blueprint {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid blueprint {}", path.display()))
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub created: usize,
    pub updated: usize,
    pub connections: usize,
    pub events: usize,
}

pub fn run(ctx: &Context, file: &Path) -> Result<()> {
    let blueprint = Blueprint::load(file)?;
    let mut session = session(ctx)?;
    let summary = apply(&mut session, &blueprint)?;
    finish(&mut session)?;

    if !ctx.quiet {
        ui::kv("created", &summary.created.to_string());
        ui::kv("updated", &summary.updated.to_string());
        ui::kv("connections", &summary.connections.to_string());
        ui::kv("new events", &summary.events.to_string());
    }
    ui::success(&format!("Defined {}", file.display()));
    Ok(())
}

/// Write a blueprint into the session
///
/// Every connection endpoint is checked before anything is written.
pub fn apply(session: &mut Session, blueprint: &Blueprint) -> Result<Summary> {
    check_endpoints(session, blueprint)?;

    let mut summary = Summary::default();
    for def in &blueprint.resources {
        if session.exists(ResourceData::BUCKET, &def.name)? {
            if update_resource(session, def)? {
                summary.updated += 1;
            }
        } else {
            create_resource(session, def)?;
            summary.created += 1;
        }
    }

    for conn in &blueprint.connections {
        let pairs: Vec<(&str, &str)> = conn
            .mapping
            .iter()
            .map(|(theirs, mine)| (theirs.as_str(), mine.as_str()))
            .collect();
        signals::connect(session, &conn.emitter, &conn.receiver, &pairs)
            .with_context(|| format!("Could not connect {} to {}", conn.emitter, conn.receiver))?;
        summary.connections += 1;
    }

    for rule in &blueprint.events {
        if events::add_event(session, rule.clone())? {
            summary.events += 1;
        }
    }
    Ok(summary)
}

fn check_endpoints(session: &mut Session, blueprint: &Blueprint) -> Result<()> {
    let declared: BTreeSet<&str> = blueprint.resources.iter().map(|r| r.name.as_str()).collect();
    let endpoints = blueprint
        .connections
        .iter()
        .flat_map(|c| [c.emitter.as_str(), c.receiver.as_str()]);
    for name in endpoints {
        if !declared.contains(name) && !session.exists(ResourceData::BUCKET, name)? {
            bail!("Connection references unknown resource '{name}'");
        }
    }
    Ok(())
}

fn create_resource(session: &mut Session, def: &ResourceDef) -> Result<()> {
    let mut spec = ResourceSpec::new(def.name.as_str()).handler(def.handler.as_str());
    spec.base_path.clone_from(&def.base_path);
    for (action, reference) in &def.actions {
        spec = spec.action(action.as_str(), reference.as_str());
    }
    for (name, definition) in &def.inputs {
        spec = spec.input(name.as_str(), InputSchema::from_definition(definition)?);
    }
    for tag in &def.tags {
        spec = spec.tag(tag.as_str());
    }
    Resource::create(session, spec).with_context(|| format!("Could not create {}", def.name))?;
    log::info!("Created {}", def.name);
    Ok(())
}

/// Returns whether anything changed
fn update_resource(session: &mut Session, def: &ResourceDef) -> Result<bool> {
    let resource = Resource::load(session, &def.name)?;
    let data = resource.data(session)?;
    let connected: Vec<String> = resource
        .connections(session)?
        .into_iter()
        .map(|edge| edge.input)
        .collect();

    let mut changed = false;
    let mut values = Map::new();
    for (name, definition) in &def.inputs {
        let schema = InputSchema::from_definition(definition)?;
        match data.inputs.get(name) {
            None => {
                resource.add_input(session, name, schema)?;
                changed = true;
            }
            Some(current) if current.value != schema.value => {
                if connected.contains(name) {
                    log::warn!("{}.{name} is connected, keeping the wired value", def.name);
                } else {
                    values.insert(name.clone(), schema.value);
                }
            }
            Some(_) => {}
        }
    }
    if !values.is_empty() {
        resource.update(session, values)?;
        changed = true;
    }

    let missing: Vec<&str> = def
        .tags
        .iter()
        .filter(|tag| !data.tags.contains(*tag))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        resource.add_tags(session, &missing)?;
        changed = true;
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const BLUEPRINT: &str = r#"
[[resource]]
name = "node1"
handler = "ansible"
tags = ["location=dc1"]
[resource.actions]
run = "run.yaml"
[resource.inputs]
ip = "10.0.0.3"
ports = { schema = ["int"], value = [22] }

[[resource]]
name = "ssh"
[resource.inputs]
address = ""
ports = { schema = ["int"], value = [] }

[[connection]]
emitter = "node1"
receiver = "ssh"
mapping = { ip = "address", ports = "ports" }

[[event]]
kind = "dependency"
parent = "node1"
parent_action = "run"
child = "ssh"
child_action = "run"
"#;

    #[test]
    fn test_blueprint_defines_graph() {
        let blueprint: Blueprint = toml::from_str(BLUEPRINT).unwrap();
        let mut session = Session::in_memory();
        let summary = apply(&mut session, &blueprint).unwrap();
        assert_eq!(
            summary,
            Summary {
                created: 2,
                updated: 0,
                connections: 1,
                events: 1,
            }
        );

        let ssh = Resource::load(&mut session, "ssh").unwrap();
        assert_eq!(ssh.get(&mut session, "address").unwrap(), json!("10.0.0.3"));
        assert_eq!(ssh.get(&mut session, "ports").unwrap(), json!([22]));

        let node = Resource::load(&mut session, "node1").unwrap();
        assert!(node.tags(&mut session).unwrap().contains("location=dc1"));
        assert!(!events::events_for(&mut session, "node1").unwrap().is_empty());
    }

    #[test]
    fn test_redefining_updates_only_changes() {
        let blueprint: Blueprint = toml::from_str(BLUEPRINT).unwrap();
        let mut session = Session::in_memory();
        apply(&mut session, &blueprint).unwrap();

        let changed: Blueprint = toml::from_str(&BLUEPRINT.replace("10.0.0.3", "10.0.0.4")).unwrap();
        let summary = apply(&mut session, &changed).unwrap();
        assert_eq!((summary.created, summary.updated), (0, 1));

        let ssh = Resource::load(&mut session, "ssh").unwrap();
        assert_eq!(ssh.get(&mut session, "address").unwrap(), json!("10.0.0.4"));
    }

    #[test]
    fn test_failed_blueprint_leaves_nothing_behind() {
        let blueprint: Blueprint = toml::from_str(
            r#"
[[resource]]
name = "a"
[resource.inputs]
x = 1

[[connection]]
emitter = "a"
receiver = "missing"
"#,
        )
        .unwrap();
        let mut session = Session::in_memory();
        let err = apply(&mut session, &blueprint).unwrap_err();
        assert!(err.to_string().contains("missing"));
        assert!(!session.exists(ResourceData::BUCKET, "a").unwrap());
    }
}
