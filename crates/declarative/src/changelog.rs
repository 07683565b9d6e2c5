//! Change log: staging, commit, revert and discard
//!
//! Every resource has at most one committed snapshot, the baseline staged
//! changes are diffed against. Staging compares each changed resource's
//! resolved inputs and sorted connections with its snapshot and records the
//! difference as a [`LogItem`]. Committing applies the item's diff to the
//! snapshot and moves the item to history.
//!
//! ```text
//! unchanged -> staged -> history (success | error)
//!              staged -> discarded
//! history -> reverted (a new staged item)
//! ```

use crate::diff::{self, Change};
use crate::error::{Error, Result};
use crate::inputs::InputSchema;
use crate::lock::with_lock;
use crate::resource::{Resource, ResourceData, ResourceSpec, incoming};
use crate::session::{Model, ObjectKey, Session};
use crate::types::{Connection, ResourceState};
use chrono::{DateTime, Utc};
use keystore::{IndexEntry, IndexQuery};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Lock serializing commit batches across sessions
pub const COMMIT_LOCK: &str = "changelog:commit";

const LOG_INDEX: &str = "log";
const RESOURCE_INDEX: &str = "resource";

// ============================================================================
// Models
// ============================================================================

/// What the orchestrator has to do for a staged change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Run,
    Update,
    Remove,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Update => "update",
            Self::Remove => "remove",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemState {
    Pending,
    Success,
    Error,
}

/// Partition of the log an item lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogName {
    Staged,
    History,
}

/// Definition needed to recreate a removed resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Definition {
    #[serde(default)]
    pub handler: String,
    #[serde(default)]
    pub actions: BTreeMap<String, String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputSchema>,
}

impl Definition {
    fn of(data: &ResourceData) -> Self {
        Self {
            handler: data.handler.clone(),
            actions: data.actions.clone(),
            inputs: data.inputs.clone(),
        }
    }
}

/// Last applied snapshot of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedResource {
    pub name: String,
    /// Resolved inputs as an object
    pub inputs: Value,
    /// Sorted flattened connections as an array
    pub connections: Value,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub base_path: Option<String>,
    pub state: ResourceState,
    pub definition: Definition,
}

impl Model for CommittedResource {
    const BUCKET: &'static str = "committed";

    fn key(&self) -> String {
        self.name.clone()
    }
}

/// One staged or historical change of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogItem {
    pub uid: String,
    pub resource: String,
    pub action: Action,
    /// Changes from the committed inputs to the live ones
    pub diff: Vec<Change>,
    /// Changes from the committed connections to the live ones
    pub connections_diff: Vec<Change>,
    pub state: ItemState,
    pub log: LogName,
    /// Marker taken when the item was staged
    pub staged_at: String,
    /// Position in history, counted from one
    #[serde(default)]
    pub history_order: Option<u64>,
    /// `updated` marker of the resource when the item was staged
    pub updated: String,
    #[serde(default)]
    pub base_path: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Model for LogItem {
    const BUCKET: &'static str = "log_items";
    const FIELD_INDEXES: &'static [&'static str] = &[LOG_INDEX, RESOURCE_INDEX];

    fn key(&self) -> String {
        self.uid.clone()
    }

    fn field_indexes(&self) -> Vec<IndexEntry> {
        vec![
            IndexEntry::new(LOG_INDEX, self.log_term()),
            IndexEntry::new(RESOURCE_INDEX, self.resource.as_str()),
        ]
    }
}

impl LogItem {
    /// Staged items sort oldest first, history newest first
    fn log_term(&self) -> String {
        match self.log {
            LogName::Staged => format!("staged|{}|{}", self.staged_at, self.uid),
            LogName::History => {
                let order = u64::MAX - self.history_order.unwrap_or(0);
                format!("history|{order:020}|{}", self.uid)
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.diff.is_empty() && self.connections_diff.is_empty()
    }

    fn same_change(&self, other: &Self) -> bool {
        self.action == other.action && self.diff == other.diff && self.connections_diff == other.connections_diff
    }
}

impl fmt::Display for LogItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self.state {
            ItemState::Error => "[ERROR]",
            ItemState::Success | ItemState::Pending => "[OK]",
        };
        write!(f, "{status} {} {}.{}", self.uid, self.resource, self.action)
    }
}

/// Staging progress shared by every session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Watermark {
    /// Greatest `updated` marker already staged
    pub processed: String,
    /// Last history position handed out
    pub history_seq: u64,
}

impl Model for Watermark {
    const BUCKET: &'static str = "system";

    fn key(&self) -> String {
        "changelog".to_string()
    }
}

fn watermark(session: &mut Session) -> Result<Watermark> {
    Ok(session.try_get::<Watermark>("changelog")?.unwrap_or_default())
}

// ============================================================================
// Queries
// ============================================================================

/// Load one log item; fails with [`Error::CannotFindId`] when absent
pub fn item(session: &mut Session, uid: &str) -> Result<LogItem> {
    session
        .try_get::<LogItem>(uid)?
        .ok_or_else(|| Error::CannotFindId { uid: uid.to_string() })
}

fn scan_log(session: &mut Session, prefix: &str, limit: Option<usize>) -> Result<Vec<LogItem>> {
    let mut query = IndexQuery::prefix(LogItem::BUCKET, LOG_INDEX, prefix);
    if let Some(limit) = limit {
        query = query.limit(limit);
    }
    let mut seen = BTreeSet::new();
    let uids: Vec<String> = session
        .scan(&query)?
        .into_iter()
        .map(|m| m.key)
        .filter(|uid| seen.insert(uid.clone()))
        .collect();
    session.multi_get(&uids)
}

/// Staged items, oldest first
pub fn staged(session: &mut Session) -> Result<Vec<LogItem>> {
    scan_log(session, "staged|", None)
}

/// History items, newest first
pub fn history(session: &mut Session, limit: Option<usize>) -> Result<Vec<LogItem>> {
    scan_log(session, "history|", limit)
}

fn staged_for(session: &mut Session, resource: &str) -> Result<Vec<LogItem>> {
    let uids = session.filter(LogItem::BUCKET, RESOURCE_INDEX, resource, resource)?;
    Ok(session
        .multi_get::<LogItem>(&uids)?
        .into_iter()
        .filter(|item| item.log == LogName::Staged)
        .collect())
}

// ============================================================================
// Staging
// ============================================================================

/// Stage every resource changed since the last call
///
/// Returns the items staged by this call. Calling it again without any
/// intervening change stages nothing.
pub fn stage(session: &mut Session) -> Result<Vec<LogItem>> {
    let mut mark = watermark(session)?;
    let changed = Resource::updated_after(session, &mark.processed)?;
    log::debug!("{} resources changed since {}", changed.len(), mark.processed);

    let mut items = Vec::new();
    for resource in changed {
        let updated = resource.updated(session)?;
        if let Some(item) = stage_resource(session, resource.name())? {
            items.push(item);
        }
        if updated > mark.processed {
            mark.processed = updated;
        }
    }
    session.save(&mark)?;
    Ok(items)
}

/// Stage one resource, whatever its `updated` marker
///
/// A previous staged item for the resource is replaced, unless it already
/// describes the same change, in which case it is returned unchanged.
pub fn stage_resource(session: &mut Session, name: &str) -> Result<Option<LogItem>> {
    let resource = Resource::load(session, name)?;
    let data = resource.data(session)?;
    let committed = session.try_get::<CommittedResource>(name)?;
    let live_inputs = Value::Object(resource.args(session)?);
    let live_connections = resource.connections_value(session)?;

    let operational = committed
        .as_ref()
        .filter(|c| c.state == ResourceState::Operational);
    let (action, diff, connections_diff) = match (operational, data.state) {
        (Some(c), ResourceState::Removed) => (
            Action::Remove,
            diff::diff(&c.inputs, &empty_object()),
            diff::diff(&c.connections, &empty_array()),
        ),
        (None, ResourceState::Removed) => {
            log::debug!("{name} was never committed, nothing to remove");
            return replace_staged(session, name, None);
        }
        (None, _) => (
            Action::Run,
            diff::diff(&empty_object(), &live_inputs),
            diff::diff(&empty_array(), &live_connections),
        ),
        (Some(c), _) => {
            let diff = diff::diff(&c.inputs, &live_inputs);
            let connections_diff = diff::diff(&c.connections, &live_connections);
            if diff.is_empty() && connections_diff.is_empty() {
                return replace_staged(session, name, None);
            }
            (Action::Update, diff, connections_diff)
        }
    };

    let item = LogItem {
        uid: uuid::Uuid::new_v4().to_string(),
        resource: name.to_string(),
        action,
        diff,
        connections_diff,
        state: ItemState::Pending,
        log: LogName::Staged,
        staged_at: session.next_marker(),
        history_order: None,
        updated: data.updated,
        base_path: data.base_path,
        created_at: Utc::now(),
        error: None,
    };
    replace_staged(session, name, Some(item))
}

fn replace_staged(session: &mut Session, name: &str, item: Option<LogItem>) -> Result<Option<LogItem>> {
    for existing in staged_for(session, name)? {
        if let Some(new) = &item
            && existing.same_change(new)
        {
            return Ok(Some(existing));
        }
        log::debug!("Dropping superseded staged item {}", existing.uid);
        session.delete(LogItem::BUCKET, &existing.uid)?;
    }
    if let Some(item) = &item {
        session.save(item)?;
        log::info!("Staged {} {} ({})", item.action, item.resource, item.uid);
    }
    Ok(item)
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

fn empty_array() -> Value {
    Value::Array(Vec::new())
}

// ============================================================================
// Commit
// ============================================================================

/// Outcome reported by the orchestrator for a staged item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error(String),
}

/// One item a commit batch could not commit
#[derive(Debug)]
pub struct FailedCommit {
    pub uid: String,
    /// Resource of the item, or the uid when the item could not be loaded
    pub resource: String,
    pub error: Error,
    /// Set when the failure itself could not be written to history
    pub record_error: Option<Error>,
}

/// Result of a commit batch
#[derive(Debug, Default)]
pub struct CommitReport {
    pub committed: Vec<LogItem>,
    pub failed: Vec<FailedCommit>,
}

impl CommitReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Commit one staged item
pub fn commit(session: &mut Session, uid: &str) -> Result<LogItem> {
    let mut report = commit_all(session, &[uid.to_string()])?;
    if let Some(failure) = report.failed.pop() {
        return Err(failure.error);
    }
    report
        .committed
        .pop()
        .ok_or_else(|| Error::CannotFindId { uid: uid.to_string() })
}

/// Commit several staged items under the commit lock
///
/// Items are independent: a failure marks that item and its resource as
/// errored and the batch goes on.
pub fn commit_all(session: &mut Session, uids: &[String]) -> Result<CommitReport> {
    let identity = session.id().to_string();
    let options = session.options().lock.clone();
    with_lock(session, COMMIT_LOCK, &identity, &options, |session| {
        let mut report = CommitReport::default();
        for uid in uids {
            match commit_item(session, uid) {
                Ok(item) => report.committed.push(item),
                Err(err) => {
                    log::warn!("Commit of {uid} failed: {err}");
                    let mut failure = FailedCommit {
                        uid: uid.clone(),
                        resource: uid.clone(),
                        error: err,
                        record_error: None,
                    };
                    if let Ok(staged) = item(session, uid) {
                        failure.resource.clone_from(&staged.resource);
                        if staged.log == LogName::Staged
                            && let Err(record_err) = fail_item(session, staged, &failure.error.to_string())
                        {
                            log::error!("Could not record the failure of {uid}: {record_err}");
                            failure.record_error = Some(record_err);
                        }
                    }
                    report.failed.push(failure);
                }
            }
        }
        Ok(report)
    })
}

fn commit_item(session: &mut Session, uid: &str) -> Result<LogItem> {
    let mut item = item(session, uid)?;
    if item.log != LogName::Staged {
        return Err(Error::NotStaged { uid: uid.to_string() });
    }

    let committed = session.try_get::<CommittedResource>(&item.resource)?;
    let (base_inputs, base_connections) = match &committed {
        Some(c) if !(item.action == Action::Run && c.state == ResourceState::Removed) => {
            (c.inputs.clone(), c.connections.clone())
        }
        _ => (empty_object(), empty_array()),
    };
    let inputs = diff::patch(&item.diff, &base_inputs)?;
    let connections = diff::patch(&item.connections_diff, &base_connections)?;

    let live = session.try_get::<ResourceData>(&item.resource)?;
    let (definition, tags, base_path) = match (&live, &committed) {
        (Some(data), _) => (Definition::of(data), data.tags.clone(), data.base_path.clone()),
        (None, Some(c)) => (c.definition.clone(), c.tags.clone(), c.base_path.clone()),
        (None, None) => return Err(Error::not_found(ResourceData::BUCKET, &item.resource)),
    };
    let state = match item.action {
        Action::Run | Action::Update => ResourceState::Operational,
        Action::Remove => ResourceState::Removed,
    };
    let snapshot = CommittedResource {
        name: item.resource.clone(),
        inputs,
        connections,
        tags,
        base_path,
        state,
        definition,
    };

    // Commit time ordering follows the resource's latest write
    if let Some(data) = &live {
        item.updated.clone_from(&data.updated);
    }
    match (item.action, live) {
        (Action::Remove, Some(_)) => Resource::load(session, &item.resource)?.delete(session)?,
        (Action::Remove, None) => {}
        (_, Some(_)) => Resource::load(session, &item.resource)?.set_operational(session)?,
        (_, None) => return Err(Error::not_found(ResourceData::BUCKET, &item.resource)),
    }
    session.save(&snapshot)?;

    item.state = ItemState::Success;
    move_to_history(session, &mut item)?;
    log::info!("Committed {} {}", item.action, item.resource);
    Ok(item)
}

fn fail_item(session: &mut Session, mut item: LogItem, message: &str) -> Result<()> {
    if let Some(resource) = session.try_get::<ResourceData>(&item.resource)? {
        Resource::load(session, &resource.name)?.set_error(session)?;
    }
    item.state = ItemState::Error;
    item.error = Some(message.to_string());
    move_to_history(session, &mut item)
}

fn move_to_history(session: &mut Session, item: &mut LogItem) -> Result<()> {
    let mut mark = watermark(session)?;
    mark.history_seq += 1;
    session.save(&mark)?;

    item.log = LogName::History;
    item.history_order = Some(mark.history_seq);
    session.save(item)
}

/// Record the orchestrator's outcome for a staged item
pub fn report(session: &mut Session, uid: &str, outcome: Outcome) -> Result<LogItem> {
    match outcome {
        Outcome::Success => commit(session, uid),
        Outcome::Error(message) => {
            let staged = item(session, uid)?;
            if staged.log != LogName::Staged {
                return Err(Error::NotStaged { uid: uid.to_string() });
            }
            log::warn!("{}: {message}", staged.resource);
            fail_item(session, staged, &message)?;
            item(session, uid)
        }
    }
}

// ============================================================================
// Revert and discard
// ============================================================================

/// Undo a history item on the live resource and stage the reversal
///
/// The inverse of the item's diff is applied to the current live state.
/// Returns the new staged item, if the reversal left anything to stage.
pub fn revert(session: &mut Session, uid: &str) -> Result<Option<LogItem>> {
    let item = item(session, uid)?;
    if item.log != LogName::History {
        return Err(Error::NotInHistory { uid: uid.to_string() });
    }

    match item.action {
        Action::Run => Resource::load(session, &item.resource)?.remove(session)?,
        Action::Update => {
            let resource = Resource::load(session, &item.resource)?;
            let live_inputs = Value::Object(resource.args(session)?);
            let live_connections = resource.connections_value(session)?;
            let inputs = diff::revert(&item.diff, &live_inputs)?;
            let connections = diff::revert(&item.connections_diff, &live_connections)?;
            apply_target(session, &item.resource, &inputs, &connections, false)?;
        }
        Action::Remove => {
            let committed = session
                .try_get::<CommittedResource>(&item.resource)?
                .ok_or_else(|| Error::not_found(CommittedResource::BUCKET, &item.resource))?;
            let inputs = diff::revert(&item.diff, &empty_object())?;
            let connections = diff::revert(&item.connections_diff, &empty_array())?;
            apply_target(session, &item.resource, &inputs, &connections, true)?;
            log::debug!("Recreated {} from its {} snapshot", item.resource, committed.state);
        }
    }
    log::info!("Reverted {} {} ({uid})", item.action, item.resource);
    stage_resource(session, &item.resource)
}

/// Undo a staged item on the live resource and drop it
pub fn discard(session: &mut Session, uid: &str) -> Result<()> {
    let item = item(session, uid)?;
    if item.log != LogName::Staged {
        return Err(Error::NotStaged { uid: uid.to_string() });
    }

    match item.action {
        Action::Run => {
            if session.exists(ResourceData::BUCKET, &item.resource)? {
                Resource::load(session, &item.resource)?.delete(session)?;
            }
        }
        Action::Remove => Resource::load(session, &item.resource)?.set_operational(session)?,
        Action::Update => {
            let committed = session
                .try_get::<CommittedResource>(&item.resource)?
                .ok_or_else(|| Error::not_found(CommittedResource::BUCKET, &item.resource))?;
            apply_target(
                session,
                &item.resource,
                &committed.inputs,
                &committed.connections,
                false,
            )?;
        }
    }
    session.delete(LogItem::BUCKET, uid)?;
    log::info!("Discarded {} {} ({uid})", item.action, item.resource);
    Ok(())
}

/// Discard every staged item; returns how many were discarded
pub fn discard_all(session: &mut Session) -> Result<usize> {
    let items = staged(session)?;
    for item in &items {
        discard(session, &item.uid)?;
    }
    Ok(items.len())
}

/// Drive the live resource to the given inputs and connections
///
/// Connections are applied first, then the inputs not driven by one. On
/// failure the resource record is restored, so the change is all or nothing.
fn apply_target(
    session: &mut Session,
    name: &str,
    inputs: &Value,
    connections: &Value,
    recreate: bool,
) -> Result<()> {
    let checkpoint = session.checkpoint(&[ObjectKey::of::<ResourceData>(name)])?;
    match drive(session, name, inputs, connections, recreate) {
        Ok(()) => Ok(()),
        Err(err) => {
            log::warn!("Rolling back {name}: {err}");
            session.restore(checkpoint)?;
            Err(err)
        }
    }
}

fn drive(session: &mut Session, name: &str, inputs: &Value, connections: &Value, recreate: bool) -> Result<()> {
    if recreate {
        let committed = session
            .get::<CommittedResource>(name)?;
        let mut spec = ResourceSpec::new(name).handler(committed.definition.handler.as_str());
        spec.actions = committed.definition.actions;
        spec.inputs = committed.definition.inputs;
        spec.tags = committed.tags;
        spec.base_path = committed.base_path;
        Resource::create(session, spec)?;
    }
    let resource = Resource::load(session, name)?;

    let target: BTreeSet<Connection> = connections
        .as_array()
        .ok_or_else(|| Error::patch(format!("connections of {name} are not an array")))?
        .iter()
        .map(|c| Connection::from_value(c).ok_or_else(|| Error::patch(format!("bad connection {c}"))))
        .collect::<Result<_>>()?;
    let current: BTreeSet<Connection> = resource
        .connections(session)?
        .iter()
        .map(|edge| edge.connection())
        .collect();
    for connection in current.difference(&target) {
        resource.disconnect_connection(session, connection)?;
    }
    for connection in target.difference(&current) {
        resource.connect(
            session,
            &connection.receiver_input,
            &connection.emitter,
            &connection.emitter_input,
        )?;
    }

    let inputs = inputs
        .as_object()
        .ok_or_else(|| Error::patch(format!("inputs of {name} are not an object")))?;
    let declared = resource.data(session)?.inputs;
    let mut values = Map::new();
    for (input, value) in inputs {
        if !declared.contains_key(input) {
            log::warn!("{name}: skipping undeclared input '{input}'");
            continue;
        }
        if !incoming(session, name, Some(input))?.is_empty() {
            continue;
        }
        if resource.get(session, input)? != *value {
            values.insert(input.clone(), value.clone());
        }
    }
    if !values.is_empty() {
        resource.update(session, values)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionOptions;
    use crate::testing::RefusingStore;
    use serde_json::json;
    use std::sync::Arc;

    fn node(session: &mut Session, name: &str, ip: &str) -> Resource {
        Resource::create(
            session,
            ResourceSpec::new(name)
                .handler("shell")
                .input("ip", InputSchema::scalar(json!(ip)))
                .input("port", InputSchema::scalar(json!(22))),
        )
        .unwrap()
    }

    /// A snapshot the staged diff cannot apply to
    fn unpatchable_snapshot(session: &mut Session, name: &str) {
        session
            .save(&CommittedResource {
                name: name.into(),
                inputs: json!("garbage"),
                connections: json!([]),
                tags: BTreeSet::new(),
                base_path: None,
                state: ResourceState::Operational,
                definition: Definition {
                    handler: String::new(),
                    actions: BTreeMap::new(),
                    inputs: BTreeMap::new(),
                },
            })
            .unwrap();
    }

    fn commit_staged(session: &mut Session) -> CommitReport {
        let uids: Vec<String> = staged(session).unwrap().into_iter().map(|i| i.uid).collect();
        commit_all(session, &uids).unwrap()
    }

    #[test]
    fn test_stage_is_minimal() {
        let mut session = Session::in_memory();
        node(&mut session, "n1", "10.0.0.1");
        node(&mut session, "n2", "10.0.0.2");

        let items = stage(&mut session).unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.action == Action::Run));
        assert!(stage(&mut session).unwrap().is_empty());
        assert_eq!(staged(&mut session).unwrap().len(), 2);
    }

    #[test]
    fn test_commit_then_update() {
        let mut session = Session::in_memory();
        let n = node(&mut session, "n1", "10.0.0.1");
        stage(&mut session).unwrap();
        assert!(commit_staged(&mut session).is_success());
        assert_eq!(n.state(&mut session).unwrap(), ResourceState::Operational);

        let committed = session.get::<CommittedResource>("n1").unwrap();
        assert_eq!(committed.inputs, json!({"ip": "10.0.0.1", "port": 22}));

        // Committing changes nothing that needs staging
        assert!(stage(&mut session).unwrap().is_empty());

        n.set(&mut session, "ip", json!("10.0.0.9")).unwrap();
        let items = stage(&mut session).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action, Action::Update);
        assert_eq!(items[0].diff.len(), 1);
    }

    #[test]
    fn test_restaging_replaces_the_staged_item() {
        let mut session = Session::in_memory();
        let n = node(&mut session, "n1", "a");
        let first = stage(&mut session).unwrap().remove(0);
        assert_eq!(stage_resource(&mut session, "n1").unwrap().unwrap().uid, first.uid);

        n.set(&mut session, "ip", json!("b")).unwrap();
        let second = stage(&mut session).unwrap().remove(0);
        assert_ne!(second.uid, first.uid);
        let uids: Vec<String> = staged(&mut session).unwrap().into_iter().map(|i| i.uid).collect();
        assert_eq!(uids, vec![second.uid]);
        assert!(matches!(
            item(&mut session, &first.uid),
            Err(Error::CannotFindId { .. })
        ));
    }

    #[test]
    fn test_connection_changes_are_staged() {
        let mut session = Session::in_memory();
        let a = node(&mut session, "a", "1");
        let b = node(&mut session, "b", "2");
        stage(&mut session).unwrap();
        commit_staged(&mut session);

        b.connect(&mut session, "ip", a.name(), "ip").unwrap();
        let items = stage(&mut session).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].resource, "b");
        assert!(!items[0].connections_diff.is_empty());
    }

    #[test]
    fn test_commit_partial_failure() {
        let mut session = Session::in_memory();
        node(&mut session, "good", "1");
        node(&mut session, "bad", "2");
        stage(&mut session).unwrap();

        unpatchable_snapshot(&mut session, "bad");

        let report = commit_staged(&mut session);
        assert_eq!(report.committed.len(), 1);
        assert_eq!(report.committed[0].resource, "good");
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].resource, "bad");
        assert!(report.failed[0].record_error.is_none());

        let bad = Resource::load(&mut session, "bad").unwrap();
        assert_eq!(bad.state(&mut session).unwrap(), ResourceState::Error);
        let history = history(&mut session, None).unwrap();
        assert_eq!(history.len(), 2);
        let failed = history.iter().find(|i| i.resource == "bad").unwrap();
        assert_eq!(failed.state, ItemState::Error);
        assert!(failed.error.is_some());
        assert!(failed.to_string().starts_with("[ERROR]"));
        assert!(staged(&mut session).unwrap().is_empty());
    }

    #[test]
    fn test_unrecordable_failure_does_not_stop_the_batch() {
        let store = Arc::new(RefusingStore::new());
        let mut session = Session::new(store.clone(), SessionOptions::default());
        node(&mut session, "bad", "1");
        node(&mut session, "good", "2");
        stage(&mut session).unwrap();
        unpatchable_snapshot(&mut session, "bad");
        store.refuse(ResourceData::BUCKET, "bad");

        let report = commit_staged(&mut session);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].resource, "bad");
        assert!(report.failed[0].record_error.is_some());
        assert_eq!(report.committed.len(), 1);
        assert_eq!(report.committed[0].resource, "good");
    }

    #[test]
    fn test_commit_records_latest_updated_marker() {
        let mut session = Session::in_memory();
        let n = node(&mut session, "n1", "10.0.0.1");
        let staged_item = stage(&mut session).unwrap().remove(0);

        n.set(&mut session, "port", json!(2222)).unwrap();
        let latest = n.updated(&mut session).unwrap();
        assert!(latest > staged_item.updated);

        let committed = commit(&mut session, &staged_item.uid).unwrap();
        assert_eq!(committed.updated, latest);
        assert_eq!(item(&mut session, &staged_item.uid).unwrap().updated, latest);
    }

    #[test]
    fn test_history_is_newest_first() {
        let mut session = Session::in_memory();
        let n = node(&mut session, "n", "1");
        for ip in ["2", "3"] {
            stage(&mut session).unwrap();
            commit_staged(&mut session);
            n.set(&mut session, "ip", json!(ip)).unwrap();
        }
        stage(&mut session).unwrap();
        commit_staged(&mut session);

        let all = history(&mut session, None).unwrap();
        let orders: Vec<u64> = all.iter().filter_map(|i| i.history_order).collect();
        assert_eq!(orders, vec![3, 2, 1]);
        assert_eq!(history(&mut session, Some(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_revert_update_restores_previous_inputs() {
        let mut session = Session::in_memory();
        let n = node(&mut session, "n", "old");
        stage(&mut session).unwrap();
        commit_staged(&mut session);

        n.set(&mut session, "ip", json!("new")).unwrap();
        let update = stage(&mut session).unwrap().remove(0);
        commit(&mut session, &update.uid).unwrap();

        let reverted = revert(&mut session, &update.uid).unwrap().unwrap();
        assert_eq!(reverted.action, Action::Update);
        assert_eq!(n.get(&mut session, "ip").unwrap(), json!("old"));
        assert_eq!(reverted.diff, diff::swap(&update.diff));

        assert!(matches!(
            revert(&mut session, &reverted.uid),
            Err(Error::NotInHistory { .. })
        ));
    }

    #[test]
    fn test_revert_update_restores_connections() {
        let mut session = Session::in_memory();
        let a = node(&mut session, "a", "1");
        let b = node(&mut session, "b", "2");
        stage(&mut session).unwrap();
        commit_staged(&mut session);

        b.connect(&mut session, "ip", a.name(), "ip").unwrap();
        let update = stage(&mut session).unwrap().remove(0);
        commit(&mut session, &update.uid).unwrap();

        revert(&mut session, &update.uid).unwrap();
        assert!(b.connections(&mut session).unwrap().is_empty());
        assert_eq!(b.get(&mut session, "ip").unwrap(), json!("2"));
    }

    #[test]
    fn test_revert_run_stages_removal() {
        let mut session = Session::in_memory();
        node(&mut session, "n", "1");
        let run = stage(&mut session).unwrap().remove(0);
        commit(&mut session, &run.uid).unwrap();

        let removal = revert(&mut session, &run.uid).unwrap().unwrap();
        assert_eq!(removal.action, Action::Remove);
        commit(&mut session, &removal.uid).unwrap();
        assert!(!session.exists(ResourceData::BUCKET, "n").unwrap());
        let committed = session.get::<CommittedResource>("n").unwrap();
        assert_eq!(committed.state, ResourceState::Removed);
    }

    #[test]
    fn test_revert_remove_recreates_resource() {
        let mut session = Session::in_memory();
        let a = node(&mut session, "a", "1");
        let b = node(&mut session, "b", "2");
        b.connect(&mut session, "ip", a.name(), "ip").unwrap();
        b.set(&mut session, "port", json!(8080)).unwrap();
        stage(&mut session).unwrap();
        commit_staged(&mut session);

        b.remove(&mut session).unwrap();
        let removal = stage(&mut session).unwrap().remove(0);
        assert_eq!(removal.action, Action::Remove);
        commit(&mut session, &removal.uid).unwrap();
        drop(b);
        assert!(!session.exists(ResourceData::BUCKET, "b").unwrap());

        let run = revert(&mut session, &removal.uid).unwrap().unwrap();
        assert_eq!(run.action, Action::Run);
        let b = Resource::load(&mut session, "b").unwrap();
        assert_eq!(b.get(&mut session, "port").unwrap(), json!(8080));
        assert_eq!(b.get(&mut session, "ip").unwrap(), json!("1"));
        assert_eq!(b.connections(&mut session).unwrap().len(), 1);
    }

    #[test]
    fn test_discard_run_deletes_resource() {
        let mut session = Session::in_memory();
        node(&mut session, "n", "1");
        let run = stage(&mut session).unwrap().remove(0);
        discard(&mut session, &run.uid).unwrap();
        assert!(!session.exists(ResourceData::BUCKET, "n").unwrap());
        assert!(staged(&mut session).unwrap().is_empty());
        assert!(history(&mut session, None).unwrap().is_empty());
    }

    #[test]
    fn test_discard_update_restores_committed_state() {
        let mut session = Session::in_memory();
        let n = node(&mut session, "n", "1");
        stage(&mut session).unwrap();
        commit_staged(&mut session);

        n.set(&mut session, "ip", json!("2")).unwrap();
        let update = stage(&mut session).unwrap().remove(0);
        discard(&mut session, &update.uid).unwrap();
        assert_eq!(n.get(&mut session, "ip").unwrap(), json!("1"));
        // The undo itself leaves nothing to stage
        assert!(stage(&mut session).unwrap().is_empty());

        n.remove(&mut session).unwrap();
        let removal = stage(&mut session).unwrap().remove(0);
        assert_eq!(discard_all(&mut session).unwrap(), 1);
        assert_eq!(n.state(&mut session).unwrap(), ResourceState::Operational);
        assert!(matches!(
            discard(&mut session, &removal.uid),
            Err(Error::CannotFindId { .. })
        ));
    }

    #[test]
    fn test_orchestrator_error_report() {
        let mut session = Session::in_memory();
        let n = node(&mut session, "n", "1");
        let run = stage(&mut session).unwrap().remove(0);
        let failed = report(&mut session, &run.uid, Outcome::Error("boom".into())).unwrap();
        assert_eq!(failed.state, ItemState::Error);
        assert_eq!(failed.log, LogName::History);
        assert_eq!(n.state(&mut session).unwrap(), ResourceState::Error);
        assert!(session.try_get::<CommittedResource>("n").unwrap().is_none());
    }
}
