//! Resources and their input graph
//!
//! A [`Resource`] is a named set of declared inputs. Inputs are either
//! assigned directly or wired to other resources' inputs; wiring is stored
//! as edge terms (see [`crate::codec`]) on the receiving resource's record.
//!
//! ## Wiring
//!
//! | Receiving kind | Strategy |
//! |---|---|
//! | same kind as the emitter, no sub-key | replace, copied as is |
//! | scalar | replace |
//! | sequence | append |
//! | mapping with sub-key | slot `(sub-key, tag)`, tag defaults to `single` |
//! | sequence of mappings with sub-key | slot `(sub-key, tag)`, tag defaults to the emitter |
//! | mapping without sub-key | replace |
//! | sequence of mappings without sub-key | append |
//! | computed | one entry per emitter input |

use crate::codec::{EMIT_INDEX, EdgeKey, EdgeSlot, KindPair, RECV_INDEX, emit_prefix, recv_prefix};
use crate::error::{Error, Result};
use crate::inputs::{InputKind, InputSchema, InputSlot, validate_name};
use crate::resolve;
use crate::session::{Model, Pin, Session};
use crate::types::{Connection, InputRef, ResourceState};
use keystore::{IndexEntry, IndexQuery};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Tag shared by untagged mapping edges
pub const DEFAULT_TAG: &str = "single";

// ============================================================================
// Stored model
// ============================================================================

/// Persisted body of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceData {
    pub name: String,
    #[serde(default)]
    pub handler: String,
    /// Action name to opaque action reference
    #[serde(default)]
    pub actions: BTreeMap<String, String>,
    #[serde(default)]
    pub base_path: Option<String>,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputSchema>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub state: ResourceState,
    /// Marker bumped on every change, see [`Session::next_marker`]
    #[serde(default)]
    pub updated: String,
}

impl Model for ResourceData {
    const BUCKET: &'static str = "resources";
    const FIELD_INDEXES: &'static [&'static str] = &["tags", "updated", "state"];

    fn key(&self) -> String {
        self.name.clone()
    }

    fn field_indexes(&self) -> Vec<IndexEntry> {
        let mut entries: Vec<IndexEntry> = self
            .tags
            .iter()
            .map(|t| IndexEntry::new("tags", t.as_str()))
            .collect();
        entries.push(IndexEntry::new("updated", self.updated.as_str()));
        entries.push(IndexEntry::new("state", self.state.as_str()));
        entries
    }
}

impl ResourceData {
    pub(crate) fn schema(&self, input: &str) -> Result<&InputSchema> {
        self.inputs
            .get(input)
            .ok_or_else(|| Error::unknown_input(&self.name, input))
    }
}

/// Builder for a new resource
#[derive(Debug, Clone, Default)]
pub struct ResourceSpec {
    pub name: String,
    pub handler: String,
    pub actions: BTreeMap<String, String>,
    pub base_path: Option<String>,
    pub inputs: BTreeMap<String, InputSchema>,
    pub tags: BTreeSet<String>,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = handler.into();
        self
    }

    pub fn action(mut self, name: impl Into<String>, reference: impl Into<String>) -> Self {
        self.actions.insert(name.into(), reference.into());
        self
    }

    pub fn base_path(mut self, path: impl Into<String>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    pub fn input(mut self, name: impl Into<String>, schema: InputSchema) -> Self {
        self.inputs.insert(name.into(), schema);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }
}

// ============================================================================
// Wiring strategies
// ============================================================================

/// How a new edge is written next to the receiver's existing edges
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wiring {
    /// Drop every edge into the input, then write this one
    Replace { passthrough: bool },
    /// Add next to the existing edges
    Append,
    /// Replace only the edge in the same `(sub-key, tag)` slot
    Slot(EdgeSlot),
    /// Replace only the edge from the same emitter input
    PerEmitter,
}

impl Wiring {
    /// Pick the strategy for wiring `other` into `my`
    pub fn select(my: InputKind, other: InputKind, slot: &InputSlot, emitter: &str) -> Result<Self> {
        if slot.subkey.is_some() && !my.accepts_slots() {
            return Err(Error::InvalidName {
                name: slot.to_string(),
                reason: format!("a {my} input has no sub-keys"),
            });
        }

        let wiring = match (&slot.subkey, my) {
            (None, _) if my == other => Self::Replace { passthrough: true },
            (_, InputKind::Scalar) => Self::Replace { passthrough: false },
            (_, InputKind::Sequence) => Self::Append,
            (Some(subkey), InputKind::Mapping) => Self::Slot(EdgeSlot {
                tag: slot.tag.clone().unwrap_or_else(|| DEFAULT_TAG.to_string()),
                subkey: subkey.clone(),
            }),
            (Some(subkey), InputKind::SequenceOfMappings) => Self::Slot(EdgeSlot {
                tag: slot.tag.clone().unwrap_or_else(|| emitter.to_string()),
                subkey: subkey.clone(),
            }),
            (None, InputKind::Mapping) => Self::Replace { passthrough: false },
            (None, InputKind::SequenceOfMappings) => Self::Append,
            (_, InputKind::Computed) => Self::PerEmitter,
        };
        Ok(wiring)
    }

    /// Whether an existing edge is superseded by `new` under this strategy
    fn supersedes(&self, existing: &EdgeKey, new: &EdgeKey) -> bool {
        match self {
            Self::Replace { .. } => true,
            Self::Append => existing.is_passthrough() || same_source(existing, new),
            Self::Slot(slot) => {
                existing.slot.as_ref() == Some(slot)
                    || (new.kinds.my == InputKind::SequenceOfMappings && existing.is_passthrough())
            }
            Self::PerEmitter => existing.is_passthrough() || same_source(existing, new),
        }
    }
}

fn same_source(a: &EdgeKey, b: &EdgeKey) -> bool {
    a.slot.is_none() && a.emitter == b.emitter && a.emitter_input == b.emitter_input
}

// ============================================================================
// Edge access
// ============================================================================

/// Edges feeding `input` of `receiver` (every input when `None`), in term order
pub(crate) fn incoming(session: &mut Session, receiver: &str, input: Option<&str>) -> Result<Vec<EdgeKey>> {
    let prefix = match input {
        Some(input) => recv_prefix(receiver, input),
        None => format!("{receiver}|"),
    };
    session
        .index_terms(ResourceData::BUCKET, receiver, RECV_INDEX, &prefix)?
        .iter()
        .map(|term| EdgeKey::decode_recv(term))
        .collect()
}

/// Edges fed by `emitter` (one input when given), found by an index scan
pub(crate) fn outgoing(session: &mut Session, emitter: &str, input: Option<&str>) -> Result<Vec<EdgeKey>> {
    let query = IndexQuery::prefix(ResourceData::BUCKET, EMIT_INDEX, &emit_prefix(emitter, input)).with_terms();
    let mut edges = session
        .scan(&query)?
        .into_iter()
        .filter_map(|m| m.term)
        .map(|term| EdgeKey::decode_emit(&term))
        .collect::<Result<Vec<_>>>()?;
    edges.sort();
    edges.dedup();
    Ok(edges)
}

fn write_edge(session: &mut Session, edge: &EdgeKey) -> Result<()> {
    session.add_index(ResourceData::BUCKET, &edge.receiver, RECV_INDEX, &edge.encode_recv())?;
    session.add_index(ResourceData::BUCKET, &edge.receiver, EMIT_INDEX, &edge.encode_emit())?;
    Ok(())
}

fn erase_edge(session: &mut Session, edge: &EdgeKey) -> Result<()> {
    session.remove_index(ResourceData::BUCKET, &edge.receiver, RECV_INDEX, &edge.encode_recv())?;
    session.remove_index(ResourceData::BUCKET, &edge.receiver, EMIT_INDEX, &edge.encode_emit())?;
    Ok(())
}

/// Save `name` with a fresh `updated` marker
fn bump(session: &mut Session, name: &str) -> Result<()> {
    let mut data = session.get::<ResourceData>(name)?;
    data.updated = session.next_marker();
    session.save(&data)
}

/// Bump every transitive receiver of `origin` and drop stale resolved values
fn propagate(session: &mut Session, origin: &InputRef) -> Result<()> {
    session.invalidate(origin);
    let mut seen = BTreeSet::from([origin.clone()]);
    let mut queue = vec![origin.clone()];
    while let Some(current) = queue.pop() {
        for edge in outgoing(session, &current.resource, Some(&current.input))? {
            let next = InputRef::new(edge.receiver.as_str(), edge.input.as_str());
            if seen.insert(next.clone()) {
                bump(session, &edge.receiver)?;
                session.invalidate(&next);
                queue.push(next);
            }
        }
    }
    Ok(())
}

/// Find a path by which `receiver` already feeds `emitter`
fn find_cycle(session: &mut Session, emitter: &InputRef, receiver: &InputRef) -> Result<Option<String>> {
    if emitter == receiver {
        return Ok(Some(format!("{receiver} -> {receiver}")));
    }

    let mut parent: HashMap<InputRef, InputRef> = HashMap::new();
    let mut queue = vec![emitter.clone()];
    while let Some(current) = queue.pop() {
        for edge in incoming(session, &current.resource, Some(&current.input))? {
            let upstream = InputRef::new(edge.emitter.as_str(), edge.emitter_input.as_str());
            if &upstream == receiver {
                // receiver feeds current, which feeds its way down to emitter
                let mut path = vec![receiver.to_string(), current.to_string()];
                let mut cursor = &current;
                while let Some(next) = parent.get(cursor) {
                    path.push(next.to_string());
                    cursor = next;
                }
                path.push(receiver.to_string());
                return Ok(Some(path.join(" -> ")));
            }
            if upstream != *emitter && !parent.contains_key(&upstream) {
                parent.insert(upstream.clone(), current.clone());
                queue.push(upstream);
            }
        }
    }
    Ok(None)
}

// ============================================================================
// Resource handle
// ============================================================================

/// Handle to a stored resource
///
/// The handle pins the resource's cached record in the session, so it is
/// never evicted while the handle is alive.
#[derive(Debug, Clone)]
pub struct Resource {
    name: String,
    _pin: Pin,
}

impl Resource {
    /// Store a new resource
    pub fn create(session: &mut Session, spec: ResourceSpec) -> Result<Self> {
        validate_name(&spec.name)?;
        for input in spec.inputs.keys() {
            validate_name(input)?;
        }

        let data = ResourceData {
            name: spec.name,
            handler: spec.handler,
            actions: spec.actions,
            base_path: spec.base_path,
            inputs: spec.inputs,
            tags: spec.tags,
            state: ResourceState::Created,
            updated: session.next_marker(),
        };
        session.create(&data)?;
        log::debug!("Created resource {}", data.name);
        Self::load(session, &data.name)
    }

    pub fn load(session: &mut Session, name: &str) -> Result<Self> {
        let pin = session.pin(ResourceData::BUCKET, name)?;
        Ok(Self {
            name: name.to_string(),
            _pin: pin,
        })
    }

    pub fn load_all(session: &mut Session) -> Result<Vec<Self>> {
        let names = session.keys(ResourceData::BUCKET)?;
        session.multi_get::<ResourceData>(&names)?;
        names.iter().map(|name| Self::load(session, name)).collect()
    }

    /// Resources carrying `tag`, sorted by name
    ///
    /// A `key=value` tag matches exactly. A bare `key` also matches every
    /// `key=<any value>` tag.
    pub fn by_tag(session: &mut Session, tag: &str) -> Result<Vec<Self>> {
        let mut names: BTreeSet<String> = session
            .filter(ResourceData::BUCKET, "tags", tag, tag)?
            .into_iter()
            .collect();
        if !tag.contains('=') {
            names.extend(session.filter_prefix(ResourceData::BUCKET, "tags", &format!("{tag}="))?);
        }
        names.iter().map(|name| Self::load(session, name)).collect()
    }

    /// Resources changed strictly after `marker`, oldest change first
    pub fn updated_after(session: &mut Session, marker: &str) -> Result<Vec<Self>> {
        let query = IndexQuery::from(ResourceData::BUCKET, "updated", marker).with_terms();
        let names: Vec<String> = session
            .scan(&query)?
            .into_iter()
            .filter(|m| m.term.as_deref().is_some_and(|t| t > marker))
            .map(|m| m.key)
            .collect();
        names.iter().map(|name| Self::load(session, name)).collect()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self, session: &mut Session) -> Result<ResourceData> {
        session.get(&self.name)
    }

    fn modify<F>(&self, session: &mut Session, f: F) -> Result<()>
    where
        F: FnOnce(&mut ResourceData) -> Result<()>,
    {
        let mut data = self.data(session)?;
        f(&mut data)?;
        data.updated = session.next_marker();
        session.save(&data)
    }

    fn input_ref(&self, input: &str) -> InputRef {
        InputRef::new(self.name.as_str(), input)
    }

    // ------------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------------

    pub fn add_input(&self, session: &mut Session, name: &str, schema: InputSchema) -> Result<()> {
        validate_name(name)?;
        self.modify(session, |data| {
            if data.inputs.contains_key(name) {
                return Err(Error::InputAlreadyExists {
                    resource: data.name.clone(),
                    input: name.to_string(),
                });
            }
            data.inputs.insert(name.to_string(), schema);
            Ok(())
        })
    }

    /// Drop an input together with every edge into or out of it
    pub fn remove_input(&self, session: &mut Session, name: &str) -> Result<()> {
        self.data(session)?.schema(name)?;
        for edge in incoming(session, &self.name, Some(name))? {
            erase_edge(session, &edge)?;
        }
        for edge in outgoing(session, &self.name, Some(name))? {
            erase_edge(session, &edge)?;
            bump(session, &edge.receiver)?;
            propagate(session, &InputRef::new(edge.receiver.as_str(), edge.input.as_str()))?;
        }
        self.modify(session, |data| {
            data.inputs.remove(name);
            Ok(())
        })?;
        propagate(session, &self.input_ref(name))
    }

    /// Assign a value directly
    ///
    /// Fails with [`Error::InputConnected`] while an edge drives the input.
    pub fn set(&self, session: &mut Session, input: &str, value: Value) -> Result<()> {
        self.update(session, Map::from_iter([(input.to_string(), value)]))
    }

    /// Assign several values at once; nothing is written if any is rejected
    pub fn update(&self, session: &mut Session, values: Map<String, Value>) -> Result<()> {
        let data = self.data(session)?;
        for input in values.keys() {
            data.schema(input)?;
            if !incoming(session, &self.name, Some(input))?.is_empty() {
                return Err(Error::InputConnected {
                    resource: self.name.clone(),
                    input: input.clone(),
                });
            }
        }

        let changed: Vec<String> = values.keys().cloned().collect();
        self.modify(session, |data| {
            for (input, value) in values {
                if let Some(schema) = data.inputs.get_mut(&input) {
                    schema.value = value;
                }
            }
            Ok(())
        })?;
        for input in changed {
            propagate(session, &self.input_ref(&input))?;
        }
        Ok(())
    }

    /// Resolved value of an input, following edges
    pub fn get(&self, session: &mut Session, input: &str) -> Result<Value> {
        resolve::resolve(session, &self.input_ref(input))
    }

    /// Resolved values of every input
    pub fn args(&self, session: &mut Session) -> Result<Map<String, Value>> {
        let data = self.data(session)?;
        let mut args = Map::new();
        for input in data.inputs.keys() {
            args.insert(input.clone(), self.get(session, input)?);
        }
        Ok(args)
    }

    pub fn kind_of(&self, session: &mut Session, input: &str) -> Result<InputKind> {
        Ok(self.data(session)?.schema(input)?.kind)
    }

    // ------------------------------------------------------------------------
    // Graph
    // ------------------------------------------------------------------------

    /// Wire `emitter.emitter_input` into `my_input`
    ///
    /// `my_input` may address a mapping slot as `input:subkey[|tag]`.
    pub fn connect(&self, session: &mut Session, my_input: &str, emitter: &str, emitter_input: &str) -> Result<()> {
        let slot = InputSlot::parse(my_input)?;
        let my_kind = self.data(session)?.schema(&slot.input)?.kind;
        let other_kind = session.get::<ResourceData>(emitter)?.schema(emitter_input)?.kind;
        let wiring = Wiring::select(my_kind, other_kind, &slot, emitter)?;

        let receiver_ref = self.input_ref(&slot.input);
        let emitter_ref = InputRef::new(emitter, emitter_input);
        if let Some(path) = find_cycle(session, &emitter_ref, &receiver_ref)? {
            return Err(Error::CycleDetected { path });
        }

        let edge = EdgeKey {
            receiver: self.name.clone(),
            input: slot.input.clone(),
            emitter: emitter.to_string(),
            emitter_input: emitter_input.to_string(),
            slot: match &wiring {
                Wiring::Slot(slot) => Some(slot.clone()),
                _ => None,
            },
            kinds: match &wiring {
                Wiring::Replace { passthrough: true } => KindPair::passthrough(),
                _ => KindPair::new(my_kind, other_kind),
            },
        };

        for existing in incoming(session, &self.name, Some(&slot.input))? {
            if wiring.supersedes(&existing, &edge) {
                erase_edge(session, &existing)?;
            }
        }
        write_edge(session, &edge)?;
        self.modify(session, |_| Ok(()))?;
        log::debug!("Connected {edge} ({wiring:?})");
        propagate(session, &receiver_ref)
    }

    /// Wire several inputs of `emitter` into this resource
    ///
    /// `pairs` lists `(emitter input, my input)`; when empty, every input name
    /// the two resources share is wired.
    pub fn connect_mapping(&self, session: &mut Session, emitter: &str, pairs: &[(&str, &str)]) -> Result<()> {
        let pairs: Vec<(String, String)> = if pairs.is_empty() {
            let mine = self.data(session)?.inputs;
            session
                .get::<ResourceData>(emitter)?
                .inputs
                .into_keys()
                .filter(|name| mine.contains_key(name))
                .map(|name| (name.clone(), name))
                .collect()
        } else {
            pairs
                .iter()
                .map(|(theirs, mine)| ((*theirs).to_string(), (*mine).to_string()))
                .collect()
        };
        for (theirs, mine) in pairs {
            self.connect(session, &mine, emitter, &theirs)?;
        }
        Ok(())
    }

    /// Remove edges into `input`, optionally only those from `emitter`
    ///
    /// `input` may address one slot as `input:subkey[|tag]`. Returns the
    /// number of edges removed. The input falls back to its directly
    /// assigned value.
    pub fn disconnect(&self, session: &mut Session, input: &str, emitter: Option<&str>) -> Result<usize> {
        let slot = InputSlot::parse(input)?;
        self.data(session)?.schema(&slot.input)?;
        let edges: Vec<EdgeKey> = incoming(session, &self.name, Some(&slot.input))?
            .into_iter()
            .filter(|e| emitter.is_none_or(|name| e.emitter == name))
            .filter(|e| match (&slot.subkey, &e.slot) {
                (None, _) => true,
                (Some(subkey), Some(edge_slot)) => {
                    edge_slot.subkey == *subkey && slot.tag.as_ref().is_none_or(|t| *t == edge_slot.tag)
                }
                (Some(_), None) => false,
            })
            .collect();
        self.remove_edges(session, &edges)
    }

    /// Remove the edge matching a flattened connection
    pub fn disconnect_connection(&self, session: &mut Session, connection: &Connection) -> Result<usize> {
        let edges: Vec<EdgeKey> = incoming(session, &self.name, None)?
            .into_iter()
            .filter(|e| e.connection() == *connection)
            .collect();
        self.remove_edges(session, &edges)
    }

    /// Remove every edge from `emitter` into this resource
    pub fn disconnect_from(&self, session: &mut Session, emitter: &str) -> Result<usize> {
        let edges: Vec<EdgeKey> = incoming(session, &self.name, None)?
            .into_iter()
            .filter(|e| e.emitter == emitter)
            .collect();
        self.remove_edges(session, &edges)
    }

    fn remove_edges(&self, session: &mut Session, edges: &[EdgeKey]) -> Result<usize> {
        if edges.is_empty() {
            return Ok(0);
        }
        let mut inputs = BTreeSet::new();
        for edge in edges {
            erase_edge(session, edge)?;
            inputs.insert(edge.input.clone());
            log::debug!("Disconnected {edge}");
        }
        self.modify(session, |_| Ok(()))?;
        for input in inputs {
            propagate(session, &self.input_ref(&input))?;
        }
        Ok(edges.len())
    }

    /// Edges feeding this resource, in term order
    pub fn connections(&self, session: &mut Session) -> Result<Vec<EdgeKey>> {
        incoming(session, &self.name, None)
    }

    /// Incoming connections in their sorted, flattened form
    pub fn connections_value(&self, session: &mut Session) -> Result<Value> {
        let mut connections: Vec<Connection> = self
            .connections(session)?
            .iter()
            .map(EdgeKey::connection)
            .collect();
        connections.sort();
        Ok(Value::Array(connections.iter().map(Connection::to_value).collect()))
    }

    /// Edges this resource feeds into other resources
    pub fn receivers(&self, session: &mut Session) -> Result<Vec<EdgeKey>> {
        outgoing(session, &self.name, None)
    }

    /// Names of the resources feeding this one
    pub fn emitters(&self, session: &mut Session) -> Result<Vec<String>> {
        let names: BTreeSet<String> = self
            .connections(session)?
            .into_iter()
            .map(|e| e.emitter)
            .collect();
        Ok(names.into_iter().collect())
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    pub fn state(&self, session: &mut Session) -> Result<ResourceState> {
        Ok(self.data(session)?.state)
    }

    /// Change the state without touching the `updated` marker
    fn set_state(&self, session: &mut Session, state: ResourceState) -> Result<()> {
        let mut data = self.data(session)?;
        data.state = state;
        session.save(&data)
    }

    pub fn set_operational(&self, session: &mut Session) -> Result<()> {
        self.set_state(session, ResourceState::Operational)
    }

    pub fn set_created(&self, session: &mut Session) -> Result<()> {
        self.set_state(session, ResourceState::Created)
    }

    pub fn set_error(&self, session: &mut Session) -> Result<()> {
        self.set_state(session, ResourceState::Error)
    }

    /// Mark for removal; the next staging cycle picks it up
    pub fn remove(&self, session: &mut Session) -> Result<()> {
        self.modify(session, |data| {
            data.state = ResourceState::Removed;
            Ok(())
        })?;
        log::debug!("Marked {} for removal", self.name);
        Ok(())
    }

    /// Delete the resource, first disconnecting it from every receiver
    pub fn delete(self, session: &mut Session) -> Result<()> {
        for edge in outgoing(session, &self.name, None)? {
            erase_edge(session, &edge)?;
            bump(session, &edge.receiver)?;
            propagate(session, &InputRef::new(edge.receiver.as_str(), edge.input.as_str()))?;
        }
        session.delete(ResourceData::BUCKET, &self.name)?;
        session.invalidate_resource(&self.name);
        log::debug!("Deleted resource {}", self.name);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Tags
    // ------------------------------------------------------------------------

    pub fn tags(&self, session: &mut Session) -> Result<BTreeSet<String>> {
        Ok(self.data(session)?.tags)
    }

    pub fn add_tags(&self, session: &mut Session, tags: &[&str]) -> Result<()> {
        self.modify(session, |data| {
            data.tags.extend(tags.iter().map(|t| (*t).to_string()));
            Ok(())
        })
    }

    pub fn remove_tags(&self, session: &mut Session, tags: &[&str]) -> Result<()> {
        self.modify(session, |data| {
            for tag in tags {
                data.tags.remove(*tag);
            }
            Ok(())
        })
    }

    pub fn updated(&self, session: &mut Session) -> Result<String> {
        Ok(self.data(session)?.updated)
    }
}
