//! Event rules and execution graph expansion
//!
//! Rules connect `resource:action` nodes. A [`EventKind::Dependency`] rule
//! only orders two nodes that are both part of the cycle; a
//! [`EventKind::Reaction`] rule also pulls its child into the cycle.
//!
//! [`build`] expands the staged nodes with reactions until nothing new is
//! added, then lays dependency edges over the final node set and rejects
//! cyclic graphs. The result is handed to an external orchestrator.

use crate::changelog;
use crate::error::{Error, Result};
use crate::session::{Model, Session};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

// ============================================================================
// Rules
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Ordering only
    Dependency,
    /// Ordering, and the child joins the cycle
    Reaction,
}

/// Parent outcome that triggers the child
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeState {
    #[default]
    Success,
    Error,
}

impl fmt::Display for EdgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// `parent:parent_action -> state -> child:child_action`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventRule {
    pub kind: EventKind,
    pub parent: String,
    pub parent_action: String,
    #[serde(default)]
    pub state: EdgeState,
    pub child: String,
    pub child_action: String,
}

impl EventRule {
    pub fn dependency(parent: &str, parent_action: &str, child: &str, child_action: &str) -> Self {
        Self::new(EventKind::Dependency, parent, parent_action, child, child_action)
    }

    pub fn reaction(parent: &str, parent_action: &str, child: &str, child_action: &str) -> Self {
        Self::new(EventKind::Reaction, parent, parent_action, child, child_action)
    }

    fn new(kind: EventKind, parent: &str, parent_action: &str, child: &str, child_action: &str) -> Self {
        Self {
            kind,
            parent: parent.to_string(),
            parent_action: parent_action.to_string(),
            state: EdgeState::Success,
            child: child.to_string(),
            child_action: child_action.to_string(),
        }
    }

    /// Trigger on `state` instead of success
    pub fn on(mut self, state: EdgeState) -> Self {
        self.state = state;
        self
    }

    pub fn parent_node(&self) -> NodeId {
        NodeId::new(&self.parent, &self.parent_action)
    }

    pub fn child_node(&self) -> NodeId {
        NodeId::new(&self.child, &self.child_action)
    }

    fn edge(&self) -> GraphEdge {
        GraphEdge {
            from: self.parent_node(),
            to: self.child_node(),
            state: self.state,
        }
    }
}

impl fmt::Display for EventRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arrow = match self.kind {
            EventKind::Dependency => "->",
            EventKind::Reaction => "=>",
        };
        write!(
            f,
            "{} {arrow} {} {arrow} {}",
            self.parent_node(),
            self.state,
            self.child_node()
        )
    }
}

/// Rules keyed by their parent resource
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventSet {
    pub resource: String,
    pub rules: BTreeSet<EventRule>,
}

impl Model for EventSet {
    const BUCKET: &'static str = "events";

    fn key(&self) -> String {
        self.resource.clone()
    }
}

fn event_set(session: &mut Session, resource: &str) -> Result<EventSet> {
    Ok(session
        .try_get::<EventSet>(resource)?
        .unwrap_or_else(|| EventSet {
            resource: resource.to_string(),
            rules: BTreeSet::new(),
        }))
}

/// Store a rule; returns false if it was already stored
pub fn add_event(session: &mut Session, rule: EventRule) -> Result<bool> {
    let mut set = event_set(session, &rule.parent)?;
    let display = rule.to_string();
    if !set.rules.insert(rule) {
        return Ok(false);
    }
    session.save(&set)?;
    log::debug!("Added event {display}");
    Ok(true)
}

pub fn add_events(session: &mut Session, rules: impl IntoIterator<Item = EventRule>) -> Result<usize> {
    let mut added = 0;
    for rule in rules {
        if add_event(session, rule)? {
            added += 1;
        }
    }
    Ok(added)
}

/// Drop a rule; returns false if it was not stored
pub fn remove_event(session: &mut Session, rule: &EventRule) -> Result<bool> {
    let mut set = event_set(session, &rule.parent)?;
    if !set.rules.remove(rule) {
        return Ok(false);
    }
    if set.rules.is_empty() {
        session.delete(EventSet::BUCKET, &set.resource)?;
    } else {
        session.save(&set)?;
    }
    Ok(true)
}

/// Rules whose parent is `resource`
pub fn events_for(session: &mut Session, resource: &str) -> Result<Vec<EventRule>> {
    Ok(event_set(session, resource)?.rules.into_iter().collect())
}

pub fn all_events(session: &mut Session) -> Result<Vec<EventRule>> {
    let keys = session.keys(EventSet::BUCKET)?;
    Ok(session
        .multi_get::<EventSet>(&keys)?
        .into_iter()
        .flat_map(|set| set.rules)
        .collect())
}

/// Order a receiver's run and update after its emitter's
pub fn add_default_events(session: &mut Session, emitter: &str, receiver: &str) -> Result<usize> {
    add_events(
        session,
        [
            EventRule::dependency(emitter, "run", receiver, "run"),
            EventRule::dependency(emitter, "update", receiver, "update"),
        ],
    )
}

// ============================================================================
// Execution graph
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub resource: String,
    pub action: String,
}

impl NodeId {
    pub fn new(resource: &str, action: &str) -> Self {
        Self {
            resource: resource.to_string(),
            action: action.to_string(),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.action)
    }
}

/// `to` runs once `from` ends in `state`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub state: EdgeState,
}

/// Directed multigraph of actions with labelled edges
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionGraph {
    pub nodes: BTreeSet<NodeId>,
    pub edges: BTreeSet<GraphEdge>,
}

impl ExecutionGraph {
    pub fn contains(&self, node: &NodeId) -> bool {
        self.nodes.contains(node)
    }

    pub fn predecessors(&self, node: &NodeId) -> Vec<&GraphEdge> {
        self.edges.iter().filter(|e| &e.to == node).collect()
    }

    pub fn successors(&self, node: &NodeId) -> Vec<&GraphEdge> {
        self.edges.iter().filter(|e| &e.from == node).collect()
    }

    /// Nodes in an order that respects every edge, ties broken by name
    ///
    /// Fails with [`Error::CycleDetected`] naming the nodes left on a cycle.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut in_degree: BTreeMap<&NodeId, usize> = self.nodes.iter().map(|n| (n, 0)).collect();
        let mut dependents: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();
        for edge in &self.edges {
            dependents.entry(&edge.from).or_default().push(&edge.to);
            *in_degree.entry(&edge.to).or_default() += 1;
            in_degree.entry(&edge.from).or_default();
        }

        // Kahn's algorithm; the ready set is ordered for stable output
        let mut ready: BTreeSet<&NodeId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(n, _)| *n)
            .collect();
        let mut sorted = Vec::with_capacity(in_degree.len());

        while let Some(node) = ready.pop_first() {
            sorted.push(node.clone());
            for &dependent in dependents.get(&node).into_iter().flatten() {
                if let Some(deg) = in_degree.get_mut(&dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }

        if sorted.len() != in_degree.len() {
            let in_cycle: Vec<String> = in_degree
                .iter()
                .filter(|(_, deg)| **deg > 0)
                .map(|(n, _)| n.to_string())
                .collect();
            return Err(Error::CycleDetected {
                path: in_cycle.join(", "),
            });
        }
        Ok(sorted)
    }
}

/// Expand `seeds` with `rules` into an acyclic execution graph
pub fn build(seeds: impl IntoIterator<Item = NodeId>, rules: &[EventRule]) -> Result<ExecutionGraph> {
    let mut by_parent: BTreeMap<NodeId, Vec<&EventRule>> = BTreeMap::new();
    for rule in rules {
        by_parent.entry(rule.parent_node()).or_default().push(rule);
    }

    let mut graph = ExecutionGraph::default();
    let mut work: Vec<NodeId> = Vec::new();
    for seed in seeds {
        if graph.nodes.insert(seed.clone()) {
            work.push(seed);
        }
    }

    while let Some(node) = work.pop() {
        let Some(triggered) = by_parent.get(&node) else {
            continue;
        };
        for rule in triggered.iter().filter(|r| r.kind == EventKind::Reaction) {
            graph.edges.insert(rule.edge());
            let child = rule.child_node();
            if graph.nodes.insert(child.clone()) {
                log::trace!("{rule} adds {child}");
                work.push(child);
            }
        }
    }

    for rule in rules.iter().filter(|r| r.kind == EventKind::Dependency) {
        if graph.contains(&rule.parent_node()) && graph.contains(&rule.child_node()) {
            graph.edges.insert(rule.edge());
        }
    }

    graph.topological_order()?;
    log::debug!(
        "Execution graph: {} nodes, {} edges",
        graph.nodes.len(),
        graph.edges.len()
    );
    Ok(graph)
}

/// Execution graph for everything currently staged
pub fn plan(session: &mut Session) -> Result<ExecutionGraph> {
    let seeds: Vec<NodeId> = changelog::staged(session)?
        .iter()
        .map(|item| NodeId::new(&item.resource, item.action.as_str()))
        .collect();
    let rules = all_events(session)?;
    build(seeds, &rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inputs::InputSchema;
    use crate::resource::{Resource, ResourceSpec};
    use serde_json::json;

    fn cluster_rules() -> Vec<EventRule> {
        vec![
            EventRule::reaction("svc2", "run", "svc2", "join"),
            EventRule::reaction("svc3", "run", "svc3", "join"),
            EventRule::reaction("svc2", "join", "commit", "commit"),
            EventRule::reaction("svc3", "join", "commit", "commit"),
        ]
    }

    #[test]
    fn test_reactions_pull_in_children() {
        let graph = build([NodeId::new("svc2", "run")], &cluster_rules()).unwrap();

        let nodes: Vec<String> = graph.nodes.iter().map(ToString::to_string).collect();
        assert_eq!(nodes, vec!["commit:commit", "svc2:join", "svc2:run"]);

        let commit = NodeId::new("commit", "commit");
        let preds = graph.predecessors(&commit);
        assert_eq!(preds.len(), 1);
        assert_eq!(preds[0].from, NodeId::new("svc2", "join"));
        assert_eq!(preds[0].state, EdgeState::Success);

        let order = graph.topological_order().unwrap();
        let pos = |n: &NodeId| order.iter().position(|o| o == n).unwrap();
        assert!(pos(&NodeId::new("svc2", "run")) < pos(&NodeId::new("svc2", "join")));
        assert!(pos(&NodeId::new("svc2", "join")) < pos(&commit));
    }

    #[test]
    fn test_dependencies_only_order_present_nodes() {
        let rules = vec![
            EventRule::dependency("db", "run", "app", "run"),
            EventRule::dependency("cache", "run", "app", "run"),
        ];
        let graph = build([NodeId::new("app", "run"), NodeId::new("db", "run")], &rules).unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.edges.len(), 1);
        assert!(!graph.contains(&NodeId::new("cache", "run")));

        let order = graph.topological_order().unwrap();
        assert_eq!(order, vec![NodeId::new("db", "run"), NodeId::new("app", "run")]);
    }

    #[test]
    fn test_cycles_are_rejected() {
        let rules = vec![
            EventRule::reaction("a", "run", "b", "run"),
            EventRule::reaction("b", "run", "a", "run"),
        ];
        let err = build([NodeId::new("a", "run")], &rules).unwrap_err();
        match err {
            Error::CycleDetected { path } => assert_eq!(path, "a:run, b:run"),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_error_edges_keep_their_label() {
        let rules = vec![EventRule::reaction("app", "run", "pager", "notify").on(EdgeState::Error)];
        let graph = build([NodeId::new("app", "run")], &rules).unwrap();
        let edges = graph.successors(&NodeId::new("app", "run"));
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].state, EdgeState::Error);
    }

    #[test]
    fn test_rules_are_stored_per_parent() {
        let mut session = Session::in_memory();
        assert_eq!(add_events(&mut session, cluster_rules()).unwrap(), 4);
        assert!(!add_event(&mut session, EventRule::reaction("svc2", "run", "svc2", "join")).unwrap());
        assert_eq!(events_for(&mut session, "svc2").unwrap().len(), 2);
        assert_eq!(all_events(&mut session).unwrap().len(), 4);

        let rule = EventRule::reaction("svc3", "run", "svc3", "join");
        assert!(remove_event(&mut session, &rule).unwrap());
        assert!(!remove_event(&mut session, &rule).unwrap());
        assert_eq!(all_events(&mut session).unwrap().len(), 3);
    }

    #[test]
    fn test_plan_from_staged_items() {
        let mut session = Session::in_memory();
        for name in ["svc2", "svc3", "commit"] {
            Resource::create(
                &mut session,
                ResourceSpec::new(name).input("ip", InputSchema::scalar(json!("x"))),
            )
            .unwrap();
        }
        changelog::stage(&mut session).unwrap();
        let uids: Vec<String> = changelog::staged(&mut session)
            .unwrap()
            .into_iter()
            .map(|i| i.uid)
            .collect();
        changelog::commit_all(&mut session, &uids).unwrap();
        add_events(&mut session, cluster_rules()).unwrap();
        add_event(&mut session, EventRule::reaction("svc2", "update", "svc2", "join")).unwrap();

        let svc2 = Resource::load(&mut session, "svc2").unwrap();
        svc2.set(&mut session, "ip", json!("y")).unwrap();
        changelog::stage(&mut session).unwrap();

        let graph = plan(&mut session).unwrap();
        let nodes: Vec<String> = graph.nodes.iter().map(ToString::to_string).collect();
        assert_eq!(nodes, vec!["commit:commit", "svc2:join", "svc2:update"]);
    }
}
