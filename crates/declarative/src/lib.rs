//! # Declarative
//!
//! A declarative resource graph over an ordered key/value store.
//!
//! Resources declare typed inputs. Inputs are assigned directly or wired to
//! other resources' inputs, and resolve to values through those wires.
//! Changes are staged against the last committed snapshot of each resource,
//! then committed, reverted or discarded. Staged resources expand into an
//! execution graph for an external orchestrator.
//!
//! ## Core Concepts
//!
//! - **Session**: Typed models over a [`keystore::Store`], with a bounded
//!   per-session cache and secondary indexes
//! - **Resource**: A named set of inputs; see [`Resource::connect`] and
//!   [`Resource::get`]
//! - **Change log**: Staged and history [`LogItem`]s diffed against
//!   [`CommittedResource`] snapshots
//! - **Events**: Dependency and reaction rules expanded into an
//!   [`ExecutionGraph`]
//! - **Locks**: Identity-owned locks with retry, see [`Lock`]
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{InputSchema, Resource, ResourceSpec, Session, changelog};
//! use serde_json::json;
//!
//! let mut session = Session::in_memory();
//! let db = Resource::create(
//!     &mut session,
//!     ResourceSpec::new("db").input("ip", InputSchema::scalar(json!("10.0.0.5"))),
//! )?;
//! let app = Resource::create(
//!     &mut session,
//!     ResourceSpec::new("app").input("db_host", InputSchema::scalar(json!(null))),
//! )?;
//! app.connect(&mut session, "db_host", db.name(), "ip")?;
//! assert_eq!(app.get(&mut session, "db_host")?, json!("10.0.0.5"));
//!
//! for item in changelog::stage(&mut session)? {
//!     changelog::commit(&mut session, &item.uid)?;
//! }
//! ```
//!
//! ## Extension Points
//!
//! - [`Evaluator`]: Derives computed inputs
//! - [`keystore::ConflictResolver`]: Merges divergent replicas; see
//!   [`LedgerResolver`] for locks

pub mod cache;
pub mod changelog;
pub mod codec;
pub mod computable;
pub mod diff;
pub mod error;
pub mod events;
pub mod inputs;
pub mod lock;
pub mod resolve;
pub mod resource;
pub mod retry;
pub mod session;
pub mod signals;
#[cfg(test)]
mod testing;
pub mod types;

// Re-export main types at crate root
pub use changelog::{
    Action, CommitReport, CommittedResource, FailedCommit, ItemState, LogItem, LogName, Outcome,
};
pub use codec::{EdgeKey, EdgeSlot, KindPair};
pub use computable::{Aggregation, BuiltinEvaluator, EvaluationError, Evaluator, NoEvaluator};
pub use diff::{Change, PathSegment};
pub use error::{Error, Result};
pub use events::{EdgeState, EventKind, EventRule, ExecutionGraph, GraphEdge, NodeId};
pub use inputs::{Computable, InputKind, InputSchema, InputSlot};
pub use lock::{LedgerResolver, Lock, LockGuard, LockOptions, LockStrategy, with_lock};
pub use resource::{Resource, ResourceData, ResourceSpec, Wiring};
pub use retry::{RetryCallback, RetryPolicy};
pub use session::{DirtyPolicy, FlushReport, Model, ObjectKey, SaveMode, Session, SessionOptions};
pub use types::{Connection, InputRef, ResourceState};
