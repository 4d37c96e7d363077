//! The deterministic user state machine interface (§4.6).
//!
//! Out of scope as a collaborator: this crate defines the contract and
//! drives it from the applier, but the implementation — and its
//! determinism — is entirely the embedding application's responsibility.

use async_trait::async_trait;
use bytes::Bytes;

use crate::codec::LogEntry;

/// An opaque snapshot of a state machine's contents, reserved for a future
/// compaction feature (§1 Non-goals); the trait exists now so embedders have
/// a stable seam to implement against.
pub struct Snapshot {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub data: Bytes,
}

/// The deterministic state machine a [`crate::node::Node`] applies
/// committed entries to, strictly in index order, from the applier task
/// only (§5: "implementers must not invoke it concurrently").
#[async_trait]
pub trait StateMachine: Send + Sync + 'static {
    /// Apply `entries`, in order, returning one response payload per entry.
    ///
    /// A returned error is treated as `StateMachineFailed` and is fatal to
    /// the owning node.
    async fn apply(&mut self, entries: &[LogEntry]) -> anyhow::Result<Vec<Bytes>>;

    /// Produce a point-in-time snapshot of the state machine's contents.
    async fn snapshot(&self) -> anyhow::Result<Snapshot>;

    /// Replace the state machine's contents with `snapshot`.
    async fn restore(&mut self, snapshot: Snapshot) -> anyhow::Result<()>;
}
