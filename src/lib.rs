//! A replicated log engine implementing the core of the Raft consensus
//! protocol: a durable, ordered sequence of commands agreed upon by a
//! cluster of nodes and applied, in index order, to a user-supplied
//! deterministic state machine.
//!
//! This crate covers the hard core of Raft — the per-node role state
//! machine and election protocol, the heartbeat/append replication
//! protocol and commit-index advancement, the on-disk log segment, and
//! the streaming catch-up path a leader uses to bring a follower's log
//! up to date while also forwarding freshly appended entries in real
//! time. Four collaborators are deliberately left to the embedding
//! application, each specified here only at its interface:
//!
//! - the deterministic state machine ([`state_machine::StateMachine`])
//! - the network transport ([`transport::Transport`])
//! - the clock used for timeouts ([`clock::Clock`])
//! - the random source used for election jitter and identifiers ([`clock::Rand`])
//!
//! Start at [`node::Node`]: a node owns exactly one [`segment::Segment`]
//! and the volatile election/replication state, and is driven both by
//! external RPCs and by its own background election timer, per-peer
//! replicators, and applier task.
//!
//! Out of scope: log compaction and multi-segment rollover, read-index
//! linearizable reads, joint-consensus membership changes beyond the
//! single-node bootstrap case, encryption at rest, and cross-cluster
//! replication.

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
mod hard_state;
pub mod membership;
pub mod metrics;
pub mod node;
pub mod rpc;
pub mod segment;
pub mod state_machine;
pub mod transport;

/// A cluster-wide unique identifier for a node, stable across restarts
/// (persisted in the node's data directory, see [`node::Node::open`]).
pub type NodeId = u64;

pub use clock::{Clock, MockClock, MockRand, Rand, SystemClock, SystemRand};
pub use codec::{EntryType, LogEntry};
pub use config::RaftConfig;
pub use error::{Error, Result};
pub use membership::Config;
pub use metrics::Metrics;
pub use node::{Node, Role};
pub use state_machine::StateMachine;
pub use transport::Transport;
