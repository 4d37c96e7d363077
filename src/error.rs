//! The crate's error and result types.

use thiserror::Error;

use crate::NodeId;

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All error kinds surfaced by the replicated log engine.
///
/// Transient I/O errors on a single replication stream are logged and retried
/// from `next_index[peer]` by the caller; voting and heartbeat errors are
/// returned to the RPC caller unchanged; state-machine apply failures are
/// fatal because they break determinism (see `Error::StateMachineFailed`).
#[derive(Debug, Error)]
pub enum Error {
    /// A second caller attempted to open a Node whose data directory is already owned.
    #[error("node data directory is already open")]
    AlreadyOpen,

    /// A call was made against a Node which has been closed.
    #[error("node is closed")]
    Closed,

    /// `initialize` was called on a Node that has already appended entries.
    #[error("node is already initialized")]
    AlreadyInitialized,

    /// `initialize` was called without a URL for the bootstrap member.
    #[error("a URL is required to initialize a node")]
    UrlRequired,

    /// A write was attempted against a node which is not the cluster leader.
    #[error("node is not the leader, current leader: {0:?}")]
    NotLeader(Option<NodeId>),

    /// A vote was denied because the candidate's term is stale.
    #[error("candidate term {candidate_term} is stale relative to current term {current_term}")]
    StaleTerm { current_term: u64, candidate_term: u64 },

    /// A vote was denied because this node already voted for a different candidate this term.
    #[error("already voted for a different candidate in the current term")]
    AlreadyVoted,

    /// A vote was denied because the candidate's log is not at least as up-to-date as ours.
    #[error("candidate's log is not up-to-date")]
    OutOfDateLog,

    /// `write_to` was requested at an index beyond the current commit frontier.
    #[error("requested index {0} has not yet been committed")]
    UncommittedIndex(u64),

    /// A mutation was attempted against a sealed segment.
    #[error("segment is sealed")]
    Sealed,

    /// A segment operation referenced an index outside of the segment's range.
    #[error("index {0} is out of range for this segment")]
    OutOfRange(u64),

    /// A tail writer fell too far behind `append` to keep up and was
    /// dropped (§4.2); the caller sees this instead of a silent, clean EOF.
    #[error("tail writer fell behind and was dropped")]
    TailWriterLagging,

    /// A short read while decoding an entry.
    #[error("entry record was truncated")]
    Truncated,

    /// A decoded entry's length exceeded the configured maximum.
    #[error("entry record exceeds the configured maximum size")]
    Oversize,

    /// The state machine failed to apply a committed entry. This is fatal: the node shuts down
    /// to avoid diverging from the rest of the cluster.
    #[error("state machine failed to apply entry: {0}")]
    StateMachineFailed(#[source] anyhow::Error),

    /// A stream began with the reserved snapshot marker byte, which this engine does not yet support.
    #[error("snapshot streaming is not yet supported")]
    SnapshotNotSupported,

    /// An error bubbled up from the injected transport implementation.
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// An underlying I/O error, e.g. while reading or writing the segment file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error (de)serializing the config-store document.
    #[error("config serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// True for the set of errors which are expected, recoverable rejections of a single RPC,
    /// as opposed to node-fatal conditions.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Error::NotLeader(_)
                | Error::StaleTerm { .. }
                | Error::AlreadyVoted
                | Error::OutOfDateLog
                | Error::UncommittedIndex(_)
        )
    }
}
