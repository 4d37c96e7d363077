//! Observable node state, published via a watch channel (§4.5 ambient
//! addition): role, term, and index fields a caller needs to build
//! liveness and replication-lag dashboards, pushed on a `watch` channel
//! after every state-affecting operation.

use tokio::sync::watch;

use crate::node::Role;
use crate::NodeId;

/// A point-in-time snapshot of a node's externally-visible state.
#[derive(Clone, Debug, PartialEq)]
pub struct Metrics {
    pub id: NodeId,
    pub role: Role,
    pub current_term: u64,
    pub current_index: u64,
    pub commit_index: u64,
    pub applied_index: u64,
    pub leader_id: Option<NodeId>,
}

impl Metrics {
    pub(crate) fn new(id: NodeId) -> Self {
        Self {
            id,
            role: Role::Follower,
            current_term: 0,
            current_index: 0,
            commit_index: 0,
            applied_index: 0,
            leader_id: None,
        }
    }
}

/// The publishing half, held by a [`crate::node::Node`].
pub(crate) struct MetricsPublisher {
    tx: watch::Sender<Metrics>,
}

impl MetricsPublisher {
    pub(crate) fn new(id: NodeId) -> (Self, watch::Receiver<Metrics>) {
        let (tx, rx) = watch::channel(Metrics::new(id));
        (Self { tx }, rx)
    }

    pub(crate) fn publish(&self, metrics: Metrics) {
        // A closed receiver set just means nobody is watching; not an error.
        let _ = self.tx.send(metrics);
    }
}
