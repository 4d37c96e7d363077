//! Wire types for the three RPCs a transport carries (§4.4, §6).

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Sent by a candidate to gather votes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

/// The response to a [`VoteRequest`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

/// Sent by the leader on a `heartbeat_timeout` cadence; carries no entries —
/// entry replication happens over the separate streaming path (§4.2, §4.5).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub term: u64,
    pub commit_index: u64,
    pub leader_id: NodeId,
}

/// The response to a [`HeartbeatRequest`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub current_index: u64,
    pub current_term: u64,
}
