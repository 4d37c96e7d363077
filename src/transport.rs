//! The transport interface a Node consumes (§4.4).
//!
//! The Node calls exactly three outbound operations against this trait; it
//! exposes the symmetric inbound operations itself (`request_vote`,
//! `heartbeat`, `write_to`/`read_from` on [`crate::node::Node`]). An
//! implementation MAY multiplex all three over one connection per peer —
//! the only contract is ordering per peer, with no ordering guaranteed
//! across peers.

use async_trait::async_trait;
use tokio::io::AsyncWrite;

use crate::error::Result;
use crate::rpc::{HeartbeatRequest, HeartbeatResponse, VoteRequest, VoteResponse};
use crate::NodeId;

/// The transport contract a [`crate::node::Node`] is built against.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The writable sink handed to the peer's stream handler, ultimately
    /// fed to [`crate::node::Node::write_to`].
    type Writer: AsyncWrite + Unpin + Send + 'static;

    /// Send a RequestVote RPC to `peer`.
    async fn request_vote(&self, peer: NodeId, req: VoteRequest) -> Result<VoteResponse>;

    /// Send a Heartbeat RPC to `peer`.
    async fn heartbeat(&self, peer: NodeId, req: HeartbeatRequest) -> Result<HeartbeatResponse>;

    /// Open a streaming connection to `peer` for catch-up and forwarding of
    /// freshly appended entries starting at `from_index`. The returned
    /// writer is fed to `write_to` by the caller.
    async fn open_stream(&self, peer: NodeId, term: u64, from_index: u64) -> Result<Self::Writer>;
}
