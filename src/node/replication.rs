//! Leader-side replication: per-peer heartbeats, streaming catch-up, and
//! commit-index advancement (§4.5 Replication).

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;
use tracing_futures::Instrument;

use crate::clock::{Clock, Rand};
use crate::rpc::HeartbeatRequest;
use crate::state_machine::StateMachine;
use crate::transport::Transport;
use crate::NodeId;

use super::{Node, Role};

/// Spawn the two concurrent activities a leader runs against one peer:
/// periodic heartbeats (liveness + match-index acks) and the long-lived
/// streaming connection (catch-up + real-time forwarding). Both run in the
/// same task so a single `abort()` on the returned handle tears down both.
pub(super) fn spawn_peer_replication<T, S, C, R>(
    node: Arc<Node<T, S, C, R>>,
    peer: NodeId,
    term: u64,
) -> JoinHandle<()>
where
    T: Transport,
    S: StateMachine,
    C: Clock,
    R: Rand,
{
    let span = tracing::debug_span!("replicate", leader = node.id, peer, term);
    let fut = async move {
        tokio::join!(heartbeat_loop(node.clone(), peer, term), stream_loop(node, peer, term));
    };
    tokio::spawn(fut.instrument(span))
}

async fn heartbeat_loop<T, S, C, R>(node: Arc<Node<T, S, C, R>>, peer: NodeId, term: u64)
where
    T: Transport,
    S: StateMachine,
    C: Clock,
    R: Rand,
{
    loop {
        node.clock.sleep(Duration::from_millis(node.raft_config.heartbeat_interval)).await;

        let commit_index = {
            let state = node.state.lock().await;
            if state.closed || state.role != Role::Leader || state.current_term != term {
                return;
            }
            state.commit_index
        };

        let req = HeartbeatRequest {
            term,
            commit_index,
            leader_id: node.id,
        };

        match node.transport.heartbeat(peer, req).await {
            Ok(resp) => {
                if resp.current_term > term {
                    let mut state = node.state.lock().await;
                    if state.current_term < resp.current_term {
                        let _ = node.adopt_term(&mut state, resp.current_term).await;
                    }
                    return;
                }
                record_ack(&node, peer, term, resp.current_index).await;
            }
            Err(err) => {
                debug!(peer, error = %err, "heartbeat to peer failed");
            }
        }
    }
}

async fn stream_loop<T, S, C, R>(node: Arc<Node<T, S, C, R>>, peer: NodeId, term: u64)
where
    T: Transport,
    S: StateMachine,
    C: Clock,
    R: Rand,
{
    loop {
        let from_index = {
            let state = node.state.lock().await;
            if state.closed || state.role != Role::Leader || state.current_term != term {
                return;
            }
            match state.leader.as_ref().and_then(|l| l.next_index.get(&peer).copied()) {
                Some(idx) => idx,
                None => return,
            }
        };

        match node.transport.open_stream(peer, term, from_index).await {
            Ok(writer) => {
                if let Err(err) = node.write_to(writer, term, from_index).await {
                    debug!(peer, error = %err, "stream to peer ended");
                }
            }
            Err(err) => {
                debug!(peer, error = %err, "failed to open stream to peer");
            }
        }

        node.clock.sleep(Duration::from_millis(node.raft_config.heartbeat_interval)).await;
    }
}

/// Record a follower's acknowledged index, then recompute `commit_index`.
async fn record_ack<T, S, C, R>(node: &Arc<Node<T, S, C, R>>, peer: NodeId, term: u64, acked_index: u64)
where
    T: Transport,
    S: StateMachine,
    C: Clock,
    R: Rand,
{
    let mut state = node.state.lock().await;
    if state.role != Role::Leader || state.current_term != term {
        return;
    }
    match state.leader.as_mut() {
        Some(leader) => {
            let match_index = leader.match_index.entry(peer).or_insert(0);
            *match_index = (*match_index).max(acked_index);
            if let Some(next_index) = leader.next_index.get_mut(&peer) {
                *next_index = (*next_index).max(acked_index + 1);
            }
        }
        None => return,
    }
    drop(state);
    recompute_commit_index(node, term).await;
}

/// Recompute `commit_index` as the highest index `N` such that a strict
/// majority of peers (counting self) have `match_index ≥ N` and the entry at
/// `N` is from `current_term` (§4.5). Called both after a peer ack (via
/// [`record_ack`]) and right after the leader appends its own entry
/// ([`super::Node::apply`]): with no peers at all (the single-node
/// bootstrap/operation case) or when every peer's ack is already stale, the
/// leader's own growing log is what lets commit_index advance, and nothing
/// else would ever trigger this recomputation for it.
pub(super) async fn recompute_commit_index<T, S, C, R>(node: &Arc<Node<T, S, C, R>>, term: u64)
where
    T: Transport,
    S: StateMachine,
    C: Clock,
    R: Rand,
{
    let mut state = node.state.lock().await;
    if state.role != Role::Leader || state.current_term != term {
        return;
    }
    let current_index = node.segment.current_index().await;

    let quorum = state.config.as_ref().map(|c| c.quorum_size()).unwrap_or(1);
    let mut match_indices: Vec<u64> = match state.leader.as_ref() {
        Some(leader) => leader.match_index.values().copied().collect(),
        None => Vec::new(),
    };
    match_indices.push(current_index); // the leader always matches its own log

    let mut candidate = state.commit_index;
    for n in (state.commit_index + 1..=current_index).rev() {
        if match_indices.iter().filter(|&&m| m >= n).count() >= quorum {
            candidate = n;
            break;
        }
    }
    if candidate <= state.commit_index {
        return;
    }

    let entry_term = node.segment.entry_at(candidate).await.ok().flatten().map(|e| e.term);
    if entry_term == Some(term) {
        state.commit_index = candidate;
        drop(state);
        node.commit_notify.notify_waiters();
    }
}
