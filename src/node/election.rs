//! The election timer and the Candidate role (§4.5).

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, instrument};
use tracing_futures::Instrument;

use crate::clock::{Clock, Rand};
use crate::error::Result;
use crate::rpc::VoteRequest;
use crate::state_machine::StateMachine;
use crate::transport::Transport;

use super::{Node, Role};

/// Spawn the background loop that watches for an expired election timeout
/// and starts a new election. Runs for the lifetime of the node; exits once
/// `NodeState::closed` is observed.
pub(super) fn spawn_election_timer<T, S, C, R>(node: Arc<Node<T, S, C, R>>)
where
    T: Transport,
    S: StateMachine,
    C: Clock,
    R: Rand,
{
    let id = node.id;
    let span = tracing::debug_span!("election_timer", id);
    let fut = async move {
        loop {
            let timeout_millis = {
                let state = node.state.lock().await;
                if state.closed {
                    return;
                }
                state.election_timeout_millis
            };
            node.clock.sleep(Duration::from_millis(timeout_millis)).await;

            let expired = {
                let state = node.state.lock().await;
                if state.closed {
                    return;
                }
                if state.role == Role::Leader {
                    false
                } else {
                    node.clock.now_millis().saturating_sub(state.last_leader_contact_millis) >= timeout_millis
                }
            };

            if expired {
                if let Err(err) = node.elect().await {
                    debug!(error = %err, "election attempt did not succeed");
                }
            }
        }
    };
    tokio::spawn(fut.instrument(span));
}

/// Run one election attempt: become Candidate, solicit votes from every
/// peer in parallel, and become Leader on a majority (§4.5 Candidate).
#[instrument(skip(node))]
pub(super) async fn run_election<T, S, C, R>(node: Arc<Node<T, S, C, R>>) -> Result<()>
where
    T: Transport,
    S: StateMachine,
    C: Clock,
    R: Rand,
{
    let (term, last_log_index, last_log_term, peers) = {
        let mut state = node.state.lock().await;
        if state.closed {
            return Err(crate::error::Error::Closed);
        }
        state.current_term += 1;
        state.voted_for = Some(node.id);
        state.role = Role::Candidate;
        state.leader_id = None;
        state.last_leader_contact_millis = node.clock.now_millis();
        state.election_timeout_millis = node.raft_config.new_rand_election_timeout(&*node.rand);
        node.persist_hard_state(&state).await?;

        let term = state.current_term;
        let peers: Vec<_> = state
            .config
            .as_ref()
            .map(|c| c.peer_ids(node.id).collect())
            .unwrap_or_default();
        drop(state);

        let current_index = node.segment.current_index().await;
        let last_log_term = match node.segment.entry_at(current_index).await? {
            Some(entry) => entry.term,
            None => 0,
        };
        (term, current_index, last_log_term, peers)
    };

    node.publish_metrics().await;
    info!(term, "starting election");

    if peers.is_empty() {
        return become_leader(node, term).await;
    }

    let requests = peers.iter().map(|&peer| {
        let node = node.clone();
        let req = VoteRequest {
            term,
            candidate_id: node.id,
            last_log_index,
            last_log_term,
        };
        async move { node.transport.request_vote(peer, req).await }
    });

    let responses = join_all(requests).await;

    let mut grants = 1usize; // count our own vote
    let mut highest_term = term;
    for response in responses.into_iter().flatten() {
        if response.term > highest_term {
            highest_term = response.term;
        }
        if response.granted {
            grants += 1;
        }
    }

    let quorum = {
        let state = node.state.lock().await;
        state.config.as_ref().map(|c| c.quorum_size()).unwrap_or(1)
    };

    if highest_term > term {
        let mut state = node.state.lock().await;
        if state.current_term < highest_term {
            node.adopt_term(&mut state, highest_term).await?;
        }
        return Ok(());
    }

    {
        // Another election/heartbeat may have already moved us off this term
        // while votes were in flight; only become leader if we're still the
        // candidate for `term`.
        let state = node.state.lock().await;
        if state.current_term != term || state.role != Role::Candidate {
            return Ok(());
        }
    }

    if grants >= quorum {
        become_leader(node, term).await
    } else {
        Ok(())
    }
}

async fn become_leader<T, S, C, R>(node: Arc<Node<T, S, C, R>>, term: u64) -> Result<()>
where
    T: Transport,
    S: StateMachine,
    C: Clock,
    R: Rand,
{
    let mut state = node.state.lock().await;
    if state.current_term != term {
        return Ok(());
    }
    let current_index = node.segment.current_index().await;
    let peers: Vec<_> = state
        .config
        .as_ref()
        .map(|c| c.peer_ids(node.id).collect())
        .unwrap_or_default();

    state.role = Role::Leader;
    state.leader_id = Some(node.id);
    let mut leader = super::LeaderVolatile {
        next_index: peers.iter().map(|&p| (p, current_index + 1)).collect(),
        match_index: peers.iter().map(|&p| (p, 0)).collect(),
        tasks: Vec::new(),
    };
    for &peer in &peers {
        leader.tasks.push(super::replication::spawn_peer_replication(node.clone(), peer, term));
    }
    state.leader = Some(leader);
    drop(state);

    info!(term, "became leader");
    node.publish_metrics().await;
    Ok(())
}
