//! The applier: advances `applied_index` by handing committed entries to the
//! state machine, strictly in order, exactly once (§4.5, §5).

use std::sync::Arc;

use bytes::Bytes;
use tracing::{error, trace};
use tracing_futures::Instrument;

use crate::clock::{Clock, Rand};
use crate::codec::EntryType;
use crate::error::{Error, Result};
use crate::membership::Config;
use crate::state_machine::StateMachine;
use crate::transport::Transport;

use super::Node;

/// Spawn the background loop that applies `(applied_index, commit_index]`
/// to the state machine whenever `commit_notify` fires. A state-machine
/// failure is fatal (§5, §7): the node is closed and the loop exits.
pub(super) fn spawn_applier<T, S, C, R>(node: Arc<Node<T, S, C, R>>)
where
    T: Transport,
    S: StateMachine,
    C: Clock,
    R: Rand,
{
    let span = tracing::debug_span!("applier", id = node.id);
    let fut = async move {
        loop {
            let notified = node.commit_notify.notified();

            let (applied_index, commit_index) = {
                let state = node.state.lock().await;
                if state.closed {
                    return;
                }
                (state.applied_index, state.commit_index)
            };

            if applied_index >= commit_index {
                notified.await;
                continue;
            }

            for index in (applied_index + 1)..=commit_index {
                let entry = match node.segment.entry_at(index).await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(err) => {
                        error!(index, error = %err, "failed to read committed entry for apply");
                        break;
                    }
                };

                if entry.entry_type == EntryType::Config {
                    if let Ok(config) = serde_json::from_slice::<Config>(&entry.data) {
                        let mut state = node.state.lock().await;
                        state.config = config.into();
                    }
                }

                let response = {
                    let mut sm = node.state_machine.lock().await;
                    sm.apply(std::slice::from_ref(&entry)).await
                };

                match response {
                    Ok(mut responses) => {
                        let response = responses.pop().unwrap_or_default();
                        node.responses.lock().await.insert(index, response);
                        let mut state = node.state.lock().await;
                        state.applied_index = index;
                        drop(state);
                        trace!(index, "applied entry");
                    }
                    Err(err) => {
                        let err = Error::StateMachineFailed(err);
                        error!(index, error = %err, "state machine failed to apply entry, closing node");
                        node.close().await;
                        return;
                    }
                }
            }

            node.publish_metrics().await;
            node.commit_notify.notify_waiters();
        }
    };
    tokio::spawn(fut.instrument(span));
}

/// Block until `index` has been applied, returning its state-machine
/// response (§4.5 Apply path).
pub(super) async fn await_applied<T, S, C, R>(node: &Node<T, S, C, R>, index: u64) -> Result<Bytes>
where
    T: Transport,
    S: StateMachine,
    C: Clock,
    R: Rand,
{
    loop {
        let notified = node.commit_notify.notified();
        {
            let state = node.state.lock().await;
            if state.closed {
                return Err(Error::Closed);
            }
            if state.applied_index >= index {
                break;
            }
        }
        notified.await;
    }
    Ok(node.responses.lock().await.remove(&index).unwrap_or_default())
}
