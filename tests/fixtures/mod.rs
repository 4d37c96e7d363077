//! Fixtures for integration-testing `raftlog::node::Node`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::DuplexStream;
use tokio::sync::{watch, RwLock};

use raftlog::codec::LogEntry;
use raftlog::membership::{Config, ConfigStore};
use raftlog::node::{Node, Role};
use raftlog::rpc::{HeartbeatRequest, HeartbeatResponse, VoteRequest, VoteResponse};
use raftlog::state_machine::{Snapshot, StateMachine};
use raftlog::transport::Transport;
use raftlog::{Error, Metrics, NodeId, Result};

/// A fresh, empty directory under the OS temp dir, namespaced by `label` so
/// parallel test binaries don't collide.
pub fn temp_dir(label: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!("raftlog-it-{}-{}", label, rand::random::<u64>()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// A state machine that remembers every applied command, in order, and
/// echoes each payload back as that entry's response. Enough to assert total
/// order and exactly-once application without an external storage crate.
#[derive(Default)]
pub struct TestStateMachine {
    pub log: Vec<Bytes>,
}

#[async_trait]
impl StateMachine for TestStateMachine {
    async fn apply(&mut self, entries: &[LogEntry]) -> anyhow::Result<Vec<Bytes>> {
        let mut responses = Vec::with_capacity(entries.len());
        for entry in entries {
            self.log.push(entry.data.clone());
            responses.push(entry.data.clone());
        }
        Ok(responses)
    }

    async fn snapshot(&self) -> anyhow::Result<Snapshot> {
        let raw: Vec<Vec<u8>> = self.log.iter().map(|b| b.to_vec()).collect();
        Ok(Snapshot {
            last_included_index: self.log.len() as u64,
            last_included_term: 0,
            data: Bytes::from(serde_json::to_vec(&raw)?),
        })
    }

    async fn restore(&mut self, snapshot: Snapshot) -> anyhow::Result<()> {
        let raw: Vec<Vec<u8>> = serde_json::from_slice(&snapshot.data)?;
        self.log = raw.into_iter().map(Bytes::from).collect();
        Ok(())
    }
}

/// A transport for a node known to have no peers (an uninitialized node, or
/// one bootstrapped as a single-member cluster): every method would only be
/// reached if the node tried to contact a peer it doesn't have.
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    type Writer = DuplexStream;

    async fn request_vote(&self, _peer: NodeId, _req: VoteRequest) -> Result<VoteResponse> {
        unreachable!("a node with no peers never dials out")
    }

    async fn heartbeat(&self, _peer: NodeId, _req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        unreachable!("a node with no peers never dials out")
    }

    async fn open_stream(&self, _peer: NodeId, _term: u64, _from_index: u64) -> Result<Self::Writer> {
        unreachable!("a node with no peers never dials out")
    }
}

/// A concrete node type used by the multi-node fixtures below.
pub type RoutedNode = Node<RouterTransport, TestStateMachine>;

/// An in-process transport: routes RPCs directly to the peer `Node`
/// instances registered with it, emulating a network without actually using
/// one.
#[derive(Default)]
pub struct Router {
    nodes: RwLock<HashMap<NodeId, Arc<RoutedNode>>>,
}

impl Router {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, id: NodeId, node: Arc<RoutedNode>) {
        self.nodes.write().await.insert(id, node);
    }

    async fn get(&self, id: NodeId) -> Result<Arc<RoutedNode>> {
        self.nodes
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Transport(anyhow::anyhow!("router has no node registered for peer {}", id)))
    }
}

/// The `Transport` every node in a [`Router`]-backed cluster is opened with.
pub struct RouterTransport {
    router: Arc<Router>,
}

impl RouterTransport {
    pub fn new(router: Arc<Router>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Transport for RouterTransport {
    type Writer = DuplexStream;

    async fn request_vote(&self, peer: NodeId, req: VoteRequest) -> Result<VoteResponse> {
        let peer_node = self.router.get(peer).await?;
        match peer_node
            .request_vote(req.term, req.candidate_id, req.last_log_index, req.last_log_term)
            .await
        {
            Ok(term) => Ok(VoteResponse { term, granted: true }),
            Err(Error::StaleTerm { current_term, .. }) => Ok(VoteResponse { term: current_term, granted: false }),
            Err(Error::AlreadyVoted) | Err(Error::OutOfDateLog) => {
                let term = peer_node.metrics().borrow().current_term;
                Ok(VoteResponse { term, granted: false })
            }
            Err(other) => Err(Error::Transport(anyhow::anyhow!(other))),
        }
    }

    async fn heartbeat(&self, peer: NodeId, req: HeartbeatRequest) -> Result<HeartbeatResponse> {
        let peer_node = self.router.get(peer).await?;
        let (current_index, current_term) = peer_node.heartbeat(req.term, req.commit_index, req.leader_id).await?;
        Ok(HeartbeatResponse { current_index, current_term })
    }

    async fn open_stream(&self, peer: NodeId, _term: u64, _from_index: u64) -> Result<Self::Writer> {
        let peer_node = self.router.get(peer).await?;
        let (here, there) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = peer_node.read_from(there).await;
        });
        Ok(here)
    }
}

/// Write `id` and `config` directly into `dir` before the node is ever
/// opened, the way a provisioning step outside this crate would seed a
/// multi-member cluster's founding members (§4.3: "On open: if present,
/// load"). This crate's own `Node` API only grows membership from zero to
/// one member (`initialize`); growing a cluster beyond that is an
/// out-of-scope joint-consensus operation, so tests that want more than one
/// voting member from the start seed the config file directly.
pub async fn seed_identity_and_config(dir: &Path, id: NodeId, config: &Config) {
    std::fs::write(dir.join("id"), id.to_string()).unwrap();
    ConfigStore::new(dir).save(config).await.unwrap();
}

/// Poll `node.state()` until it equals `role` or `timeout` elapses.
pub async fn wait_for_role(node: &Arc<RoutedNode>, role: Role, timeout: Duration) -> anyhow::Result<()> {
    tokio::time::timeout(timeout, async {
        loop {
            if node.state().await == role {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for role {:?}", role))
}

/// Await a [`Metrics`] snapshot matching `predicate`.
pub async fn wait_for_metrics<F>(mut rx: watch::Receiver<Metrics>, timeout: Duration, mut predicate: F) -> anyhow::Result<Metrics>
where
    F: FnMut(&Metrics) -> bool,
{
    if predicate(&rx.borrow()) {
        return Ok(rx.borrow().clone());
    }
    tokio::time::timeout(timeout, async {
        loop {
            rx.changed().await.map_err(|_| anyhow::anyhow!("metrics channel closed"))?;
            if predicate(&rx.borrow()) {
                return Ok::<_, anyhow::Error>(rx.borrow().clone());
            }
        }
    })
    .await
    .map_err(|_| anyhow::anyhow!("timed out waiting for a matching metrics snapshot"))?
}
