//! The Node: role state machine, replication, and commit advancement (§4.5).
//!
//! This is the crate's hard core. A `Node` owns
//! exactly one `Segment` and a coarse lock around its volatile/persistent
//! fields (§5). External events enter through the method set below;
//! background tasks (election timer, per-peer replication, the applier,
//! spawned from [`Node::open`]) drive role transitions and commit
//! advancement by calling back into these same methods.

mod apply;
mod election;
mod replication;

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use fs2::FileExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::clock::{Clock, Rand, SystemClock, SystemRand};
use crate::codec::{EntryType, LogEntry};
use crate::config::RaftConfig;
use crate::error::{Error, Result};
use crate::hard_state::{HardState, HardStateStore};
use crate::membership::{Config, ConfigStore};
use crate::metrics::{Metrics, MetricsPublisher};
use crate::segment::Segment;
use crate::state_machine::StateMachine;
use crate::transport::Transport;
use crate::NodeId;

/// A replica's role in the cluster (§4.5).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

pub(crate) struct LeaderVolatile {
    pub(crate) next_index: HashMap<NodeId, u64>,
    pub(crate) match_index: HashMap<NodeId, u64>,
    tasks: Vec<JoinHandle<()>>,
}

/// The Node's volatile and persistent fields, guarded by one coarse lock (§5).
///
/// `current_index` is not cached here: the segment is the single source of
/// truth for it, queried with `segment.current_index()` whenever needed.
pub(crate) struct NodeState {
    pub(crate) closed: bool,
    pub(crate) config: Option<Config>,
    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) role: Role,
    pub(crate) leader_id: Option<NodeId>,
    pub(crate) commit_index: u64,
    pub(crate) applied_index: u64,
    pub(crate) last_leader_contact_millis: u64,
    pub(crate) election_timeout_millis: u64,
    pub(crate) leader: Option<LeaderVolatile>,
    /// Bumped by every `read_from` call. A call compares its own snapshot of
    /// this counter against the live value before each append it makes to
    /// the segment; a mismatch means a newer `read_from` has since been
    /// installed, so the stale call stops feeding the segment (§4.5:
    /// "installs a new inbound stream, closes any prior one").
    pub(crate) read_generation: u64,
}

/// A replica of the replicated log, generic over its injected collaborators
/// (§4.4 Transport, §4.6 StateMachine, §4.7 Clock/Rand).
pub struct Node<T, S, C = SystemClock, R = SystemRand>
where
    T: Transport,
    S: StateMachine,
    C: Clock,
    R: Rand,
{
    id: NodeId,
    data_dir: PathBuf,
    raft_config: Arc<RaftConfig>,
    transport: Arc<T>,
    clock: Arc<C>,
    rand: Arc<R>,
    segment: Arc<Segment>,
    config_store: ConfigStore,
    hard_state_store: HardStateStore,
    state: Mutex<NodeState>,
    state_machine: Mutex<S>,
    metrics: MetricsPublisher,
    metrics_rx: watch::Receiver<Metrics>,
    commit_notify: Notify,
    /// Responses from the applier, keyed by entry index, consumed once by
    /// the matching `apply()` caller.
    responses: Mutex<HashMap<u64, Bytes>>,
    _lock_file: std::fs::File,
}

impl<T, S> Node<T, S, SystemClock, SystemRand>
where
    T: Transport,
    S: StateMachine,
{
    /// Open (creating if absent) the node rooted at `data_dir`, using the
    /// real system clock and random source.
    pub async fn open(
        data_dir: impl AsRef<Path>,
        raft_config: Arc<RaftConfig>,
        transport: T,
        state_machine: S,
    ) -> Result<Arc<Self>> {
        Self::open_with(data_dir, raft_config, transport, state_machine, SystemClock, SystemRand).await
    }
}

impl<T, S, C, R> Node<T, S, C, R>
where
    T: Transport,
    S: StateMachine,
    C: Clock,
    R: Rand,
{
    /// Open a node with explicit `clock`/`rand` collaborators, the seam a
    /// test harness drives (§4.7, §9).
    #[instrument(skip(raft_config, transport, state_machine, clock, rand))]
    pub async fn open_with(
        data_dir: impl AsRef<Path>,
        raft_config: Arc<RaftConfig>,
        transport: T,
        state_machine: S,
        clock: C,
        rand: R,
    ) -> Result<Arc<Self>> {
        let data_dir = data_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&data_dir).await?;

        let lock_file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(data_dir.join(".lock"))?;
        lock_file.try_lock_exclusive().map_err(|_| Error::AlreadyOpen)?;

        let id = load_or_mint_id(&data_dir, &rand)?;

        let hard_state_store = HardStateStore::new(&data_dir);
        let hard_state = hard_state_store.load().await?;

        let config_store = ConfigStore::new(&data_dir);
        let config = config_store.load().await?;

        let segment = Segment::open(data_dir.join("1.log"), raft_config.max_entry_size).await?;

        let (metrics, metrics_rx) = MetricsPublisher::new(id);
        let now = clock.now_millis();
        let election_timeout_millis = raft_config.new_rand_election_timeout(&rand);

        let node = Arc::new(Self {
            id,
            data_dir,
            raft_config,
            transport: Arc::new(transport),
            clock: Arc::new(clock),
            rand: Arc::new(rand),
            segment,
            config_store,
            hard_state_store,
            state: Mutex::new(NodeState {
                closed: false,
                config,
                current_term: hard_state.current_term,
                voted_for: hard_state.voted_for,
                role: Role::Follower,
                leader_id: None,
                commit_index: 0,
                applied_index: 0,
                last_leader_contact_millis: now,
                election_timeout_millis,
                leader: None,
                read_generation: 0,
            }),
            state_machine: Mutex::new(state_machine),
            metrics,
            metrics_rx,
            commit_notify: Notify::new(),
            responses: Mutex::new(HashMap::new()),
            _lock_file: lock_file,
        });

        node.publish_metrics().await;
        election::spawn_election_timer(node.clone());
        apply::spawn_applier(node.clone());

        Ok(node)
    }

    /// Release the segment's tail writers and mark the node closed. Further
    /// calls return `Closed`.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(leader) = state.leader.take() {
            for task in leader.tasks {
                task.abort();
            }
        }
        drop(state);
        self.segment.close().await;
        self.commit_notify.notify_waiters();
    }

    /// One-shot bootstrap of a brand-new cluster (§4.3).
    #[instrument(skip(self))]
    pub async fn initialize(&self, url: String) -> Result<()> {
        if url.is_empty() {
            return Err(Error::UrlRequired);
        }
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }
        if self.segment.current_index().await > 0 {
            return Err(Error::AlreadyInitialized);
        }

        let cluster_id = self.rand.gen_cluster_id();
        let config = Config::new_single(cluster_id, self.id, url);

        state.current_term = 1;
        state.voted_for = Some(self.id);
        state.role = Role::Leader;
        state.leader_id = Some(self.id);
        state.config = Some(config.clone());
        state.leader = Some(LeaderVolatile {
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            tasks: Vec::new(),
        });

        self.persist_hard_state(&state).await?;
        self.config_store.save(&config).await?;

        let data = serde_json::to_vec(&config)?;
        let entry = LogEntry::new(EntryType::Config, 1, 1, data);
        self.segment.append(&entry).await?;

        // Single-node bootstrap is immediately committed: it is the only entry,
        // replicated on every (one) member of the cluster by construction.
        state.commit_index = 1;
        drop(state);

        self.commit_notify.notify_waiters();
        self.publish_metrics().await;
        Ok(())
    }

    /// Submit an opaque command to the leader. Blocks until the entry
    /// commits and is applied, returning the state machine's response.
    ///
    /// Returns the state machine's response for this entry rather than
    /// discarding it: the state machine interface (§4.6) always produces one
    /// response per applied entry, so handing it back to the caller is the
    /// useful behavior for a client awaiting the outcome of its command.
    #[instrument(skip(self, data))]
    pub async fn apply(self: &Arc<Self>, data: impl Into<Bytes>) -> Result<Bytes> {
        let (index, term) = {
            // Held across the append itself (§4.5: "append to the Segment
            // (durably), release lock"): two concurrent callers must not be
            // able to both read `current_index()` before either has
            // appended, or they'd synthesize entries with the same index.
            let state = self.state.lock().await;
            if state.closed {
                return Err(Error::Closed);
            }
            if state.role != Role::Leader {
                return Err(Error::NotLeader(state.leader_id));
            }
            let index = self.segment.current_index().await + 1;
            let term = state.current_term;
            let entry = LogEntry::new(EntryType::Command, index, term, data.into());
            self.segment.append(&entry).await?;
            (index, term)
        };

        // The leader's own log growing is itself a change to the majority
        // set (§4.5): recompute immediately rather than waiting for a peer
        // ack, which also covers the single-node-cluster case where there
        // are no peers to ack at all.
        replication::recompute_commit_index(self, term).await;

        self.publish_metrics().await;
        apply::await_applied(self, index).await
    }

    /// Handle an inbound Heartbeat RPC (§4.4, §4.5 Follower/Candidate/Leader rules).
    #[instrument(skip(self))]
    pub async fn heartbeat(&self, term: u64, commit_index: u64, leader_id: NodeId) -> Result<(u64, u64)> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }
        if term < state.current_term {
            return Ok((self.segment.current_index().await, state.current_term));
        }
        if term > state.current_term {
            self.adopt_term(&mut state, term).await?;
        }
        if state.role != Role::Follower {
            self.step_down(&mut state);
        }
        state.leader_id = Some(leader_id);
        state.last_leader_contact_millis = self.clock.now_millis();
        state.election_timeout_millis = self.raft_config.new_rand_election_timeout(&*self.rand);

        let current_index = self.segment.current_index().await;
        let new_commit = commit_index.min(current_index);
        let current_term = state.current_term;
        if new_commit > state.commit_index {
            state.commit_index = new_commit;
            drop(state);
            self.commit_notify.notify_waiters();
        } else {
            drop(state);
        }
        self.publish_metrics().await;
        Ok((current_index, current_term))
    }

    /// Handle an inbound RequestVote RPC (§4.5 voting rules).
    #[instrument(skip(self))]
    pub async fn request_vote(
        &self,
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::Closed);
        }

        if term < state.current_term {
            return Err(Error::StaleTerm {
                current_term: state.current_term,
                candidate_term: term,
            });
        }
        if term > state.current_term {
            self.adopt_term(&mut state, term).await?;
        }

        let (our_last_index, our_last_term) = self.last_log_index_and_term(&state).await;
        let log_ok = last_log_term > our_last_term || (last_log_term == our_last_term && last_log_index >= our_last_index);

        let already_voted_other = matches!(state.voted_for, Some(v) if v != candidate_id);
        if already_voted_other {
            return Err(Error::AlreadyVoted);
        }
        if !log_ok {
            return Err(Error::OutOfDateLog);
        }

        state.voted_for = Some(candidate_id);
        state.last_leader_contact_millis = self.clock.now_millis();
        state.election_timeout_millis = self.raft_config.new_rand_election_timeout(&*self.rand);
        self.persist_hard_state(&state).await?;
        let current_term = state.current_term;
        drop(state);
        self.publish_metrics().await;
        Ok(current_term)
    }

    /// The server end of a Stream RPC, called by this node's own replication
    /// task once it has a writer from the transport (§4.5 Write-to).
    #[instrument(skip(self, writer))]
    pub async fn write_to<W>(&self, mut writer: W, term: u64, from_index: u64) -> Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(Error::Closed);
            }
            if term < state.current_term {
                return Err(Error::NotLeader(state.leader_id));
            }
            if term > state.current_term {
                self.adopt_term(&mut state, term).await?;
                return Err(Error::NotLeader(None));
            }
            if state.role != Role::Leader {
                return Err(Error::NotLeader(state.leader_id));
            }
            // Bounded by what the segment durably holds, not by `commit_index`:
            // the very first bytes streamed to a fresh peer are what lets
            // commit advance for it, so requiring `from_index <= commit_index`
            // here would make initial replication impossible (see DESIGN.md).
            let current_index = self.segment.current_index().await;
            if from_index > current_index + 1 {
                return Err(Error::UncommittedIndex(from_index));
            }
        }
        use tokio::io::AsyncWriteExt;
        // Reserved first byte (§9): 0 means "not a snapshot". `read_from`
        // expects exactly this marker before the entry stream.
        writer.write_all(&[0u8]).await?;
        self.segment.write_to(writer, from_index).await
    }

    /// Install a new inbound stream, appending everything it yields to the
    /// local segment, closing any prior one (§4.5 Read-from).
    ///
    /// "Closing" a prior call means superseding it: this call bumps
    /// `read_generation` on entry and every call re-checks its own snapshot
    /// of that counter before each append it makes. A previous call whose
    /// `read_exact` is still in flight when a newer one is installed will,
    /// once it finishes decoding whatever entry it was blocked on, notice it
    /// has been superseded and stop short of writing that entry to the
    /// segment — so two inbound streams can never interleave entries into
    /// the log, even if both are briefly alive at once.
    #[instrument(skip(self, reader))]
    pub async fn read_from<Rd>(&self, mut reader: Rd) -> Result<()>
    where
        Rd: AsyncRead + Unpin + Send,
    {
        use tokio::io::AsyncReadExt;

        let my_generation = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(Error::Closed);
            }
            state.read_generation += 1;
            state.read_generation
        };

        let mut marker = [0u8; 1];
        match reader.read_exact(&mut marker).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        if marker[0] != 0 {
            return Err(Error::SnapshotNotSupported);
        }

        let max_entry_size = self.raft_config.max_entry_size;
        loop {
            let mut header = vec![0u8; crate::codec::HEADER_LEN];
            match reader.read_exact(&mut header).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err.into()),
            }
            let mut framed = bytes::BytesMut::from(&header[..]);
            let data_len = crate::codec::peek_data_len(&framed)?;
            let mut data = vec![0u8; data_len];
            if data_len > 0 {
                reader.read_exact(&mut data).await?;
            }
            framed.extend_from_slice(&data);
            let mut whole = framed.freeze();
            let entry = crate::codec::decode(&mut whole, max_entry_size)?;

            let state = self.state.lock().await;
            if state.closed || state.read_generation != my_generation {
                return Ok(());
            }
            drop(state);

            self.segment.append(&entry).await?;

            let mut state = self.state.lock().await;
            if entry.entry_type == EntryType::Config {
                if let Ok(config) = serde_json::from_slice::<Config>(&entry.data) {
                    state.config = Some(config.clone());
                    drop(state);
                    self.config_store.save(&config).await?;
                    continue;
                }
            }
        }
    }

    /// Force this node to start (or restart) an election (§4.5 Candidate).
    #[instrument(skip(self))]
    pub async fn elect(self: &Arc<Self>) -> Result<()> {
        election::run_election(self.clone()).await
    }

    pub async fn state(&self) -> Role {
        self.state.lock().await.role
    }

    pub fn path(&self) -> &Path {
        &self.data_dir
    }

    pub async fn opened(&self) -> bool {
        !self.state.lock().await.closed
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn metrics(&self) -> watch::Receiver<Metrics> {
        self.metrics_rx.clone()
    }

    pub async fn config(&self) -> Option<Config> {
        self.state.lock().await.config.clone()
    }

    async fn last_log_index_and_term(&self, _state: &NodeState) -> (u64, u64) {
        let index = self.segment.current_index().await;
        let term = match self.segment.entry_at(index).await {
            Ok(Some(entry)) => entry.term,
            _ => 0,
        };
        (index, term)
    }

    /// Adopt a newer term observed from an RPC, clearing the vote and
    /// stepping down if necessary (§4.5 voting rule 2, Leader rule).
    ///
    /// Publishes metrics itself (rather than leaving that to the caller)
    /// because term adoption is state-affecting independent of whatever the
    /// caller ultimately decides (e.g. a vote can still be denied with
    /// `OutOfDateLog` after the term bump): §4.5's "published after every
    /// state-affecting operation" promise must hold for this step on its own.
    pub(crate) async fn adopt_term(&self, state: &mut NodeState, term: u64) -> Result<()> {
        state.current_term = term;
        state.voted_for = None;
        self.step_down(state);
        self.persist_hard_state(state).await?;
        self.publish_metrics_locked(state).await;
        Ok(())
    }

    /// Drop leader-only volatile state and revert to Follower, aborting any
    /// running per-peer replication tasks.
    pub(crate) fn step_down(&self, state: &mut NodeState) {
        state.role = Role::Follower;
        if let Some(leader) = state.leader.take() {
            for task in leader.tasks {
                task.abort();
            }
        }
    }

    pub(crate) async fn persist_hard_state(&self, state: &NodeState) -> Result<()> {
        self.hard_state_store
            .save(&HardState {
                current_term: state.current_term,
                voted_for: state.voted_for,
            })
            .await
    }

    pub(crate) async fn publish_metrics(&self) {
        let state = self.state.lock().await;
        self.publish_metrics_locked(&state).await;
    }

    /// Publish a metrics snapshot from a `NodeState` the caller already
    /// holds locked, without re-acquiring `self.state` (which would
    /// deadlock against the caller's own guard).
    async fn publish_metrics_locked(&self, state: &NodeState) {
        let metrics = Metrics {
            id: self.id,
            role: state.role,
            current_term: state.current_term,
            current_index: self.segment.current_index().await,
            commit_index: state.commit_index,
            applied_index: state.applied_index,
            leader_id: state.leader_id,
        };
        self.metrics.publish(metrics);
    }
}

fn load_or_mint_id(data_dir: &Path, rand: &impl Rand) -> Result<NodeId> {
    let path = data_dir.join("id");
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(text.trim().parse().unwrap_or_else(|_| rand.gen_cluster_id())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let id = rand.gen_cluster_id();
            let mut file = std::fs::File::create(&path)?;
            write!(file, "{}", id)?;
            Ok(id)
        }
        Err(err) => Err(err.into()),
    }
}
