//! The consensus loop.
//!
//! One task owns all Raft state: role, log, membership, replication
//! progress. Everything else — transport routes, client submits, status
//! queries — talks to it through channels and waits on oneshot replies,
//! which keeps the state machine single-threaded while network I/O runs on
//! spawned tasks.

use rand::Rng;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use crate::raft::{
    AppendRequest, AppendResponse, ConfigChange, HardState, LogCommand, LogEntry, LogIndex, Peer,
    RaftRpc, RaftRpcReply, RaftStorage, RpcEnvelope, Snapshot, SnapshotMeta, SnapshotRequest,
    SnapshotResponse, StorageError, Term, VoteRequest, VoteResponse,
};
use crate::transport::{RpcClient, TransportError};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Engine timing configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Minimum election timeout (randomized between min and max)
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_election_min"
    )]
    pub election_timeout_min: Duration,
    /// Maximum election timeout
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_election_max"
    )]
    pub election_timeout_max: Duration,
    /// Heartbeat interval (must be << election timeout)
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_heartbeat"
    )]
    pub heartbeat_interval: Duration,
    /// Per-RPC transport timeout
    #[serde(
        deserialize_with = "deserialize_duration",
        default = "default_rpc_timeout"
    )]
    pub rpc_timeout: Duration,
    /// Applied entries between automatic snapshots
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: u64,
    /// Max entries per AppendEntries RPC
    #[serde(default = "default_max_entries")]
    pub max_entries_per_rpc: usize,
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let ms = u64::deserialize(deserializer)?;
    Ok(Duration::from_millis(ms))
}

fn default_election_min() -> Duration {
    Duration::from_millis(150)
}
fn default_election_max() -> Duration {
    Duration::from_millis(300)
}
fn default_heartbeat() -> Duration {
    Duration::from_millis(50)
}
fn default_rpc_timeout() -> Duration {
    Duration::from_millis(200)
}
fn default_snapshot_threshold() -> u64 {
    1024
}
fn default_max_entries() -> usize {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: default_election_min(),
            election_timeout_max: default_election_max(),
            heartbeat_interval: default_heartbeat(),
            rpc_timeout: default_rpc_timeout(),
            snapshot_threshold: default_snapshot_threshold(),
            max_entries_per_rpc: default_max_entries(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from `raftdict.toml` and environment variables.
    ///
    /// Priority (highest first): `RAFTDICT_*` environment variables, the
    /// optional config file, built-in defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("raftdict").required(false))
            .add_source(config::Environment::with_prefix("RAFTDICT"));

        builder.build()?.try_deserialize()
    }

    /// Returns a randomized election timeout.
    pub fn random_election_timeout(&self) -> Duration {
        let min = self.election_timeout_min.as_millis() as u64;
        let max = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min..=max);
        Duration::from_millis(timeout_ms)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err("election_timeout_min must be less than election_timeout_max".to_string());
        }
        if self.heartbeat_interval.mul_f64(2.0) > self.election_timeout_min {
            return Err(
                "heartbeat_interval must be at most half of election_timeout_min".to_string(),
            );
        }
        if self.rpc_timeout.is_zero() {
            return Err("rpc_timeout must be non-zero".to_string());
        }
        if self.snapshot_threshold == 0 {
            return Err("snapshot_threshold must be positive".to_string());
        }
        if self.max_entries_per_rpc == 0 {
            return Err("max_entries_per_rpc must be positive".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// ERRORS, EVENTS, STATUS
// ============================================================================

/// Error type for engine operations.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A write reached a node that is not the leader. The `Display` form is
    /// the in-band wire string clients redirect on.
    #[error("notLeader")]
    NotLeader,
    /// The application rejected a committed command; the payload is the
    /// wire error string.
    #[error("{0}")]
    Command(String),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("configuration: {0}")]
    Config(String),
    #[error("storage: {0}")]
    Storage(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("codec: {0}")]
    Codec(String),
    #[error("engine stopped")]
    Stopped,
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        EngineError::Storage(e.to_string())
    }
}

impl From<TransportError> for EngineError {
    fn from(e: TransportError) -> Self {
        EngineError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
        }
    }
}

/// Engine lifecycle events, broadcast to statistics subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChange { from: Role, to: Role },
    LeaderChange { name: String },
    TermChange { term: Term },
    Commit { index: LogIndex },
    AddPeer { name: String },
    RemovePeer { name: String },
    Heartbeat { term: Term },
    SnapshotTaken { last_index: LogIndex },
}

/// Every event key, in one place so counters can be pre-seeded.
pub const EVENT_KEYS: &[&str] = &[
    "stateChange",
    "leaderChange",
    "termChange",
    "commit",
    "addPeer",
    "removePeer",
    "heartbeat",
    "snapshot",
];

impl EngineEvent {
    pub fn key(&self) -> &'static str {
        match self {
            EngineEvent::StateChange { .. } => "stateChange",
            EngineEvent::LeaderChange { .. } => "leaderChange",
            EngineEvent::TermChange { .. } => "termChange",
            EngineEvent::Commit { .. } => "commit",
            EngineEvent::AddPeer { .. } => "addPeer",
            EngineEvent::RemovePeer { .. } => "removePeer",
            EngineEvent::Heartbeat { .. } => "heartbeat",
            EngineEvent::SnapshotTaken { .. } => "snapshot",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub name: String,
    pub role: Role,
    pub term: Term,
    pub commit_index: LogIndex,
    pub leader: Option<Peer>,
    pub log_empty: bool,
    pub peers: Vec<Peer>,
}

// ============================================================================
// STATE MACHINE SEAM
// ============================================================================

/// What the engine needs from the replicated application state: apply a
/// committed command, and checkpoint/restore the full state for snapshots.
///
/// `apply` must be deterministic — identical commands against identical
/// state produce identical results on every replica.
pub trait StateMachine: Send + Sync + 'static {
    fn apply(&self, name: &str, body: &Value) -> Result<Value, EngineError>;
    fn save(&self) -> Result<Vec<u8>, EngineError>;
    fn recover(&self, data: &[u8]) -> Result<(), EngineError>;
}

// ============================================================================
// HANDLE
// ============================================================================

pub(crate) enum EngineMsg {
    Submit {
        command: LogCommand,
        reply: oneshot::Sender<Result<Value, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<EngineStatus, EngineError>>,
    },
    TakeSnapshot {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    RemovePeers {
        reply: oneshot::Sender<()>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
    VoteResult {
        term: Term,
        from: String,
        granted: bool,
    },
    AppendResult {
        peer: String,
        sent_term: Term,
        resp: AppendResponse,
    },
    SnapshotResult {
        peer: String,
        last_index: LogIndex,
        resp: SnapshotResponse,
    },
}

/// Clonable front door to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineMsg>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    /// Routes a command through the replicated log, blocking until it
    /// commits and applies locally. Fails with [`EngineError::NotLeader`]
    /// on a non-leader node.
    pub async fn submit(&self, command: LogCommand) -> Result<Value, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineMsg::Submit { command, reply })
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Submits a registered application command by name.
    pub async fn submit_app(&self, name: &str, body: Value) -> Result<Value, EngineError> {
        self.submit(LogCommand::App {
            name: name.to_string(),
            body,
        })
        .await
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineMsg::Status { reply })
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Checkpoints the state machine and compacts the log.
    pub async fn take_snapshot(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineMsg::TakeSnapshot { reply })
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// Clears the volatile peer set; membership rebuilds from the log.
    pub async fn remove_peers(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineMsg::RemovePeers { reply })
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Flushes durable state and halts the loop.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineMsg::Stop { reply })
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// ENGINE
// ============================================================================

struct PendingReply {
    term: Term,
    reply: oneshot::Sender<Result<Value, EngineError>>,
}

enum Wake {
    Msg(Option<EngineMsg>),
    Rpc(Option<RpcEnvelope>),
    Timer,
}

pub struct Engine<M: StateMachine> {
    name: String,
    connection: String,
    config: EngineConfig,
    machine: Arc<M>,
    storage: Box<dyn RaftStorage>,
    transport: RpcClient,

    role: Role,
    hard_state: HardState,
    leader: Option<Peer>,
    /// Known cluster members, excluding this node.
    peers: HashMap<String, Peer>,
    /// Whether this node has seen itself join the cluster.
    joined: bool,
    /// A bootstrapping node may campaign before any membership exists.
    bootstrap: bool,

    commit_index: LogIndex,
    last_applied: LogIndex,
    snapshot_index: LogIndex,
    snapshot_term: Term,

    votes: HashMap<String, bool>,
    next_index: HashMap<String, LogIndex>,
    match_index: HashMap<String, LogIndex>,
    pending: HashMap<LogIndex, PendingReply>,

    msg_tx: mpsc::Sender<EngineMsg>,
    msg_rx: mpsc::Receiver<EngineMsg>,
    rpc_rx: mpsc::Receiver<RpcEnvelope>,
    events: broadcast::Sender<EngineEvent>,
    stopping: bool,
}

impl<M: StateMachine> Engine<M> {
    /// Recovers state from storage, spawns the loop, and returns its handle
    /// plus the sender the transport feeds inbound RPCs into.
    ///
    /// `bootstrap` permits self-election before any membership is known; a
    /// node that intends to join an existing cluster must pass `false` so
    /// it stays passive until the leader replicates its join entry.
    pub fn start(
        name: String,
        connection: String,
        storage: Box<dyn RaftStorage>,
        machine: Arc<M>,
        transport: RpcClient,
        config: EngineConfig,
        bootstrap: bool,
    ) -> Result<(EngineHandle, mpsc::Sender<RpcEnvelope>), EngineError> {
        config.validate().map_err(EngineError::Config)?;

        let (msg_tx, msg_rx) = mpsc::channel(256);
        let (rpc_tx, rpc_rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(1024);

        let mut engine = Engine {
            name,
            connection,
            config,
            machine,
            storage,
            transport,
            role: Role::Follower,
            hard_state: HardState::default(),
            leader: None,
            peers: HashMap::new(),
            joined: false,
            bootstrap,
            commit_index: 0,
            last_applied: 0,
            snapshot_index: 0,
            snapshot_term: 0,
            votes: HashMap::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            pending: HashMap::new(),
            msg_tx: msg_tx.clone(),
            msg_rx,
            rpc_rx,
            events: events.clone(),
            stopping: false,
        };
        engine.recover()?;

        tracing::info!(
            node = %engine.name,
            term = engine.hard_state.term,
            last_applied = engine.last_applied,
            peers = engine.peers.len(),
            "consensus engine recovered"
        );

        let handle = EngineHandle { tx: msg_tx, events };
        tokio::spawn(engine.run());
        Ok((handle, rpc_tx))
    }

    // ========================================================================
    // RECOVERY
    // ========================================================================

    fn recover(&mut self) -> Result<(), EngineError> {
        self.hard_state = self.storage.hard_state()?;

        if let Some(snapshot) = self.storage.snapshot()? {
            self.machine.recover(&snapshot.data)?;
            self.snapshot_index = snapshot.meta.last_index;
            self.snapshot_term = snapshot.meta.last_term;
            self.last_applied = snapshot.meta.last_index;
            self.install_membership(&snapshot.meta.members);
        }

        let last = self.last_index()?;
        let stored = self.storage.commit_index()?;
        self.commit_index = stored.max(self.last_applied).min(last);
        self.apply_committed()?;
        Ok(())
    }

    // ========================================================================
    // MAIN LOOP
    // ========================================================================

    async fn run(mut self) {
        tracing::info!(node = %self.name, "consensus loop started");
        while !self.stopping {
            let result = match self.role {
                Role::Follower => self.run_follower().await,
                Role::Candidate => self.run_candidate().await,
                Role::Leader => self.run_leader().await,
            };
            if let Err(e) = result {
                tracing::error!(node = %self.name, error = %e, "consensus loop failed");
                break;
            }
        }
        tracing::info!(node = %self.name, "consensus loop stopped");
    }

    async fn wait(&mut self, timer: Duration) -> Wake {
        tokio::select! {
            msg = self.msg_rx.recv() => Wake::Msg(msg),
            env = self.rpc_rx.recv() => Wake::Rpc(env),
            _ = tokio::time::sleep(timer) => Wake::Timer,
        }
    }

    async fn wait_until(&mut self, deadline: Instant) -> Wake {
        tokio::select! {
            msg = self.msg_rx.recv() => Wake::Msg(msg),
            env = self.rpc_rx.recv() => Wake::Rpc(env),
            _ = tokio::time::sleep_until(deadline) => Wake::Timer,
        }
    }

    /// Follower: wait for traffic, campaign on election timeout.
    async fn run_follower(&mut self) -> Result<(), EngineError> {
        let timeout = self.config.random_election_timeout();
        match self.wait(timeout).await {
            Wake::Msg(Some(msg)) => self.handle_msg(msg)?,
            Wake::Rpc(Some(env)) => self.handle_rpc(env)?,
            Wake::Msg(None) | Wake::Rpc(None) => self.stopping = true,
            Wake::Timer => {
                if self.can_campaign() {
                    self.become_candidate()?;
                } else {
                    tracing::trace!(node = %self.name, "no membership yet, staying passive");
                }
            }
        }
        Ok(())
    }

    /// Candidate: fan out vote requests, collect until won, lost or timeout.
    async fn run_candidate(&mut self) -> Result<(), EngineError> {
        self.broadcast_vote_requests()?;

        // a single-node cluster wins instantly on its own vote
        if self.has_vote_majority() {
            self.become_leader()?;
            return Ok(());
        }

        let deadline = Instant::now() + self.config.random_election_timeout();
        while self.role == Role::Candidate && !self.stopping {
            match self.wait_until(deadline).await {
                Wake::Msg(Some(msg)) => self.handle_msg(msg)?,
                Wake::Rpc(Some(env)) => self.handle_rpc(env)?,
                Wake::Msg(None) | Wake::Rpc(None) => self.stopping = true,
                Wake::Timer => {
                    tracing::debug!(node = %self.name, "election timed out, restarting");
                    self.become_candidate()?;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Leader: replicate, then absorb traffic for one heartbeat interval.
    async fn run_leader(&mut self) -> Result<(), EngineError> {
        self.broadcast_append()?;
        let _ = self.events.send(EngineEvent::Heartbeat {
            term: self.hard_state.term,
        });

        let deadline = Instant::now() + self.config.heartbeat_interval;
        while self.role == Role::Leader && !self.stopping {
            match self.wait_until(deadline).await {
                Wake::Msg(Some(msg)) => self.handle_msg(msg)?,
                Wake::Rpc(Some(env)) => self.handle_rpc(env)?,
                Wake::Msg(None) | Wake::Rpc(None) => self.stopping = true,
                Wake::Timer => break,
            }
        }
        Ok(())
    }

    // ========================================================================
    // MESSAGE HANDLING
    // ========================================================================

    fn handle_msg(&mut self, msg: EngineMsg) -> Result<(), EngineError> {
        match msg {
            EngineMsg::Submit { command, reply } => self.handle_submit(command, reply)?,
            EngineMsg::Status { reply } => {
                let _ = reply.send(self.status());
            }
            EngineMsg::TakeSnapshot { reply } => {
                let _ = reply.send(self.take_snapshot());
            }
            EngineMsg::RemovePeers { reply } => {
                self.peers.clear();
                self.next_index.clear();
                self.match_index.clear();
                let _ = reply.send(());
            }
            EngineMsg::Stop { reply } => {
                self.storage.set_commit_index(self.commit_index)?;
                self.storage.flush()?;
                self.stopping = true;
                let _ = reply.send(());
            }
            EngineMsg::VoteResult {
                term,
                from,
                granted,
            } => self.handle_vote_result(term, from, granted)?,
            EngineMsg::AppendResult {
                peer,
                sent_term,
                resp,
            } => self.handle_append_result(peer, sent_term, resp)?,
            EngineMsg::SnapshotResult {
                peer,
                last_index,
                resp,
            } => self.handle_snapshot_result(peer, last_index, resp)?,
        }
        Ok(())
    }

    fn handle_rpc(&mut self, env: RpcEnvelope) -> Result<(), EngineError> {
        let reply = match env.rpc {
            RaftRpc::Vote(req) => RaftRpcReply::Vote(self.handle_vote(req)?),
            RaftRpc::Append(req) => RaftRpcReply::Append(self.handle_append(req)?),
            RaftRpc::Snapshot(req) => RaftRpcReply::Snapshot(self.handle_install_snapshot(req)?),
        };
        let _ = env.reply.send(reply);
        Ok(())
    }

    fn status(&self) -> Result<EngineStatus, EngineError> {
        Ok(EngineStatus {
            name: self.name.clone(),
            role: self.role,
            term: self.hard_state.term,
            commit_index: self.commit_index,
            leader: self.leader.clone(),
            log_empty: self.storage.is_empty()?,
            peers: self.peers.values().cloned().collect(),
        })
    }

    // ========================================================================
    // SUBMIT & COMMIT
    // ========================================================================

    fn handle_submit(
        &mut self,
        command: LogCommand,
        reply: oneshot::Sender<Result<Value, EngineError>>,
    ) -> Result<(), EngineError> {
        if self.role != Role::Leader {
            let _ = reply.send(Err(EngineError::NotLeader));
            return Ok(());
        }

        let term = self.hard_state.term;
        let index = self.last_index()? + 1;
        let entry = LogEntry {
            index,
            term,
            command,
        };
        self.storage.append(&[entry])?;
        self.pending.insert(index, PendingReply { term, reply });

        tracing::debug!(node = %self.name, index, term, "entry appended");

        self.broadcast_append()?;
        self.advance_commit()?;
        Ok(())
    }

    /// Leader commit rule: the highest current-term index replicated on a
    /// quorum becomes the new commit index.
    fn advance_commit(&mut self) -> Result<(), EngineError> {
        if self.role != Role::Leader {
            return Ok(());
        }

        let last = self.last_index()?;
        let term = self.hard_state.term;
        let mut advanced = false;

        for n in (self.commit_index + 1)..=last {
            let Some(entry) = self.storage.entry(n)? else {
                continue;
            };
            if entry.term != term {
                continue;
            }
            let mut replicated = 1usize;
            for name in self.peers.keys() {
                if self.match_index.get(name).copied().unwrap_or(0) >= n {
                    replicated += 1;
                }
            }
            if replicated >= self.majority() {
                self.commit_index = n;
                advanced = true;
            } else {
                break;
            }
        }

        if advanced {
            self.apply_committed()?;
        }
        Ok(())
    }

    fn apply_committed(&mut self) -> Result<(), EngineError> {
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = self
                .storage
                .entry(index)?
                .ok_or_else(|| EngineError::Storage(format!("missing log entry {index}")))?;

            let result = self.apply_entry(&entry);
            if let Err(e) = &result {
                // rejected application commands are normal (e.g. a stale CAS)
                tracing::debug!(node = %self.name, index, error = %e, "apply rejected");
            }
            self.last_applied = index;
            let _ = self.events.send(EngineEvent::Commit { index });

            if let Some(pending) = self.pending.remove(&index) {
                let result = if pending.term == entry.term {
                    result
                } else {
                    Err(EngineError::NotLeader)
                };
                let _ = pending.reply.send(result);
            }
        }
        self.maybe_snapshot()?;
        Ok(())
    }

    fn apply_entry(&mut self, entry: &LogEntry) -> Result<Value, EngineError> {
        match &entry.command {
            LogCommand::App { name, body } => self.machine.apply(name, body),
            LogCommand::Config(change) => {
                self.apply_config(change.clone())?;
                Ok(Value::Null)
            }
        }
    }

    fn apply_config(&mut self, change: ConfigChange) -> Result<(), EngineError> {
        match change {
            ConfigChange::AddPeer(peer) => {
                let _ = self.events.send(EngineEvent::AddPeer {
                    name: peer.name.clone(),
                });
                tracing::info!(node = %self.name, peer = %peer.name, "peer joined");
                if peer.name == self.name {
                    self.joined = true;
                    return Ok(());
                }
                let next = self.last_index()? + 1;
                if self.peers.insert(peer.name.clone(), peer.clone()).is_none() {
                    self.next_index.insert(peer.name.clone(), next);
                    self.match_index.insert(peer.name, 0);
                }
            }
            ConfigChange::RemovePeer { name } => {
                let _ = self
                    .events
                    .send(EngineEvent::RemovePeer { name: name.clone() });
                tracing::info!(node = %self.name, peer = %name, "peer left");
                if name == self.name {
                    self.joined = false;
                    return Ok(());
                }
                self.peers.remove(&name);
                self.next_index.remove(&name);
                self.match_index.remove(&name);
            }
        }
        Ok(())
    }

    // ========================================================================
    // ELECTIONS
    // ========================================================================

    fn can_campaign(&self) -> bool {
        self.bootstrap || self.joined || !self.peers.is_empty()
    }

    fn majority(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    fn has_vote_majority(&self) -> bool {
        self.votes.values().filter(|&&granted| granted).count() >= self.majority()
    }

    fn broadcast_vote_requests(&self) -> Result<(), EngineError> {
        let term = self.hard_state.term;
        let (last_log_index, last_log_term) = self.last_log_info()?;

        for peer in self.peers.values().cloned() {
            let req = VoteRequest {
                term,
                candidate: self.name.clone(),
                last_log_index,
                last_log_term,
            };
            let client = self.transport.clone();
            let tx = self.msg_tx.clone();
            tokio::spawn(async move {
                match client.send_vote(&peer, &req).await {
                    Ok(resp) => {
                        let _ = tx
                            .send(EngineMsg::VoteResult {
                                term: resp.term,
                                from: peer.name,
                                granted: resp.granted,
                            })
                            .await;
                    }
                    Err(e) => {
                        tracing::trace!(peer = %peer.name, error = %e, "vote request failed")
                    }
                }
            });
        }
        Ok(())
    }

    fn handle_vote_result(
        &mut self,
        term: Term,
        from: String,
        granted: bool,
    ) -> Result<(), EngineError> {
        if term > self.hard_state.term {
            return self.become_follower(term);
        }
        if self.role != Role::Candidate || term < self.hard_state.term {
            return Ok(());
        }
        self.votes.insert(from, granted);
        if granted && self.has_vote_majority() {
            self.become_leader()?;
        }
        Ok(())
    }

    fn handle_vote(&mut self, req: VoteRequest) -> Result<VoteResponse, EngineError> {
        if req.term > self.hard_state.term {
            self.become_follower(req.term)?;
        }

        let term = self.hard_state.term;
        let (last_index, last_term) = self.last_log_info()?;
        let up_to_date = req.last_log_term > last_term
            || (req.last_log_term == last_term && req.last_log_index >= last_index);
        let may_vote = self.hard_state.voted_for.is_none()
            || self.hard_state.voted_for.as_deref() == Some(req.candidate.as_str());
        let granted = req.term >= term && may_vote && up_to_date;

        if granted {
            self.hard_state.voted_for = Some(req.candidate.clone());
            self.storage.set_hard_state(&self.hard_state)?;
            tracing::debug!(node = %self.name, candidate = %req.candidate, term, "vote granted");
        }

        Ok(VoteResponse { term, granted })
    }

    // ========================================================================
    // REPLICATION
    // ========================================================================

    fn broadcast_append(&self) -> Result<(), EngineError> {
        let term = self.hard_state.term;
        let last = self.last_index()?;

        for peer in self.peers.values().cloned() {
            let next = self.next_index.get(&peer.name).copied().unwrap_or(last + 1);
            if next <= self.snapshot_index {
                // the entries this peer needs are compacted away
                self.send_snapshot_to(peer)?;
                continue;
            }

            let prev_log_index = next - 1;
            let prev_log_term = self.term_at(prev_log_index)?;
            let hi = (next + self.config.max_entries_per_rpc as u64).min(last + 1);
            let entries = if next <= last {
                self.storage.entries(next, hi)?
            } else {
                Vec::new()
            };

            let req = AppendRequest {
                term,
                leader: self.name.clone(),
                leader_connection: self.connection.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: self.commit_index,
            };
            let client = self.transport.clone();
            let tx = self.msg_tx.clone();
            tokio::spawn(async move {
                match client.send_append(&peer, &req).await {
                    Ok(resp) => {
                        let _ = tx
                            .send(EngineMsg::AppendResult {
                                peer: peer.name,
                                sent_term: term,
                                resp,
                            })
                            .await;
                    }
                    Err(e) => {
                        tracing::trace!(peer = %peer.name, error = %e, "append failed")
                    }
                }
            });
        }
        Ok(())
    }

    fn handle_append_result(
        &mut self,
        peer: String,
        sent_term: Term,
        resp: AppendResponse,
    ) -> Result<(), EngineError> {
        if resp.term > self.hard_state.term {
            return self.become_follower(resp.term);
        }
        if self.role != Role::Leader || sent_term != self.hard_state.term {
            return Ok(());
        }

        if resp.success {
            let known = self.match_index.get(&peer).copied().unwrap_or(0);
            if resp.match_index > known {
                self.match_index.insert(peer.clone(), resp.match_index);
                self.next_index.insert(peer, resp.match_index + 1);
            }
            self.advance_commit()?;
        } else {
            // walk back one entry and retry on the next heartbeat
            let next = self.next_index.get(&peer).copied().unwrap_or(1);
            if next > 1 {
                self.next_index.insert(peer, next - 1);
            }
        }
        Ok(())
    }

    fn handle_append(&mut self, req: AppendRequest) -> Result<AppendResponse, EngineError> {
        if req.term < self.hard_state.term {
            return Ok(AppendResponse {
                term: self.hard_state.term,
                success: false,
                match_index: 0,
            });
        }
        if req.term > self.hard_state.term || self.role != Role::Follower {
            self.become_follower(req.term)?;
        }
        self.set_leader(Peer {
            name: req.leader.clone(),
            connection: req.leader_connection.clone(),
        });

        let term = self.hard_state.term;

        // log consistency check at prev_log_index
        let consistent = if req.prev_log_index == 0 {
            true
        } else if req.prev_log_index <= self.snapshot_index {
            // covered by the snapshot, which only ever holds committed state
            req.prev_log_index < self.snapshot_index
                || req.prev_log_term == self.snapshot_term
        } else {
            match self.storage.entry(req.prev_log_index)? {
                Some(entry) => entry.term == req.prev_log_term,
                None => false,
            }
        };
        if !consistent {
            return Ok(AppendResponse {
                term,
                success: false,
                match_index: 0,
            });
        }

        let sent = req.entries.len() as u64;
        let mut entries = req.entries;
        entries.retain(|e| e.index > self.snapshot_index);

        // drop our conflicting suffix, if any
        for entry in &entries {
            if let Some(existing) = self.storage.entry(entry.index)? {
                if existing.term != entry.term {
                    self.storage.truncate_from(entry.index)?;
                    break;
                }
            }
        }

        let last = self.storage.last_index()?;
        let fresh: Vec<LogEntry> = entries.into_iter().filter(|e| e.index > last).collect();
        if !fresh.is_empty() {
            self.storage.append(&fresh)?;
        }

        let match_index = req.prev_log_index + sent;

        // only indices this request vouches for are known to match the leader
        let new_commit = req.leader_commit.min(match_index);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.apply_committed()?;
        }

        Ok(AppendResponse {
            term,
            success: true,
            match_index,
        })
    }

    // ========================================================================
    // SNAPSHOTS
    // ========================================================================

    fn maybe_snapshot(&mut self) -> Result<(), EngineError> {
        if self.last_applied - self.snapshot_index >= self.config.snapshot_threshold {
            self.take_snapshot()?;
        }
        Ok(())
    }

    fn take_snapshot(&mut self) -> Result<(), EngineError> {
        let data = self.machine.save()?;
        let last_index = self.last_applied;
        let last_term = self.term_at(last_index)?;

        let mut members: Vec<Peer> = self.peers.values().cloned().collect();
        if self.joined {
            members.push(self.self_peer());
        }

        let snapshot = Snapshot {
            meta: SnapshotMeta {
                last_index,
                last_term,
                members,
            },
            data,
        };
        self.storage.save_snapshot(&snapshot)?;
        self.storage.compact_to(last_index)?;
        self.storage.set_commit_index(self.commit_index)?;
        self.snapshot_index = last_index;
        self.snapshot_term = last_term;

        let _ = self.events.send(EngineEvent::SnapshotTaken { last_index });
        tracing::info!(node = %self.name, last_index, "snapshot taken");
        Ok(())
    }

    fn send_snapshot_to(&self, peer: Peer) -> Result<(), EngineError> {
        let Some(snapshot) = self.storage.snapshot()? else {
            return Ok(());
        };
        let last_index = snapshot.meta.last_index;
        let req = SnapshotRequest {
            term: self.hard_state.term,
            leader: self.name.clone(),
            leader_connection: self.connection.clone(),
            snapshot,
        };
        let client = self.transport.clone();
        let tx = self.msg_tx.clone();
        tracing::debug!(node = %self.name, peer = %peer.name, last_index, "shipping snapshot");
        tokio::spawn(async move {
            match client.send_snapshot(&peer, &req).await {
                Ok(resp) => {
                    let _ = tx
                        .send(EngineMsg::SnapshotResult {
                            peer: peer.name,
                            last_index,
                            resp,
                        })
                        .await;
                }
                Err(e) => {
                    tracing::trace!(peer = %peer.name, error = %e, "snapshot send failed")
                }
            }
        });
        Ok(())
    }

    fn handle_snapshot_result(
        &mut self,
        peer: String,
        last_index: LogIndex,
        resp: SnapshotResponse,
    ) -> Result<(), EngineError> {
        if resp.term > self.hard_state.term {
            return self.become_follower(resp.term);
        }
        if self.role != Role::Leader || !resp.success {
            return Ok(());
        }
        let known = self.match_index.get(&peer).copied().unwrap_or(0);
        if last_index > known {
            self.match_index.insert(peer.clone(), last_index);
            self.next_index.insert(peer, last_index + 1);
        }
        self.advance_commit()?;
        Ok(())
    }

    fn handle_install_snapshot(
        &mut self,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse, EngineError> {
        if req.term < self.hard_state.term {
            return Ok(SnapshotResponse {
                term: self.hard_state.term,
                success: false,
            });
        }
        if req.term > self.hard_state.term || self.role != Role::Follower {
            self.become_follower(req.term)?;
        }
        self.set_leader(Peer {
            name: req.leader.clone(),
            connection: req.leader_connection.clone(),
        });

        let term = self.hard_state.term;
        let snapshot = req.snapshot;
        if snapshot.meta.last_index <= self.snapshot_index {
            return Ok(SnapshotResponse {
                term,
                success: true,
            });
        }

        if let Err(e) = self.machine.recover(&snapshot.data) {
            tracing::error!(node = %self.name, error = %e, "snapshot recovery failed");
            return Ok(SnapshotResponse {
                term,
                success: false,
            });
        }

        self.storage.truncate_from(0)?;
        self.storage.save_snapshot(&snapshot)?;
        self.storage.set_commit_index(snapshot.meta.last_index)?;
        self.snapshot_index = snapshot.meta.last_index;
        self.snapshot_term = snapshot.meta.last_term;
        self.last_applied = snapshot.meta.last_index;
        self.commit_index = self.commit_index.max(snapshot.meta.last_index);
        self.install_membership(&snapshot.meta.members);

        tracing::info!(
            node = %self.name,
            last_index = snapshot.meta.last_index,
            "snapshot installed"
        );
        Ok(SnapshotResponse {
            term,
            success: true,
        })
    }

    fn install_membership(&mut self, members: &[Peer]) {
        self.peers.clear();
        self.joined = false;
        for member in members {
            if member.name == self.name {
                self.joined = true;
            } else {
                self.peers.insert(member.name.clone(), member.clone());
            }
        }
    }

    // ========================================================================
    // ROLE TRANSITIONS
    // ========================================================================

    fn become_follower(&mut self, term: Term) -> Result<(), EngineError> {
        let from = self.role;
        self.role = Role::Follower;
        self.votes.clear();
        self.fail_pending();

        if term > self.hard_state.term {
            self.hard_state = HardState {
                term,
                voted_for: None,
            };
            self.storage.set_hard_state(&self.hard_state)?;
            let _ = self.events.send(EngineEvent::TermChange { term });
        }

        if from != Role::Follower {
            let _ = self.events.send(EngineEvent::StateChange {
                from,
                to: Role::Follower,
            });
            tracing::info!(node = %self.name, %from, term, "became follower");
        }
        Ok(())
    }

    fn become_candidate(&mut self) -> Result<(), EngineError> {
        let from = self.role;
        let term = self.hard_state.term + 1;
        self.hard_state = HardState {
            term,
            voted_for: Some(self.name.clone()),
        };
        self.storage.set_hard_state(&self.hard_state)?;

        self.role = Role::Candidate;
        self.leader = None;
        self.votes.clear();
        self.votes.insert(self.name.clone(), true);
        self.fail_pending();

        let _ = self.events.send(EngineEvent::TermChange { term });
        let _ = self.events.send(EngineEvent::StateChange {
            from,
            to: Role::Candidate,
        });
        tracing::info!(node = %self.name, term, "election started");
        Ok(())
    }

    fn become_leader(&mut self) -> Result<(), EngineError> {
        let from = self.role;
        self.role = Role::Leader;
        let me = self.self_peer();
        self.set_leader(me);

        let last = self.last_index()?;
        for name in self.peers.keys() {
            self.next_index.insert(name.clone(), last + 1);
            self.match_index.insert(name.clone(), 0);
        }
        self.votes.clear();

        let _ = self.events.send(EngineEvent::StateChange {
            from,
            to: Role::Leader,
        });
        tracing::info!(node = %self.name, term = self.hard_state.term, "became leader");
        Ok(())
    }

    fn set_leader(&mut self, peer: Peer) {
        if self.leader.as_ref().map(|p| p.name.as_str()) != Some(peer.name.as_str()) {
            let _ = self.events.send(EngineEvent::LeaderChange {
                name: peer.name.clone(),
            });
        }
        self.leader = Some(peer);
    }

    fn fail_pending(&mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.reply.send(Err(EngineError::NotLeader));
        }
    }

    // ========================================================================
    // LOG HELPERS
    // ========================================================================

    fn self_peer(&self) -> Peer {
        Peer {
            name: self.name.clone(),
            connection: self.connection.clone(),
        }
    }

    fn last_index(&self) -> Result<LogIndex, EngineError> {
        Ok(self.storage.last_index()?.max(self.snapshot_index))
    }

    fn last_log_info(&self) -> Result<(LogIndex, Term), EngineError> {
        let last = self.last_index()?;
        Ok((last, self.term_at(last)?))
    }

    fn term_at(&self, index: LogIndex) -> Result<Term, EngineError> {
        if index == 0 {
            return Ok(0);
        }
        if index == self.snapshot_index {
            return Ok(self.snapshot_term);
        }
        match self.storage.entry(index)? {
            Some(entry) => Ok(entry.term),
            None => Err(EngineError::Storage(format!("no term for index {index}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::MemStorage;
    use serde_json::json;
    use std::sync::Mutex;

    struct CounterMachine {
        count: Mutex<u64>,
    }

    impl CounterMachine {
        fn new() -> Self {
            Self {
                count: Mutex::new(0),
            }
        }
    }

    impl StateMachine for CounterMachine {
        fn apply(&self, name: &str, _body: &Value) -> Result<Value, EngineError> {
            if name != "incr" {
                return Err(EngineError::UnknownCommand(name.to_string()));
            }
            let mut count = self.count.lock().unwrap();
            *count += 1;
            Ok(json!(*count))
        }

        fn save(&self) -> Result<Vec<u8>, EngineError> {
            Ok(self.count.lock().unwrap().to_be_bytes().to_vec())
        }

        fn recover(&self, data: &[u8]) -> Result<(), EngineError> {
            let bytes: [u8; 8] = data
                .try_into()
                .map_err(|_| EngineError::Codec("bad counter snapshot".into()))?;
            *self.count.lock().unwrap() = u64::from_be_bytes(bytes);
            Ok(())
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            election_timeout_min: Duration::from_millis(40),
            election_timeout_max: Duration::from_millis(80),
            heartbeat_interval: Duration::from_millis(20),
            rpc_timeout: Duration::from_millis(50),
            snapshot_threshold: 1024,
            max_entries_per_rpc: 64,
        }
    }

    // the returned rpc sender must stay alive: dropping it reads as a closed
    // transport and shuts the loop down
    fn start_single(bootstrap: bool) -> (EngineHandle, mpsc::Sender<RpcEnvelope>) {
        let machine = Arc::new(CounterMachine::new());
        let transport = RpcClient::new(Duration::from_millis(50)).unwrap();
        Engine::start(
            "abc1234".to_string(),
            "http://localhost:0".to_string(),
            Box::new(MemStorage::new()),
            machine,
            transport,
            fast_config(),
            bootstrap,
        )
        .unwrap()
    }

    async fn wait_for_leader(handle: &EngineHandle) {
        for _ in 0..100 {
            if handle.status().await.unwrap().role == Role::Leader {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("engine never became leader");
    }

    #[test]
    fn config_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.heartbeat_interval < config.election_timeout_min);
    }

    #[test]
    fn config_rejects_inverted_timeouts() {
        let config = EngineConfig {
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(150),
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn random_timeout_stays_in_range() {
        let config = EngineConfig::default();
        for _ in 0..16 {
            let t = config.random_election_timeout();
            assert!(t >= config.election_timeout_min);
            assert!(t <= config.election_timeout_max);
        }
    }

    #[test]
    fn every_event_has_a_listed_key() {
        let events = [
            EngineEvent::StateChange {
                from: Role::Follower,
                to: Role::Leader,
            },
            EngineEvent::LeaderChange {
                name: "x".to_string(),
            },
            EngineEvent::TermChange { term: 1 },
            EngineEvent::Commit { index: 1 },
            EngineEvent::AddPeer {
                name: "x".to_string(),
            },
            EngineEvent::RemovePeer {
                name: "x".to_string(),
            },
            EngineEvent::Heartbeat { term: 1 },
            EngineEvent::SnapshotTaken { last_index: 1 },
        ];
        for event in events {
            assert!(EVENT_KEYS.contains(&event.key()));
        }
    }

    #[tokio::test]
    async fn bootstrap_node_elects_itself_and_commits() {
        let (handle, _rpc) = start_single(true);
        wait_for_leader(&handle).await;

        let result = handle.submit_app("incr", json!({})).await.unwrap();
        assert_eq!(result, json!(1));
        let result = handle.submit_app("incr", json!({})).await.unwrap();
        assert_eq!(result, json!(2));

        let status = handle.status().await.unwrap();
        assert_eq!(status.commit_index, 2);
        assert!(!status.log_empty);
    }

    #[tokio::test]
    async fn unjoined_node_stays_passive_and_rejects_writes() {
        let (handle, _rpc) = start_single(false);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.role, Role::Follower);
        assert!(status.leader.is_none());

        let err = handle.submit_app("incr", json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::NotLeader));
    }

    #[tokio::test]
    async fn unknown_command_is_rejected_in_band() {
        let (handle, _rpc) = start_single(true);
        wait_for_leader(&handle).await;

        let err = handle.submit_app("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownCommand(_)));
    }

    #[tokio::test]
    async fn snapshot_then_stop_flushes_cleanly() {
        let (handle, _rpc) = start_single(true);
        wait_for_leader(&handle).await;
        handle.submit_app("incr", json!({})).await.unwrap();

        handle.take_snapshot().await.unwrap();
        handle.stop().await.unwrap();

        // the loop is gone; further calls fail fast
        let err = handle.status().await.unwrap_err();
        assert!(matches!(err, EngineError::Stopped));
    }
}
