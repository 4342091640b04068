//! Consensus engine core types and durable storage.
//!
//! Defines the log and RPC vocabulary shared by the engine and its HTTP
//! transport, plus the [`RaftStorage`] abstraction with an in-memory
//! implementation for tests and a sled-backed one for real nodes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::oneshot;

pub type Term = u64;
pub type LogIndex = u64;

/// A cluster member: durable node name plus its base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub connection: String,
}

/// Membership change carried through the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConfigChange {
    AddPeer(Peer),
    RemovePeer { name: String },
}

/// What a log entry carries: an application command dispatched through the
/// command registry, or a membership change handled by the engine itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogCommand {
    App { name: String, body: Value },
    Config(ConfigChange),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: Term,
    pub command: LogCommand,
}

/// Term and vote, persisted before any RPC that depends on them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardState {
    pub term: Term,
    pub voted_for: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: LogIndex,
    pub last_term: Term,
    /// Full cluster membership at `last_index`, including the local node.
    pub members: Vec<Peer>,
}

/// State-machine checkpoint: opaque bytes from the machine's save hook plus
/// the log position and membership they cover.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

// ============================================================================
// RPC MESSAGES
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate: String,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: Term,
    pub leader: String,
    pub leader_connection: String,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: Term,
    pub success: bool,
    /// Highest index known replicated on the peer when `success`.
    pub match_index: LogIndex,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub term: Term,
    pub leader: String,
    pub leader_connection: String,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub term: Term,
    pub success: bool,
}

/// An inbound RPC, as handed from the transport to the engine loop.
#[derive(Debug)]
pub enum RaftRpc {
    Vote(VoteRequest),
    Append(AppendRequest),
    Snapshot(SnapshotRequest),
}

#[derive(Debug)]
pub enum RaftRpcReply {
    Vote(VoteResponse),
    Append(AppendResponse),
    Snapshot(SnapshotResponse),
}

/// Inbound RPC plus the channel its reply travels back on.
#[derive(Debug)]
pub struct RpcEnvelope {
    pub rpc: RaftRpc,
    pub reply: oneshot::Sender<RaftRpcReply>,
}

// ============================================================================
// STORAGE
// ============================================================================

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend: {0}")]
    Backend(String),
    #[error("storage codec: {0}")]
    Codec(String),
    #[error("storage io: {0}")]
    Io(String),
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Codec(e.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

/// Durable state the engine depends on: hard state, the retained log suffix,
/// the committed index and the latest snapshot.
///
/// `last_index` describes the retained log only; the engine combines it with
/// the snapshot position itself.
pub trait RaftStorage: Send + 'static {
    fn hard_state(&self) -> Result<HardState, StorageError>;
    fn set_hard_state(&mut self, state: &HardState) -> Result<(), StorageError>;

    fn commit_index(&self) -> Result<LogIndex, StorageError>;
    fn set_commit_index(&mut self, index: LogIndex) -> Result<(), StorageError>;

    /// Highest retained entry index, 0 when the log is empty.
    fn last_index(&self) -> Result<LogIndex, StorageError>;
    fn entry(&self, index: LogIndex) -> Result<Option<LogEntry>, StorageError>;
    /// Entries in `[lo, hi)`, restricted to the retained range.
    fn entries(&self, lo: LogIndex, hi: LogIndex) -> Result<Vec<LogEntry>, StorageError>;
    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError>;
    /// Drops `index` and everything after it.
    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError>;
    /// Drops everything up to and including `index` (log compaction).
    fn compact_to(&mut self, index: LogIndex) -> Result<(), StorageError>;

    fn snapshot(&self) -> Result<Option<Snapshot>, StorageError>;
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// True when there are neither entries nor a snapshot.
    fn is_empty(&self) -> Result<bool, StorageError>;
    fn flush(&mut self) -> Result<(), StorageError>;
}

// ============================================================================
// IN-MEMORY STORAGE
// ============================================================================

/// Volatile storage for tests.
#[derive(Default)]
pub struct MemStorage {
    hard_state: HardState,
    commit: LogIndex,
    entries: VecDeque<LogEntry>,
    snapshot: Option<Snapshot>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RaftStorage for MemStorage {
    fn hard_state(&self) -> Result<HardState, StorageError> {
        Ok(self.hard_state.clone())
    }

    fn set_hard_state(&mut self, state: &HardState) -> Result<(), StorageError> {
        self.hard_state = state.clone();
        Ok(())
    }

    fn commit_index(&self) -> Result<LogIndex, StorageError> {
        Ok(self.commit)
    }

    fn set_commit_index(&mut self, index: LogIndex) -> Result<(), StorageError> {
        self.commit = index;
        Ok(())
    }

    fn last_index(&self) -> Result<LogIndex, StorageError> {
        Ok(self.entries.back().map(|e| e.index).unwrap_or(0))
    }

    fn entry(&self, index: LogIndex) -> Result<Option<LogEntry>, StorageError> {
        Ok(self.entries.iter().find(|e| e.index == index).cloned())
    }

    fn entries(&self, lo: LogIndex, hi: LogIndex) -> Result<Vec<LogEntry>, StorageError> {
        Ok(self
            .entries
            .iter()
            .filter(|e| e.index >= lo && e.index < hi)
            .cloned()
            .collect())
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        self.entries.extend(entries.iter().cloned());
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        self.entries.retain(|e| e.index < index);
        Ok(())
    }

    fn compact_to(&mut self, index: LogIndex) -> Result<(), StorageError> {
        self.entries.retain(|e| e.index > index);
        Ok(())
    }

    fn snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.snapshot.clone())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.entries.is_empty() && self.snapshot.is_none())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        Ok(())
    }
}

// ============================================================================
// SLED STORAGE
// ============================================================================

const HARD_STATE_KEY: &[u8] = b"hard_state";
const COMMIT_KEY: &[u8] = b"commit";

/// Durable storage under the node's data directory: log and meta trees in a
/// sled database, the snapshot as a JSON file beside it.
pub struct SledStorage {
    db: sled::Db,
    log: sled::Tree,
    meta: sled::Tree,
    snapshot_path: PathBuf,
    snapshot: Option<Snapshot>,
}

impl SledStorage {
    pub fn open(dir: &Path) -> Result<Self, StorageError> {
        let db = sled::open(dir.join("raft"))?;
        let log = db.open_tree("log")?;
        let meta = db.open_tree("meta")?;
        let snapshot_path = dir.join("snapshot.json");

        let snapshot = match fs::read(&snapshot_path) {
            Ok(data) => Some(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            db,
            log,
            meta,
            snapshot_path,
            snapshot,
        })
    }

    fn key(index: LogIndex) -> [u8; 8] {
        index.to_be_bytes()
    }

    fn decode_index(key: &[u8]) -> Result<LogIndex, StorageError> {
        let bytes: [u8; 8] = key
            .try_into()
            .map_err(|_| StorageError::Codec("malformed log key".into()))?;
        Ok(LogIndex::from_be_bytes(bytes))
    }
}

impl RaftStorage for SledStorage {
    fn hard_state(&self) -> Result<HardState, StorageError> {
        match self.meta.get(HARD_STATE_KEY)? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(HardState::default()),
        }
    }

    fn set_hard_state(&mut self, state: &HardState) -> Result<(), StorageError> {
        self.meta.insert(HARD_STATE_KEY, serde_json::to_vec(state)?)?;
        self.meta.flush()?;
        Ok(())
    }

    fn commit_index(&self) -> Result<LogIndex, StorageError> {
        match self.meta.get(COMMIT_KEY)? {
            Some(raw) => Self::decode_index(&raw),
            None => Ok(0),
        }
    }

    fn set_commit_index(&mut self, index: LogIndex) -> Result<(), StorageError> {
        self.meta.insert(COMMIT_KEY, Self::key(index).to_vec())?;
        Ok(())
    }

    fn last_index(&self) -> Result<LogIndex, StorageError> {
        match self.log.last()? {
            Some((key, _)) => Self::decode_index(&key),
            None => Ok(0),
        }
    }

    fn entry(&self, index: LogIndex) -> Result<Option<LogEntry>, StorageError> {
        match self.log.get(Self::key(index))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn entries(&self, lo: LogIndex, hi: LogIndex) -> Result<Vec<LogEntry>, StorageError> {
        let mut out = Vec::new();
        for item in self.log.range(Self::key(lo)..Self::key(hi)) {
            let (_, raw) = item?;
            out.push(serde_json::from_slice(&raw)?);
        }
        Ok(out)
    }

    fn append(&mut self, entries: &[LogEntry]) -> Result<(), StorageError> {
        for entry in entries {
            self.log
                .insert(Self::key(entry.index), serde_json::to_vec(entry)?)?;
        }
        self.log.flush()?;
        Ok(())
    }

    fn truncate_from(&mut self, index: LogIndex) -> Result<(), StorageError> {
        let keys: Vec<_> = self
            .log
            .range(Self::key(index)..)
            .map(|item| item.map(|(k, _)| k))
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.log.remove(key)?;
        }
        Ok(())
    }

    fn compact_to(&mut self, index: LogIndex) -> Result<(), StorageError> {
        let keys: Vec<_> = self
            .log
            .range(..=Self::key(index))
            .map(|item| item.map(|(k, _)| k))
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.log.remove(key)?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Option<Snapshot>, StorageError> {
        Ok(self.snapshot.clone())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> Result<(), StorageError> {
        // write-then-rename so a crash never leaves a torn snapshot
        let tmp = self.snapshot_path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(snapshot)?)?;
        fs::rename(&tmp, &self.snapshot_path)?;
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.log.first()?.is_none() && self.snapshot.is_none())
    }

    fn flush(&mut self) -> Result<(), StorageError> {
        self.db.flush()?;
        self.log.flush()?;
        self.meta.flush()?;
        Ok(())
    }
}
