//! Per-node lifecycle.
//!
//! A `Server` ties everything together: the durable node identity and data
//! directory, the document store, the consensus engine with its transport,
//! the HTTP handlers and the statistics subscription. The sequence is
//! create → install (bootstrap, join, or recover) → serve → stop, and a node
//! killed at any point reconstructs its state from snapshot + log.

use rand::Rng;
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::command::{register_commands, DeleteCommand, DictMachine, SetCommand};
use crate::dict::{Dict, DictError, NULL_CAS};
use crate::engine::{Engine, EngineConfig, EngineError, EngineHandle};
use crate::handler::{self, JoinRequest};
use crate::mux::Mux;
use crate::raft::{ConfigChange, LogCommand, Peer, SledStorage, StorageError};
use crate::stats::Stats;
use crate::transport::{self, RpcClient, TransportError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("configuration: {0}")]
    Config(String),
    #[error("join request failed: {0}")]
    Join(String),
    #[error("cannot join a cluster with an existing log")]
    JoinWithLog,
}

/// One node of the replicated document store.
pub struct Server {
    name: String,
    path: PathBuf,
    listen_addr: String,
    mux: Arc<Mux>,
    dict: Arc<Dict>,
    stats: Stats,
    engine: OnceLock<EngineHandle>,
}

impl Server {
    /// Creates a node: ensures the data directory, loads or generates the
    /// durable 7-hex-character name, and builds an empty document with
    /// CAS 1. The node is not started until [`Server::install`].
    pub fn new(
        path: impl Into<PathBuf>,
        host: &str,
        port: u16,
        mux: Arc<Mux>,
    ) -> Result<Arc<Self>, ServerError> {
        let path = path.into();
        fs::create_dir_all(&path)?;
        let name = load_or_create_name(&path.join("name"))?;

        tracing::info!(node = %name, path = %path.display(), "node created");
        Ok(Arc::new(Self {
            name,
            path,
            listen_addr: format!("{host}:{port}"),
            mux,
            dict: Arc::new(Dict::new()),
            stats: Stats::new(),
            engine: OnceLock::new(),
        }))
    }

    /// Starts the node: brings up the consensus engine (which reloads any
    /// snapshot into the store and replays the committed log), joins or
    /// bootstraps a cluster, registers the HTTP handlers and subscribes the
    /// statistics collector.
    ///
    /// `leader` is the `host:port` of an existing cluster member to join,
    /// or empty to bootstrap/recover locally.
    pub async fn install(self: Arc<Self>, leader: &str) -> Result<(), ServerError> {
        register_commands();

        let config = EngineConfig::load().map_err(|e| ServerError::Config(e.to_string()))?;
        let rpc_client = RpcClient::new(config.rpc_timeout)?;
        let storage = SledStorage::open(&self.path)?;
        let machine = Arc::new(DictMachine::new(self.dict.clone()));

        let (engine, rpc_tx) = Engine::start(
            self.name.clone(),
            self.connection_string(),
            Box::new(storage),
            machine,
            rpc_client,
            config,
            leader.is_empty(),
        )?;
        transport::install(&self.mux, rpc_tx);

        let status = engine.status().await?;
        if !leader.is_empty() {
            if !status.log_empty {
                return Err(ServerError::JoinWithLog);
            }
            // make sure nothing stale is left before the cluster teaches us
            // its membership
            engine.remove_peers().await?;
            self.self_join(leader).await?;
        } else if status.log_empty {
            tracing::info!(node = %self.name, "bootstrapping new cluster");
            self.bootstrap(&engine).await?;
        } else {
            tracing::info!(node = %self.name, "recovered from log");
        }

        let _ = self.engine.set(engine);
        handler::install(&self.mux, self.clone());
        self.subscribe_stats();
        Ok(())
    }

    /// Stops the node: flushes the committed index, checkpoints the document
    /// to the data directory, and halts the engine.
    pub async fn stop(&self) -> Result<(), ServerError> {
        let Some(engine) = self.engine.get() else {
            return Ok(());
        };
        engine.take_snapshot().await?;
        engine.stop().await?;
        tracing::info!(node = %self.name, "node stopped");
        Ok(())
    }

    // ========================================================================
    // LOCAL API
    // ========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_string(&self) -> String {
        format!("http://{}", self.listen_addr)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Current CAS of the local document.
    pub fn db_cas(&self) -> f64 {
        self.dict.cas()
    }

    /// Local read; may be stale on a follower.
    pub fn db_get(&self, path: &str) -> Result<(Value, f64), DictError> {
        self.dict.get(path)
    }

    /// Replicated write without a CAS check.
    pub async fn db_set(&self, path: &str, value: Value) -> Result<f64, EngineError> {
        self.db_set_cas(path, value, NULL_CAS).await
    }

    /// Replicated write under the supplied CAS.
    pub async fn db_set_cas(
        &self,
        path: &str,
        value: Value,
        cas: f64,
    ) -> Result<f64, EngineError> {
        let command = SetCommand::new(path, value, cas);
        let body =
            serde_json::to_value(&command).map_err(|e| EngineError::Codec(e.to_string()))?;
        let next = self.engine()?.submit_app(SetCommand::NAME, body).await?;
        Ok(next.as_f64().unwrap_or(NULL_CAS))
    }

    /// Replicated delete without a CAS check.
    pub async fn db_delete(&self, path: &str) -> Result<f64, EngineError> {
        self.db_delete_cas(path, NULL_CAS).await
    }

    /// Replicated delete under the supplied CAS.
    pub async fn db_delete_cas(&self, path: &str, cas: f64) -> Result<f64, EngineError> {
        let command = DeleteCommand::new(path, cas);
        let body =
            serde_json::to_value(&command).map_err(|e| EngineError::Codec(e.to_string()))?;
        let next = self.engine()?.submit_app(DeleteCommand::NAME, body).await?;
        Ok(next.as_f64().unwrap_or(NULL_CAS))
    }

    /// Current leader as a `(name, address)` pair, empty strings when
    /// unknown.
    pub async fn get_leader(&self) -> (String, String) {
        let Ok(engine) = self.engine() else {
            return (String::new(), String::new());
        };
        match engine.status().await {
            Ok(status) => status
                .leader
                .map(|p| (p.name, p.connection))
                .unwrap_or_default(),
            Err(_) => (String::new(), String::new()),
        }
    }

    /// Routes a peer join through the log; leader only.
    pub async fn join_peer(&self, peer: Peer) -> Result<(), EngineError> {
        self.engine()?
            .submit(LogCommand::Config(ConfigChange::AddPeer(peer)))
            .await
            .map(|_| ())
    }

    /// Routes a peer departure through the log; leader only.
    pub async fn leave_peer(&self, name: String) -> Result<(), EngineError> {
        self.engine()?
            .submit(LogCommand::Config(ConfigChange::RemovePeer { name }))
            .await
            .map(|_| ())
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    fn engine(&self) -> Result<&EngineHandle, EngineError> {
        self.engine.get().ok_or(EngineError::Stopped)
    }

    fn peer(&self) -> Peer {
        Peer {
            name: self.name.clone(),
            connection: self.connection_string(),
        }
    }

    /// Commits this node's own membership into a brand-new single-node
    /// cluster, waiting out the initial self-election.
    async fn bootstrap(&self, engine: &EngineHandle) -> Result<(), ServerError> {
        let command = LogCommand::Config(ConfigChange::AddPeer(self.peer()));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            match engine.submit(command.clone()).await {
                Ok(_) => return Ok(()),
                Err(EngineError::NotLeader) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn self_join(&self, leader: &str) -> Result<(), ServerError> {
        let request = JoinRequest {
            name: self.name.clone(),
            connection: self.connection_string(),
        };
        let url = format!("http://{leader}/join");
        tracing::info!(node = %self.name, leader, "joining cluster");

        let resp = reqwest::Client::new()
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ServerError::Join(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(ServerError::Join(format!("{status}: {text}")));
        }
        Ok(())
    }

    fn subscribe_stats(&self) {
        let Ok(engine) = self.engine() else {
            return;
        };
        let mut events = engine.subscribe();
        let stats = self.stats.clone();
        let node = self.name.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        tracing::trace!(node = %node, event = event.key(), "engine event");
                        stats.incr(event.key());
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(node = %node, skipped, "statistics subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
}

fn load_or_create_name(file: &Path) -> std::io::Result<String> {
    match fs::read_to_string(file) {
        Ok(name) => Ok(name.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let name = format!("{:07x}", rand::rng().random_range(0u32..0x1000_0000));
            fs::write(file, &name)?;
            Ok(name)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_name_is_seven_hex_chars_and_durable() {
        let dir = tempfile::tempdir().unwrap();
        let mux = Arc::new(Mux::new());

        let first = Server::new(dir.path(), "localhost", 4001, mux.clone()).unwrap();
        assert_eq!(first.name().len(), 7);
        assert!(first.name().chars().all(|c| c.is_ascii_hexdigit()));

        let second = Server::new(dir.path(), "localhost", 4001, mux).unwrap();
        assert_eq!(first.name(), second.name());
    }

    #[test]
    fn connection_string_is_a_base_url() {
        let dir = tempfile::tempdir().unwrap();
        let mux = Arc::new(Mux::new());
        let server = Server::new(dir.path(), "localhost", 4321, mux).unwrap();
        assert_eq!(server.connection_string(), "http://localhost:4321");
    }

    #[test]
    fn fresh_node_document_starts_at_cas_one() {
        let dir = tempfile::tempdir().unwrap();
        let mux = Arc::new(Mux::new());
        let server = Server::new(dir.path(), "localhost", 4001, mux).unwrap();
        assert_eq!(server.db_cas(), 1.0);
        let (value, cas) = server.db_get("").unwrap();
        assert_eq!(value, serde_json::json!({}));
        assert_eq!(cas, 1.0);
    }
}
