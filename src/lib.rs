//! Replicated in-memory JSON document store.
//!
//! A small cluster of nodes keeps one JSON document in sync. Clients address
//! fields with JSON Pointer paths and write under an optimistic
//! compare-and-swap discipline; every mutation travels through a Raft-style
//! replicated log so all replicas apply the same ordered command sequence.
//!
//! # Modules
//!
//! - [`pointer`]: JSON Pointer parsing and encoding
//! - [`dict`]: the mutex-guarded document with its monotonic CAS counter
//! - [`command`]: the replicated write commands and their registry
//! - [`raft`]: consensus engine types and durable storage
//! - [`engine`]: the consensus loop and its handle
//! - [`transport`]: HTTP transport for engine RPCs
//! - [`mux`]: shared HTTP multiplexer
//! - [`handler`]: client-facing `/dict`, `/join`, `/leave` endpoints
//! - [`server`]: per-node lifecycle (create, install, serve, stop)
//! - [`client`]: HTTP client library with leader discovery
//! - [`stats`]: counters fed from engine events

pub mod client;
pub mod command;
pub mod dict;
pub mod engine;
pub mod handler;
pub mod mux;
pub mod pointer;
pub mod raft;
pub mod server;
pub mod stats;
pub mod transport;

pub use client::{ClientError, DictClient};
pub use command::{register_commands, DeleteCommand, DictMachine, SetCommand};
pub use dict::{Dict, DictError, NULL_CAS};
pub use engine::{EngineConfig, EngineError, EngineEvent, EngineHandle, EngineStatus};
pub use mux::Mux;
pub use server::Server;
pub use stats::Stats;
