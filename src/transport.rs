//! HTTP transport for consensus RPCs.
//!
//! The receive side installs routes under the `/raft` prefix into the shared
//! multiplexer; each handler forwards the decoded RPC to the engine loop and
//! waits for its reply. The send side POSTs JSON to the same routes on peers
//! with a short per-RPC timeout.

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::mux::{json_response, text_response, HandlerResponse, Mux};
use crate::raft::{
    AppendRequest, AppendResponse, Peer, RaftRpc, RaftRpcReply, RpcEnvelope, SnapshotRequest,
    SnapshotResponse, VoteRequest, VoteResponse,
};

/// Path prefix every consensus route lives under.
pub const RAFT_PREFIX: &str = "/raft";

const VOTE_ROUTE: &str = "/raft/vote";
const APPEND_ROUTE: &str = "/raft/append";
const SNAPSHOT_ROUTE: &str = "/raft/snapshot";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("peer returned status {0}")]
    Status(reqwest::StatusCode),
}

// ============================================================================
// RECEIVE SIDE
// ============================================================================

/// Installs the consensus routes, wiring them to the engine's RPC channel.
pub fn install(mux: &Mux, tx: mpsc::Sender<RpcEnvelope>) {
    let vote_tx = tx.clone();
    mux.handle(VOTE_ROUTE, move |req| {
        let tx = vote_tx.clone();
        async move {
            match read_json::<VoteRequest>(req).await {
                Ok(rpc) => match relay(tx, RaftRpc::Vote(rpc)).await {
                    Ok(RaftRpcReply::Vote(resp)) => json_response(StatusCode::OK, &resp),
                    Ok(_) => engine_mismatch(),
                    Err(msg) => text_response(StatusCode::INTERNAL_SERVER_ERROR, msg),
                },
                Err(msg) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &msg),
            }
        }
    });

    let append_tx = tx.clone();
    mux.handle(APPEND_ROUTE, move |req| {
        let tx = append_tx.clone();
        async move {
            match read_json::<AppendRequest>(req).await {
                Ok(rpc) => match relay(tx, RaftRpc::Append(rpc)).await {
                    Ok(RaftRpcReply::Append(resp)) => json_response(StatusCode::OK, &resp),
                    Ok(_) => engine_mismatch(),
                    Err(msg) => text_response(StatusCode::INTERNAL_SERVER_ERROR, msg),
                },
                Err(msg) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &msg),
            }
        }
    });

    mux.handle(SNAPSHOT_ROUTE, move |req| {
        let tx = tx.clone();
        async move {
            match read_json::<SnapshotRequest>(req).await {
                Ok(rpc) => match relay(tx, RaftRpc::Snapshot(rpc)).await {
                    Ok(RaftRpcReply::Snapshot(resp)) => json_response(StatusCode::OK, &resp),
                    Ok(_) => engine_mismatch(),
                    Err(msg) => text_response(StatusCode::INTERNAL_SERVER_ERROR, msg),
                },
                Err(msg) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &msg),
            }
        }
    });
}

async fn relay(
    tx: mpsc::Sender<RpcEnvelope>,
    rpc: RaftRpc,
) -> Result<RaftRpcReply, &'static str> {
    let (reply, rx) = oneshot::channel();
    tx.send(RpcEnvelope { rpc, reply })
        .await
        .map_err(|_| "engine unavailable")?;
    rx.await.map_err(|_| "engine dropped the request")
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, String> {
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|e| e.to_string())?
        .to_bytes();
    serde_json::from_slice(&bytes).map_err(|e| e.to_string())
}

fn engine_mismatch() -> HandlerResponse {
    text_response(StatusCode::INTERNAL_SERVER_ERROR, "engine reply mismatch")
}

// ============================================================================
// SEND SIDE
// ============================================================================

/// Outbound RPC client shared by the engine's replication and election
/// fan-out tasks.
#[derive(Clone)]
pub struct RpcClient {
    http: reqwest::Client,
}

impl RpcClient {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    pub async fn send_vote(
        &self,
        peer: &Peer,
        req: &VoteRequest,
    ) -> Result<VoteResponse, TransportError> {
        self.post(peer, VOTE_ROUTE, req).await
    }

    pub async fn send_append(
        &self,
        peer: &Peer,
        req: &AppendRequest,
    ) -> Result<AppendResponse, TransportError> {
        self.post(peer, APPEND_ROUTE, req).await
    }

    pub async fn send_snapshot(
        &self,
        peer: &Peer,
        req: &SnapshotRequest,
    ) -> Result<SnapshotResponse, TransportError> {
        self.post(peer, SNAPSHOT_ROUTE, req).await
    }

    async fn post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        peer: &Peer,
        route: &str,
        req: &Req,
    ) -> Result<Resp, TransportError> {
        let url = format!("{}{}", peer.connection, route);
        let resp = self.http.post(&url).json(req).send().await?;
        if !resp.status().is_success() {
            return Err(TransportError::Status(resp.status()));
        }
        Ok(resp.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_share_the_prefix() {
        for route in [VOTE_ROUTE, APPEND_ROUTE, SNAPSHOT_ROUTE] {
            assert!(route.starts_with(RAFT_PREFIX));
        }
    }

    #[test]
    fn rpc_bodies_round_trip() {
        let req = VoteRequest {
            term: 3,
            candidate: "abc1234".to_string(),
            last_log_index: 9,
            last_log_term: 2,
        };
        let raw = serde_json::to_vec(&req).unwrap();
        let back: VoteRequest = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back.term, 3);
        assert_eq!(back.candidate, "abc1234");

        let resp = AppendResponse {
            term: 3,
            success: true,
            match_index: 9,
        };
        let raw = serde_json::to_vec(&resp).unwrap();
        let back: AppendResponse = serde_json::from_slice(&raw).unwrap();
        assert!(back.success);
        assert_eq!(back.match_index, 9);
    }
}
