//! HTTP client for the replicated document store.
//!
//! Thin wrapper over the wire contract: JSON bodies against `/dict`, the
//! CAS probe via `HEAD`/`ETag`, and leader discovery via the leader-hint
//! headers. Writes without an explicit CAS send the null CAS (0), which the
//! server interprets as "skip the check".
//!
//! A write that lands on a follower comes back as
//! [`ClientError::NotLeader`]; callers should re-resolve the leader with
//! [`DictClient::get_leader`] against any known node and retry there. Any
//! cached leader address is advisory only.

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::handler::{LEADER_ADDR_HEADER, LEADER_HEADER};

/// Errors that can occur when using the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The write reached a node that is not the leader.
    #[error("not the leader")]
    NotLeader,

    /// In-band application error (invalid path, type or CAS).
    #[error("{0}")]
    Api(String),

    /// Server returned a non-200 status.
    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    /// Response did not match the wire contract.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

fn wire_error(err: &str) -> ClientError {
    if err == "notLeader" {
        ClientError::NotLeader
    } else {
        ClientError::Api(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(default)]
    value: Value,
    #[serde(rename = "CAS")]
    cas: f64,
    err: String,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    #[serde(rename = "CAS")]
    cas: f64,
    err: String,
}

/// Client for one node of the document store.
#[derive(Debug, Clone)]
pub struct DictClient {
    server_addr: String,
    http: reqwest::Client,
}

impl DictClient {
    /// Creates a client for `server_addr`, e.g. `http://localhost:4001`.
    pub fn new(server_addr: impl Into<String>) -> Result<Self, ClientError> {
        let server_addr = server_addr.into().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { server_addr, http })
    }

    /// Current CAS of the node's document.
    pub async fn get_cas(&self) -> Result<u64, ClientError> {
        let resp = self.http.head(self.dict_url()).send().await?;
        let etag = resp
            .headers()
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ClientError::InvalidResponse("missing ETag header".to_string()))?;
        let cas: f64 = etag
            .parse()
            .map_err(|_| ClientError::InvalidResponse(format!("bad ETag {etag:?}")))?;
        Ok(cas as u64)
    }

    /// Cluster leader as `(name, address)`; empty strings when unknown.
    pub async fn get_leader(&self) -> Result<(String, String), ClientError> {
        let resp = self.http.head(self.dict_url()).send().await?;
        let header = |name: &str| {
            resp.headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        Ok((header(LEADER_HEADER), header(LEADER_ADDR_HEADER)))
    }

    /// Reads the value at `path` from the node's local document.
    pub async fn get(&self, path: &str) -> Result<(Value, u64), ClientError> {
        let resp: GetResponse = self
            .do_json(Method::GET, &json!({"path": path}))
            .await?;
        if !resp.err.is_empty() {
            return Err(wire_error(&resp.err));
        }
        Ok((resp.value, resp.cas as u64))
    }

    /// Writes without a CAS check; at-least-once, no concurrency protection.
    pub async fn set(&self, path: &str, value: Value) -> Result<u64, ClientError> {
        self.write(Method::PUT, json!({"path": path, "value": value, "CAS": 0.0}))
            .await
    }

    /// Writes under the supplied CAS.
    pub async fn set_cas(&self, path: &str, value: Value, cas: u64) -> Result<u64, ClientError> {
        self.write(
            Method::PUT,
            json!({"path": path, "value": value, "CAS": cas as f64}),
        )
        .await
    }

    /// Deletes without a CAS check.
    pub async fn delete(&self, path: &str) -> Result<u64, ClientError> {
        self.write(Method::DELETE, json!({"path": path, "CAS": 0.0}))
            .await
    }

    /// Deletes under the supplied CAS.
    pub async fn delete_cas(&self, path: &str, cas: u64) -> Result<u64, ClientError> {
        self.write(Method::DELETE, json!({"path": path, "CAS": cas as f64}))
            .await
    }

    async fn write(&self, method: Method, body: Value) -> Result<u64, ClientError> {
        let resp: WriteResponse = self.do_json(method, &body).await?;
        if !resp.err.is_empty() {
            return Err(wire_error(&resp.err));
        }
        Ok(resp.cas as u64)
    }

    async fn do_json<T: DeserializeOwned>(
        &self,
        method: Method,
        body: &Value,
    ) -> Result<T, ClientError> {
        let resp = self
            .http
            .request(method, self.dict_url())
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(ClientError::Server {
                status: status.as_u16(),
                message,
            });
        }
        Ok(resp.json().await?)
    }

    fn dict_url(&self) -> String {
        format!("{}/dict", self.server_addr)
    }
}
