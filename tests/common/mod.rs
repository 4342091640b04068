//! Shared harness: spawn real nodes on localhost and drive them through the
//! public client.

use anyhow::{bail, Result};
use raftdict::{DictClient, Mux, Server};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub struct TestNode {
    pub server: Arc<Server>,
    pub addr: String,
    serve: JoinHandle<()>,
}

/// Starts one node: bind, serve, install. `join` is the `host:port` of a
/// cluster member, or empty to bootstrap/recover.
pub async fn start_node(path: &Path, port: u16, join: &str) -> Result<TestNode> {
    let mux = Arc::new(Mux::new());
    let server = Server::new(path, "127.0.0.1", port, mux.clone())?;

    // a freshly stopped node may not have released the port yet
    let mut listener = None;
    for _ in 0..40 {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(l) => {
                listener = Some(l);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    let Some(listener) = listener else {
        bail!("port {port} never became available");
    };

    let serve_mux = mux.clone();
    let serve = tokio::spawn(async move {
        let _ = serve_mux.serve(listener).await;
    });

    server.clone().install(join).await?;
    Ok(TestNode {
        server,
        addr: format!("http://127.0.0.1:{port}"),
        serve,
    })
}

impl TestNode {
    pub fn client(&self) -> DictClient {
        DictClient::new(&self.addr).expect("client")
    }

    pub async fn stop(self) -> Result<()> {
        self.server.stop().await?;
        self.serve.abort();
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}

/// Polls until the node reports a leader, returning the `(name, address)`
/// pair.
pub async fn wait_for_leader(client: &DictClient, timeout: Duration) -> Result<(String, String)> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok((name, addr)) = client.get_leader().await {
            if !name.is_empty() && !addr.is_empty() {
                return Ok((name, addr));
            }
        }
        if tokio::time::Instant::now() > deadline {
            bail!("no leader within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Unchecked write following the redirect protocol: on `NotLeader`,
/// re-resolve the leader and retry against the reported address.
pub async fn set_with_redirect(
    client: &DictClient,
    path: &str,
    value: serde_json::Value,
    timeout: Duration,
) -> Result<u64> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut target = client.clone();
    loop {
        match target.set(path, value.clone()).await {
            Ok(cas) => return Ok(cas),
            Err(raftdict::ClientError::NotLeader)
            | Err(raftdict::ClientError::Http(_))
            | Err(raftdict::ClientError::Server { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        if tokio::time::Instant::now() > deadline {
            bail!("write to {path} kept failing for {timeout:?}");
        }
        if let Ok((_, addr)) = client.get_leader().await {
            if !addr.is_empty() {
                target = DictClient::new(&addr)?;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Polls until `path` on the node reads back `expected`.
pub async fn wait_for_value(
    client: &DictClient,
    path: &str,
    expected: &serde_json::Value,
    timeout: Duration,
) -> Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok((value, _)) = client.get(path).await {
            if &value == expected {
                return Ok(());
            }
        }
        if tokio::time::Instant::now() > deadline {
            bail!("{path} never converged to {expected} within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
