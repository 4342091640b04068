//! End-to-end scenarios against a single node: CAS discipline over the wire,
//! root replacement, and snapshot-backed restarts.

mod common;

use anyhow::Result;
use common::{start_node, wait_for_leader};
use raftdict::ClientError;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn cas_happy_path() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node = start_node(dir.path(), 21101, "").await?;
    let client = node.client();

    assert_eq!(client.get_cas().await?, 1);
    assert_eq!(client.set_cas("/eyeColor", json!("brown"), 1).await?, 2);

    let (value, cas) = client.get("/eyeColor").await?;
    assert_eq!(value, json!("brown"));
    assert_eq!(cas, 2);

    node.stop().await
}

#[tokio::test]
async fn delete_removes_the_field() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node = start_node(dir.path(), 21102, "").await?;
    let client = node.client();

    let cas = client.get_cas().await?;
    let cas = client
        .set_cas("", json!({"eyeColor": "blue", "age": 30}), cas)
        .await?;

    let next = client.delete_cas("/eyeColor", cas).await?;
    assert_eq!(next, cas + 1);

    match client.get("/eyeColor").await {
        Err(ClientError::Api(err)) => assert_eq!(err, "errorInvalidPath"),
        other => panic!("expected errorInvalidPath, got {other:?}"),
    }
    assert_eq!(client.get_cas().await?, cas + 1);

    node.stop().await
}

#[tokio::test]
async fn cas_mismatch_is_rejected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node = start_node(dir.path(), 21103, "").await?;
    let client = node.client();

    // current CAS is 1; 5 must be refused without consuming a CAS
    match client.set_cas("/x", json!(1), 5).await {
        Err(ClientError::Api(err)) => assert_eq!(err, "errorInvalidCAS"),
        other => panic!("expected errorInvalidCAS, got {other:?}"),
    }
    assert_eq!(client.get_cas().await?, 1);

    assert_eq!(client.set_cas("/x", json!(1), 1).await?, 2);

    node.stop().await
}

#[tokio::test]
async fn root_replacement_requires_a_mapping() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node = start_node(dir.path(), 21104, "").await?;
    let client = node.client();

    let cas = client.get_cas().await?;
    let next = client.set_cas("", json!({"k": "v"}), cas).await?;

    let (value, cas) = client.get("").await?;
    assert_eq!(value, json!({"k": "v"}));
    assert_eq!(cas, next);

    match client.set_cas("", json!("not a mapping"), next).await {
        Err(ClientError::Api(err)) => assert_eq!(err, "errorInvalidType"),
        other => panic!("expected errorInvalidType, got {other:?}"),
    }

    node.stop().await
}

#[tokio::test]
async fn unchecked_writes_skip_the_cas() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node = start_node(dir.path(), 21105, "").await?;
    let client = node.client();

    let start = client.get_cas().await?;
    for i in 0..5 {
        client.set(&format!("/key{i}"), json!(i)).await?;
    }
    assert_eq!(client.get_cas().await?, start + 5);

    client.delete("/key0").await?;
    assert_eq!(client.get_cas().await?, start + 6);

    node.stop().await
}

#[tokio::test]
async fn single_node_reports_itself_as_leader() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let node = start_node(dir.path(), 21106, "").await?;
    let client = node.client();

    let (name, addr) = wait_for_leader(&client, Duration::from_secs(5)).await?;
    assert_eq!(name, node.server.name());
    assert_eq!(addr, node.addr);

    node.stop().await
}

#[tokio::test]
async fn snapshot_survives_restart() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let node = start_node(dir.path(), 21107, "").await?;
    let client = node.client();
    for i in 0..8 {
        client.set(&format!("/key{i}"), json!(i * 10)).await?;
    }
    let (doc_before, cas_before) = client.get("").await?;
    let name_before = node.server.name().to_string();
    node.stop().await?;

    // same data directory: identity, document and CAS must come back intact
    let node = start_node(dir.path(), 21107, "").await?;
    let client = node.client();
    let (doc_after, cas_after) = client.get("").await?;
    assert_eq!(doc_after, doc_before);
    assert_eq!(cas_after, cas_before);
    assert_eq!(node.server.name(), name_before);

    // and the node still accepts writes
    let cas = client.get_cas().await?;
    assert_eq!(client.set_cas("/after", json!(true), cas).await?, cas + 1);

    node.stop().await
}
