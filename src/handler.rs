//! Client-facing HTTP endpoints.
//!
//! `/dict` carries the document protocol (HEAD probe, GET read, PUT write,
//! DELETE remove); `/join` and `/leave` carry peer membership. Application
//! errors ride in-band in the `"err"` field with status 200, so clients can
//! tell them from transport failures; malformed requests and infrastructure
//! errors are a plain-text 500.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::dict::NULL_CAS;
use crate::engine::EngineError;
use crate::mux::{json_response, text_response, HandlerResponse, Mux};
use crate::raft::Peer;
use crate::server::Server;

pub const DICT_ROUTE: &str = "/dict";
pub const JOIN_ROUTE: &str = "/join";
pub const LEAVE_ROUTE: &str = "/leave";

/// Leader-hint headers returned on HEAD probes.
pub const LEADER_HEADER: &str = "X-Leader";
pub const LEADER_ADDR_HEADER: &str = "X-Leader-Addr";

#[derive(Debug, Deserialize)]
struct GetRequest {
    path: String,
}

#[derive(Debug, Deserialize)]
struct PutRequest {
    path: String,
    value: Value,
    #[serde(rename = "CAS")]
    cas: f64,
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    path: String,
    #[serde(rename = "CAS")]
    cas: f64,
}

#[derive(Debug, Serialize)]
struct GetResponse {
    value: Value,
    #[serde(rename = "CAS")]
    cas: f64,
    err: String,
}

#[derive(Debug, Serialize)]
struct WriteResponse {
    #[serde(rename = "CAS")]
    cas: f64,
    err: String,
}

/// Membership request posted to a leader's `/join` route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    pub connection: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub name: String,
}

/// Registers the document and membership routes.
pub fn install(mux: &Mux, server: Arc<Server>) {
    let dict_server = server.clone();
    mux.handle(DICT_ROUTE, move |req| {
        dict_route(dict_server.clone(), req)
    });

    let join_server = server.clone();
    mux.handle(JOIN_ROUTE, move |req| join_route(join_server.clone(), req));

    mux.handle(LEAVE_ROUTE, move |req| leave_route(server.clone(), req));
}

async fn dict_route(server: Arc<Server>, req: Request<Incoming>) -> HandlerResponse {
    tracing::debug!(node = %server.name(), method = %req.method(), "dict request");
    let method = req.method().clone();
    match method {
        Method::HEAD => head_dict(server).await,
        Method::GET => get_dict(server, req).await,
        Method::PUT => put_dict(server, req).await,
        Method::DELETE => delete_dict(server, req).await,
        _ => text_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
    }
}

async fn head_dict(server: Arc<Server>) -> HandlerResponse {
    let (leader, leader_addr) = server.get_leader().await;
    Response::builder()
        .status(StatusCode::OK)
        .header("ETag", etag(server.db_cas()))
        .header(LEADER_HEADER, leader)
        .header(LEADER_ADDR_HEADER, leader_addr)
        .body(Full::new(Bytes::new()))
        .expect("static response parts")
}

async fn get_dict(server: Arc<Server>, req: Request<Incoming>) -> HandlerResponse {
    let request: GetRequest = match read_json(req).await {
        Ok(request) => request,
        Err(msg) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, &msg),
    };
    match server.db_get(&request.path) {
        Ok((value, cas)) => json_with_etag(
            cas,
            &GetResponse {
                value,
                cas,
                err: String::new(),
            },
        ),
        Err(e) => json_with_etag(
            NULL_CAS,
            &GetResponse {
                value: Value::Null,
                cas: NULL_CAS,
                err: e.to_string(),
            },
        ),
    }
}

async fn put_dict(server: Arc<Server>, req: Request<Incoming>) -> HandlerResponse {
    let request: PutRequest = match read_json(req).await {
        Ok(request) => request,
        Err(msg) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, &msg),
    };
    write_result(
        server
            .db_set_cas(&request.path, request.value, request.cas)
            .await,
    )
}

async fn delete_dict(server: Arc<Server>, req: Request<Incoming>) -> HandlerResponse {
    let request: DeleteRequest = match read_json(req).await {
        Ok(request) => request,
        Err(msg) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, &msg),
    };
    write_result(server.db_delete_cas(&request.path, request.cas).await)
}

async fn join_route(server: Arc<Server>, req: Request<Incoming>) -> HandlerResponse {
    let request: JoinRequest = match read_json(req).await {
        Ok(request) => request,
        Err(msg) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, &msg),
    };
    match server
        .join_peer(Peer {
            name: request.name,
            connection: request.connection,
        })
        .await
    {
        Ok(()) => text_response(StatusCode::OK, ""),
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn leave_route(server: Arc<Server>, req: Request<Incoming>) -> HandlerResponse {
    let request: LeaveRequest = match read_json(req).await {
        Ok(request) => request,
        Err(msg) => return text_response(StatusCode::INTERNAL_SERVER_ERROR, &msg),
    };
    match server.leave_peer(request.name).await {
        Ok(()) => text_response(StatusCode::OK, ""),
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// Write outcome mapping: new CAS or an in-band error for application-level
/// rejections (including `notLeader`, which clients redirect on); anything
/// else is an infrastructure 500.
fn write_result(result: Result<f64, EngineError>) -> HandlerResponse {
    match result {
        Ok(cas) => json_response(
            StatusCode::OK,
            &WriteResponse {
                cas,
                err: String::new(),
            },
        ),
        Err(e @ (EngineError::Command(_) | EngineError::NotLeader)) => json_response(
            StatusCode::OK,
            &WriteResponse {
                cas: NULL_CAS,
                err: e.to_string(),
            },
        ),
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn etag(cas: f64) -> String {
    format!("{}", cas as u64)
}

fn json_with_etag<T: Serialize>(cas: f64, body: &T) -> HandlerResponse {
    let mut resp = json_response(StatusCode::OK, body);
    if let Ok(value) = etag(cas).parse() {
        resp.headers_mut().insert("ETag", value);
    }
    resp
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
