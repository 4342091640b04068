//! Shared HTTP multiplexer.
//!
//! One route table serves both the client-facing endpoints and the consensus
//! transport. Handlers are registered at install time and dispatched by exact
//! path; a panicking handler is contained and answered with a 500 instead of
//! taking the node down.

use bytes::Bytes;
use futures::FutureExt;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::net::TcpListener;

pub type HandlerResponse = Response<Full<Bytes>>;

type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResponse> + Send>>;
type Handler = Arc<dyn Fn(Request<Incoming>) -> HandlerFuture + Send + Sync>;

/// Exact-path route table plus the accept loop that serves it.
#[derive(Default)]
pub struct Mux {
    routes: RwLock<HashMap<String, Handler>>,
}

impl Mux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for an exact path.
    pub fn handle<F, Fut>(&self, path: &str, handler: F)
    where
        F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResponse> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |req| Box::pin(handler(req)));
        self.routes
            .write()
            .unwrap()
            .insert(path.to_string(), handler);
    }

    /// Routes one request, containing handler panics.
    pub async fn dispatch(&self, req: Request<Incoming>) -> HandlerResponse {
        let path = req.uri().path().to_string();
        let handler = { self.routes.read().unwrap().get(&path).cloned() };

        let Some(handler) = handler else {
            return text_response(StatusCode::NOT_FOUND, "not found");
        };

        match AssertUnwindSafe(handler(req)).catch_unwind().await {
            Ok(resp) => resp,
            Err(_) => {
                tracing::error!(path = %path, "handler panicked");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
            }
        }
    }

    /// Accepts connections until the listener fails, serving each on its own
    /// task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, remote) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let mux = Arc::clone(&self);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let mux = Arc::clone(&mux);
                    async move { Ok::<_, Infallible>(mux.dispatch(req).await) }
                });

                if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                    if !e.is_incomplete_message() {
                        tracing::debug!(remote = %remote, error = %e, "connection error");
                    }
                }
            });
        }
    }
}

/// JSON body with the given status.
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> HandlerResponse {
    match serde_json::to_vec(body) {
        Ok(json) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .expect("static response parts"),
        Err(e) => text_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("encode response: {e}"),
        ),
    }
}

/// Plain-text body with the given status, used for infrastructure failures.
pub fn text_response(status: StatusCode, message: &str) -> HandlerResponse {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.to_string())))
        .expect("static response parts")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_carry_status_and_content_type() {
        let resp = json_response(StatusCode::OK, &serde_json::json!({"err": ""}));
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("Content-Type").unwrap(),
            "application/json"
        );

        let resp = text_response(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
