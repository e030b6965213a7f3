//! HTTP surface for the coordination engine.
//!
//! Every request except `GET /health` becomes a context for the topic
//! `http/{method}{path}` (method lower-cased, trailing slash dropped), e.g.
//! `GET /users/42` → `http/get/users/42`. The context is coordinated under a
//! timeout supervisor and the caller gets exactly one reply:
//!
//! | Outcome                       | Status |
//! |-------------------------------|--------|
//! | context `done`                | 200, the data bag as JSON |
//! | no handlers for the topic     | 404    |
//! | other pre-flight failure      | 500    |
//! | context `error`               | 500    |
//! | deadline passed               | 408    |
//!
//! A JSON request body is available to actions under `data.request`.
//!
//! ## Usage
//!
//! ```no_run
//! use conductor::engine::Engine;
//! use conductor::http::HttpServer;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = Arc::new(Engine::default());
//! let _dispatcher = engine.start()?;
//!
//! let mut server = HttpServer::new(engine);
//! let addr = server.start("127.0.0.1:0").await?;
//! println!("listening on {}", addr);
//!
//! server.stop();
//! # Ok(())
//! # }
//! ```

use crate::context::{Context, ContextState};
use crate::engine::Engine;
use crate::errors::CoordinationError;
use crate::timeout::{Reply, ResponseSlot};
use anyhow::{Context as _, Result};
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tower_http::trace::TraceLayer;

/// Topic for an HTTP request.
pub fn topic_for(method: &Method, path: &str) -> String {
    let path = path.trim_end_matches('/');
    format!("http/{}{}", method.as_str().to_lowercase(), path)
}

/// Build the axum router.
pub fn build_router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .fallback(coordinate_handler)
        .with_state(engine)
        .layer(TraceLayer::new_for_http())
}

/// Health check endpoint.
async fn health_handler() -> &'static str {
    "ok"
}

async fn coordinate_handler(
    State(engine): State<Arc<Engine>>,
    method: Method,
    uri: Uri,
    body: Bytes,
) -> Response {
    let ctx = engine.create_context(topic_for(&method, uri.path()));
    if let Some(request) = request_body(&body) {
        ctx.set("request", request);
    }

    let reply = coordinate(&engine, &ctx).await;
    ctx.close();

    tracing::info!(
        method = %method,
        path = %uri.path(),
        context = %ctx.id(),
        status = reply.status,
        elapsed_ms = ctx.age().as_millis() as u64,
        "request coordinated"
    );
    into_response(reply)
}

async fn coordinate(engine: &Engine, ctx: &Arc<Context>) -> Reply {
    if let Err(e) = engine.prepare(ctx) {
        return preflight_reply(&e);
    }

    let (slot, rx) = ResponseSlot::new();
    let supervisor = engine.supervise(ctx, Arc::clone(&slot));
    let result = engine.execute(ctx).await;
    drop(supervisor);

    // No-op if the supervisor already answered
    slot.finalize(match result.state {
        ContextState::Done => Reply::new(200, ctx.data_snapshot()),
        _ => Reply::new(
            500,
            json!({ "error": "Internal Server Error", "context": ctx.id() }),
        ),
    });

    recv_reply(rx).await
}

async fn recv_reply(rx: oneshot::Receiver<Reply>) -> Reply {
    rx.await
        .unwrap_or_else(|_| Reply::new(500, json!({ "error": "Internal Server Error" })))
}

fn preflight_reply(err: &CoordinationError) -> Reply {
    let status = if err.is_not_found() { 404 } else { 500 };
    if status == 500 {
        tracing::error!(error = %err, "coordination failed before execution");
    }
    Reply::new(status, json!({ "error": err.to_string() }))
}

/// A non-empty body as JSON, or as a string if it is not valid JSON.
fn request_body(body: &Bytes) -> Option<Value> {
    if body.is_empty() {
        return None;
    }
    Some(
        serde_json::from_slice(body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned())),
    )
}

fn into_response(reply: Reply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(reply.body)).into_response()
}

/// Serves the router on a TCP listener until stopped.
pub struct HttpServer {
    engine: Arc<Engine>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    addr: Option<SocketAddr>,
}

impl HttpServer {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            shutdown_tx: None,
            addr: None,
        }
    }

    /// Bind and start serving in the background.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to `bind`.
    pub async fn start(&mut self, bind: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("Failed to bind HTTP server to {}", bind))?;
        let addr = listener
            .local_addr()
            .context("Failed to get server address")?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);
        self.addr = Some(addr);

        let app = build_router(Arc::clone(&self.engine));
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
            {
                tracing::error!(error = %e, "HTTP server error");
            }
        });

        tracing::info!(addr = %addr, "HTTP server listening");
        Ok(addr)
    }

    /// Stop accepting requests; in-flight requests finish.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.addr = None;
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }
}
