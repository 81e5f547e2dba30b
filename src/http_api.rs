//! HTTP surface of the control plane.
//!
//! A thin hyper layer over the orchestrator: execute a turn (SSE out),
//! destroy a conversation, health and pool introspection. Auth,
//! rate-limiting, and request tracing live in the fronting API gateway,
//! not here.

use anyhow::Result;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::agent::ExecuteRequest;
use crate::orchestrator::Orchestrator;
use crate::warm_pool::WarmPool;

type BoxBody = http_body_util::combinators::UnsyncBoxBody<Bytes, std::io::Error>;

fn full<T: Into<Bytes>>(chunk: T) -> BoxBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// API response envelope
#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Shared state for the HTTP server
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub pool: Arc<WarmPool>,
}

fn json_response<T: Serialize>(status: StatusCode, data: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(data).unwrap_or_else(|_| "{}".to_string());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(full(body))
        .unwrap_or_else(|_| Response::new(full("{}")))
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let response = match (method, segments.as_slice()) {
        (Method::GET, ["health"]) => json_response(StatusCode::OK, &ApiResponse::success("ok")),

        (Method::GET, ["pool"]) => {
            let stats = state.pool.stats().await;
            json_response(
                StatusCode::OK,
                &ApiResponse::success(serde_json::json!({
                    "warm": stats.warm_count,
                    "min_size": stats.min_size,
                    "target_size": stats.target_size,
                    "max_size": stats.max_size,
                    "active_sandboxes": state.orchestrator.active_sandboxes(),
                })),
            )
        }

        (Method::POST, ["conversations", id, "execute"]) => {
            let id = id.to_string();
            handle_execute(req, &id, state).await
        }

        (Method::DELETE, ["conversations", id]) => {
            let id = id.to_string();
            handle_destroy(&id, state).await
        }

        _ => json_response(
            StatusCode::NOT_FOUND,
            &ApiResponse::<()>::error("Not found"),
        ),
    };

    Ok(response)
}

async fn handle_execute(
    req: Request<Incoming>,
    conversation_id: &str,
    state: Arc<AppState>,
) -> Response<BoxBody> {
    let body_bytes = match req.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &ApiResponse::<()>::error("Failed to read body"),
            );
        }
    };
    let request: ExecuteRequest = match serde_json::from_slice(&body_bytes) {
        Ok(request) => request,
        Err(e) => {
            return json_response(
                StatusCode::BAD_REQUEST,
                &ApiResponse::<()>::error(format!("Invalid JSON: {}", e)),
            );
        }
    };

    let events = state.orchestrator.execute(conversation_id, request);
    let frames = ReceiverStream::new(events)
        .map(|event| Ok::<_, std::io::Error>(Frame::data(Bytes::from(event.to_sse_frame()))));

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .body(StreamBody::new(frames).boxed_unsync())
        .unwrap_or_else(|_| Response::new(full("")))
}

async fn handle_destroy(conversation_id: &str, state: Arc<AppState>) -> Response<BoxBody> {
    match state.orchestrator.destroy(conversation_id).await {
        Ok(()) => json_response(StatusCode::OK, &ApiResponse::success("destroyed")),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &ApiResponse::<()>::error(e.to_string()),
        ),
    }
}

/// Run the control-plane HTTP server until the shutdown signal flips.
pub async fn run_server(
    addr: SocketAddr,
    state: Arc<AppState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("workspaced listening on http://{addr}");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("http server stopping");
                    return Ok(());
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();
                        tokio::task::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                handle_request(req, state)
                            });
                            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                                debug!("error serving connection: {err:?}");
                            }
                        });
                    }
                    Err(e) => warn!("accept error: {e}"),
                }
            }
        }
    }
}
