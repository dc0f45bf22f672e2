//! Local HTTP surface: the manual scheduled trigger and the queue pull
//! API, with everything else forwarded to the active generation's `fetch`.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Query, State},
    response::Response,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::bindings::queue::{ack_messages, pull_messages};
use crate::http_types::{Body, WorkerRequest, WorkerResponse};
use crate::storage::now_ms;
use crate::Emulator;

/// Request bodies larger than this are rejected at the door.
const MAX_BODY_BYTES: usize = 100 * 1024 * 1024;

pub async fn start_server(emulator: Emulator, host: &str, port: u16) -> Result<()> {
    let addr = format!("{host}:{port}");
    let router = build_router(emulator);
    info!("bunflare listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(emulator: Emulator) -> Router {
    Router::new()
        .route("/__scheduled", get(trigger_scheduled))
        .route("/__queues/{name}/messages/pull", post(queue_pull))
        .route("/__queues/{name}/messages/ack", post(queue_ack))
        .fallback(dispatch_fetch)
        .with_state(Arc::new(emulator))
}

// ─── /__scheduled ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ScheduledQuery {
    cron: Option<String>,
}

async fn trigger_scheduled(
    State(emulator): State<Arc<Emulator>>,
    Query(query): Query<ScheduledQuery>,
) -> Response {
    let generation = match emulator.generations.active() {
        Ok(generation) => generation,
        Err(e) => return plain(http::StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    if !generation.has_scheduled_handler() {
        return plain(
            http::StatusCode::NOT_FOUND,
            "worker does not export a scheduled handler",
        );
    }
    let cron = query.cron.unwrap_or_else(|| "* * * * *".to_string());
    match generation.scheduled(&cron, now_ms()).await {
        Ok(()) => plain(
            http::StatusCode::OK,
            &format!("Ran scheduled event for cron \"{cron}\""),
        ),
        Err(e) => plain(http::StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

// ─── /__queues ────────────────────────────────────────────────────────────────

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    #[serde(default)]
    batch_size: Option<i64>,
    #[serde(default)]
    visibility_timeout_ms: Option<i64>,
}

async fn queue_pull(
    State(emulator): State<Arc<Emulator>>,
    axum::extract::Path(name): axum::extract::Path<String>,
    body: axum::body::Bytes,
) -> Response {
    let request: PullRequest = serde_json::from_slice(&body).unwrap_or_default();
    let result = pull_messages(
        &emulator.storage.pool(),
        &name,
        request.batch_size.unwrap_or(10),
        request.visibility_timeout_ms.unwrap_or(30_000),
    )
    .await;
    match result {
        Ok(messages) => json_response(http::StatusCode::OK, &json!({ "messages": messages })),
        Err(e) => plain(http::StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[derive(Deserialize, Default)]
struct AckRequest {
    #[serde(default)]
    acks: Vec<String>,
    #[serde(default)]
    retries: Vec<AckRetry>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AckRetry {
    lease_id: String,
    #[serde(default)]
    delay_seconds: Option<i64>,
}

async fn queue_ack(
    State(emulator): State<Arc<Emulator>>,
    axum::extract::Path(name): axum::extract::Path<String>,
    body: axum::body::Bytes,
) -> Response {
    let request: AckRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return plain(http::StatusCode::BAD_REQUEST, &format!("invalid body: {e}")),
    };
    let retries: Vec<(String, Option<i64>)> = request
        .retries
        .into_iter()
        .map(|r| (r.lease_id, r.delay_seconds))
        .collect();
    match ack_messages(&emulator.storage.pool(), &name, &request.acks, &retries).await {
        Ok(()) => json_response(http::StatusCode::OK, &json!({ "ackCount": request.acks.len() })),
        Err(e) => plain(http::StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

// ─── Worker dispatch fallback ─────────────────────────────────────────────────

async fn dispatch_fetch(
    State(emulator): State<Arc<Emulator>>,
    request: axum::extract::Request,
) -> Response {
    let generation = match emulator.generations.active() {
        Ok(generation) => generation,
        Err(e) => return plain(http::StatusCode::SERVICE_UNAVAILABLE, &e.to_string()),
    };
    let worker_request = match into_worker_request(request).await {
        Ok(request) => request,
        Err(e) => return plain(http::StatusCode::BAD_REQUEST, &e.to_string()),
    };
    let response = generation.fetch(worker_request).await;
    into_axum_response(response)
}

/// Buffer the incoming body and rebuild an absolute request URL for the
/// worker.
async fn into_worker_request(request: axum::extract::Request) -> Result<WorkerRequest> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES).await?;
    let uri = if parts.uri.scheme().is_some() {
        parts.uri.clone()
    } else {
        let host = parts
            .headers
            .get(http::header::HOST)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("localhost");
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        format!("http://{host}{path_and_query}").parse()?
    };
    Ok(WorkerRequest {
        method: parts.method,
        uri,
        headers: parts.headers,
        body: bytes,
    })
}

fn into_axum_response(response: WorkerResponse) -> Response {
    let mut builder = http::Response::builder().status(response.status);
    if let Some(headers) = builder.headers_mut() {
        *headers = response.headers;
    }
    let body = match response.body {
        Body::Empty => axum::body::Body::empty(),
        Body::Bytes(bytes) => axum::body::Body::from(bytes),
        Body::Stream(stream) => axum::body::Body::from_stream(stream),
    };
    builder
        .body(body)
        .unwrap_or_else(|_| Response::new(axum::body::Body::empty()))
}

fn plain(status: http::StatusCode, message: &str) -> Response {
    into_axum_response(WorkerResponse::text(status, message))
}

fn json_response(status: http::StatusCode, value: &serde_json::Value) -> Response {
    let mut response = WorkerResponse::new(status);
    response.set_header("content-type", "application/json");
    response.body = Body::from_bytes(serde_json::to_vec(value).unwrap_or_default());
    into_axum_response(response)
}
