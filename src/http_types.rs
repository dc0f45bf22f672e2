//! Request/response types shared between the HTTP layer, the worker
//! contract, and the streaming primitives.
//!
//! Workers receive a fully-buffered request (the dev server reads bodies up
//! front) and return a response whose body is either bytes or a stream —
//! the latter is what `HTMLRewriter` and the transform streams produce.

use bytes::Bytes;
use futures_util::StreamExt;
use http::{HeaderMap, Method, StatusCode, Uri};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

// ─── Request ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl WorkerRequest {
    pub fn get(uri: &str) -> Self {
        Self {
            method: Method::GET,
            uri: uri.parse().expect("valid test uri"),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Full request URL as a string.
    pub fn url(&self) -> String {
        self.uri.to_string()
    }

    /// Path portion of the URL.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// First value of a header, lossily decoded.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).to_string())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

// ─── Body ─────────────────────────────────────────────────────────────────────

/// Response body: fully-buffered bytes or a chunk stream.
pub enum Body {
    Empty,
    Bytes(Bytes),
    Stream(ReceiverStream<anyhow::Result<Bytes>>),
}

impl Body {
    pub fn empty() -> Self {
        Body::Empty
    }

    pub fn from_bytes(b: impl Into<Bytes>) -> Self {
        Body::Bytes(b.into())
    }

    /// A channel-backed streaming body. The writer half feeds chunks; the
    /// body yields them in order.
    pub fn channel(capacity: usize) -> (mpsc::Sender<anyhow::Result<Bytes>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Body::Stream(ReceiverStream::new(rx)))
    }

    /// Collect the whole body into memory. Streaming bodies are drained.
    pub async fn into_bytes(self) -> anyhow::Result<Bytes> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Bytes(b) => Ok(b),
            Body::Stream(mut s) => {
                let mut out = Vec::new();
                while let Some(chunk) = s.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Body::Empty => write!(f, "Body::Empty"),
            Body::Bytes(b) => write!(f, "Body::Bytes({} bytes)", b.len()),
            Body::Stream(_) => write!(f, "Body::Stream"),
        }
    }
}

// ─── Response ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct WorkerResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl WorkerResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::Empty,
        }
    }

    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Body::from_bytes(body),
        }
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        let mut resp = Self::new(status);
        resp.set_header("content-type", "text/plain; charset=utf-8");
        resp.body = Body::from_bytes(body.into().into_bytes());
        resp
    }

    pub fn json<T: serde::Serialize>(value: &T) -> anyhow::Result<Self> {
        let mut resp = Self::new(StatusCode::OK);
        resp.set_header("content-type", "application/json");
        resp.body = Body::from_bytes(serde_json::to_vec(value)?);
        Ok(resp)
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::from_bytes(name.as_bytes()),
            http::header::HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .map(|v| String::from_utf8_lossy(v.as_bytes()).to_string())
    }

    /// Buffer the body in place and return the bytes.
    pub async fn bytes(self) -> anyhow::Result<Bytes> {
        self.body.into_bytes().await
    }
}
