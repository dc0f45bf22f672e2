//! Tracing hooks: span start/end around binding calls and error persistence.
//!
//! The emulator core never talks to a trace store directly — everything goes
//! through `TraceSink`, and a sink failure must never fail the traced
//! operation. The default sink logs through `tracing`.

use std::sync::Arc;
use std::time::Instant;

use uuid::Uuid;

/// Outgoing request/response bodies attached to client spans are capped at
/// this many bytes; binary payloads are summarized instead.
pub const BODY_CAPTURE_CAP: usize = 128 * 1024;

// ─── Span records ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SpanStart {
    pub span_id: String,
    /// Binding type, e.g. `"kv"`, `"r2"`, `"queue"`.
    pub binding: String,
    /// Slot name the worker sees, e.g. `"MY_KV"`.
    pub slot: String,
    /// Method invoked on the handle, e.g. `"get"`.
    pub method: String,
    /// The key argument when the first argument was a string.
    pub key: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SpanEnd {
    pub span_id: String,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub name: String,
    pub message: String,
    pub method: String,
    pub url: String,
}

// ─── Sink ─────────────────────────────────────────────────────────────────────

/// External trace store interface. Implementations must be infallible from
/// the caller's perspective — swallow their own errors.
pub trait TraceSink: Send + Sync {
    fn span_start(&self, span: &SpanStart);
    fn span_end(&self, span: &SpanEnd);
    fn persist_error(&self, err: &ErrorRecord);
}

/// Default sink: structured log lines only.
pub struct LogSink;

impl TraceSink for LogSink {
    fn span_start(&self, span: &SpanStart) {
        tracing::trace!(
            binding = %span.binding,
            slot = %span.slot,
            method = %span.method,
            key = span.key.as_deref().unwrap_or(""),
            "span start"
        );
    }

    fn span_end(&self, span: &SpanEnd) {
        tracing::trace!(span = %span.span_id, ms = span.elapsed_ms, err = span.error.as_deref().unwrap_or(""), "span end");
    }

    fn persist_error(&self, err: &ErrorRecord) {
        tracing::error!(name = %err.name, method = %err.method, url = %err.url, "{}", err.message);
    }
}

// ─── Per-binding tracer ───────────────────────────────────────────────────────

/// Carried by every binding handle; records one span per method call.
#[derive(Clone)]
pub struct BindingTracer {
    sink: Arc<dyn TraceSink>,
    binding: &'static str,
    slot: String,
}

impl BindingTracer {
    pub fn new(sink: Arc<dyn TraceSink>, binding: &'static str, slot: impl Into<String>) -> Self {
        Self {
            sink,
            binding,
            slot: slot.into(),
        }
    }

    /// Tracer for internal callers that don't care about span output.
    pub fn disabled(binding: &'static str) -> Self {
        Self {
            sink: Arc::new(LogSink),
            binding,
            slot: String::new(),
        }
    }

    /// Start a span for `method`. The returned guard ends the span when
    /// dropped; call [`Span::fail`] first to record an error outcome.
    pub fn span(&self, method: &str, key: Option<&str>) -> Span {
        let span_id = Uuid::new_v4().to_string();
        self.sink.span_start(&SpanStart {
            span_id: span_id.clone(),
            binding: self.binding.to_string(),
            slot: self.slot.clone(),
            method: method.to_string(),
            key: key.map(|k| k.to_string()),
        });
        Span {
            sink: Arc::clone(&self.sink),
            span_id,
            started: Instant::now(),
            error: None,
        }
    }
}

pub struct Span {
    sink: Arc<dyn TraceSink>,
    span_id: String,
    started: Instant,
    error: Option<String>,
}

impl Span {
    pub fn fail(&mut self, err: &dyn std::fmt::Display) {
        self.error = Some(err.to_string());
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.sink.span_end(&SpanEnd {
            span_id: std::mem::take(&mut self.span_id),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            error: self.error.take(),
        });
    }
}

/// Truncate a captured body for span attachment. Binary content (lossy
/// decode produces replacement characters) is summarized rather than stored.
pub fn capture_body(bytes: &[u8], content_type: Option<&str>) -> String {
    let binary = content_type
        .map(|ct| {
            !(ct.starts_with("text/")
                || ct.contains("json")
                || ct.contains("xml")
                || ct.contains("urlencoded"))
        })
        .unwrap_or_else(|| std::str::from_utf8(bytes).is_err());
    if binary {
        return format!("<{} bytes of binary data>", bytes.len());
    }
    let capped = &bytes[..bytes.len().min(BODY_CAPTURE_CAP)];
    String::from_utf8_lossy(capped).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        starts: Mutex<Vec<SpanStart>>,
        ends: Mutex<Vec<SpanEnd>>,
    }

    impl TraceSink for RecordingSink {
        fn span_start(&self, span: &SpanStart) {
            self.starts.lock().unwrap().push(span.clone());
        }
        fn span_end(&self, span: &SpanEnd) {
            self.ends.lock().unwrap().push(span.clone());
        }
        fn persist_error(&self, _err: &ErrorRecord) {}
    }

    #[test]
    fn span_guard_records_start_and_end() {
        let sink = Arc::new(RecordingSink::default());
        let tracer = BindingTracer::new(sink.clone(), "kv", "MY_KV");
        {
            let mut span = tracer.span("get", Some("user:1"));
            span.fail(&"not found");
        }
        let starts = sink.starts.lock().unwrap();
        let ends = sink.ends.lock().unwrap();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].key.as_deref(), Some("user:1"));
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].error.as_deref(), Some("not found"));
    }

    #[test]
    fn binary_bodies_are_summarized() {
        let captured = capture_body(&[0u8, 159, 146, 150], None);
        assert!(captured.contains("binary"));
        let text = capture_body(b"hello", Some("text/plain"));
        assert_eq!(text, "hello");
    }
}
