//! WebSocket hibernation registry for Durable Object instances.
//!
//! Sockets are transport-agnostic handles: incoming frames are delivered by
//! the embedder through the namespace, outgoing frames drain from a channel
//! the embedder owns. Tags and the auto-response pair live here so they
//! survive between handler invocations, which is the point of hibernation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsOutgoing {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

struct SocketInner {
    id: u64,
    tags: StdMutex<Vec<String>>,
    outgoing: mpsc::UnboundedSender<WsOutgoing>,
    /// When the auto-response pair last answered on this socket (epoch ms).
    auto_response_at: StdMutex<Option<i64>>,
}

/// A server-side socket accepted into an instance.
#[derive(Clone)]
pub struct WebSocketHandle {
    inner: Arc<SocketInner>,
}

impl WebSocketHandle {
    /// Create a handle plus the receiver the transport drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<WsOutgoing>) {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(SocketInner {
                    id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                    tags: StdMutex::new(Vec::new()),
                    outgoing: tx,
                    auto_response_at: StdMutex::new(None),
                }),
            },
            rx,
        )
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn tags(&self) -> Vec<String> {
        self.inner.tags.lock().expect("tags lock").clone()
    }

    pub fn send_text(&self, text: &str) {
        let _ = self.inner.outgoing.send(WsOutgoing::Text(text.to_string()));
    }

    pub fn send_binary(&self, data: Vec<u8>) {
        let _ = self.inner.outgoing.send(WsOutgoing::Binary(data));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.inner.outgoing.send(WsOutgoing::Close {
            code,
            reason: reason.to_string(),
        });
    }

    /// Timestamp of the last auto-response on this socket, if any.
    pub fn auto_response_timestamp(&self) -> Option<i64> {
        *self.inner.auto_response_at.lock().expect("stamp lock")
    }

    pub(crate) fn stamp_auto_response(&self, at_ms: i64) {
        *self.inner.auto_response_at.lock().expect("stamp lock") = Some(at_ms);
    }

    fn set_tags(&self, tags: Vec<String>) {
        *self.inner.tags.lock().expect("tags lock") = tags;
    }
}

impl PartialEq for WebSocketHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

/// Per-instance socket set.
#[derive(Default)]
pub struct WebSocketRegistry {
    sockets: StdMutex<Vec<WebSocketHandle>>,
    auto_response: StdMutex<Option<(String, String)>>,
}

impl WebSocketRegistry {
    pub fn accept(&self, ws: WebSocketHandle, tags: Vec<String>) {
        ws.set_tags(tags);
        self.sockets.lock().expect("sockets lock").push(ws);
    }

    /// Accepted sockets, optionally filtered by tag.
    pub fn get(&self, tag: Option<&str>) -> Vec<WebSocketHandle> {
        let sockets = self.sockets.lock().expect("sockets lock");
        match tag {
            None => sockets.clone(),
            Some(tag) => sockets
                .iter()
                .filter(|ws| ws.tags().iter().any(|t| t == tag))
                .cloned()
                .collect(),
        }
    }

    pub fn remove(&self, ws: &WebSocketHandle) {
        self.sockets
            .lock()
            .expect("sockets lock")
            .retain(|other| other != ws);
    }

    pub fn set_auto_response(&self, pair: Option<(String, String)>) {
        *self.auto_response.lock().expect("auto lock") = pair;
    }

    pub fn auto_response(&self) -> Option<(String, String)> {
        self.auto_response.lock().expect("auto lock").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_filter_accepted_sockets() {
        let registry = WebSocketRegistry::default();
        let (a, _rx_a) = WebSocketHandle::channel();
        let (b, _rx_b) = WebSocketHandle::channel();
        registry.accept(a.clone(), vec!["room:1".into(), "user:7".into()]);
        registry.accept(b.clone(), vec!["room:2".into()]);

        assert_eq!(registry.get(None).len(), 2);
        let room1 = registry.get(Some("room:1"));
        assert_eq!(room1.len(), 1);
        assert_eq!(room1[0].id(), a.id());

        registry.remove(&a);
        assert_eq!(registry.get(None).len(), 1);
    }

    #[tokio::test]
    async fn outgoing_frames_drain_in_order() {
        let (ws, mut rx) = WebSocketHandle::channel();
        ws.send_text("one");
        ws.send_binary(vec![1, 2]);
        ws.close(1000, "done");
        assert_eq!(rx.recv().await, Some(WsOutgoing::Text("one".into())));
        assert_eq!(rx.recv().await, Some(WsOutgoing::Binary(vec![1, 2])));
        assert_eq!(
            rx.recv().await,
            Some(WsOutgoing::Close {
                code: 1000,
                reason: "done".into()
            })
        );
    }
}
