//! Transform stream primitives: identity passthrough and fixed-length
//! enforcement over channel-backed byte streams.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Byte passthrough: whatever is written to the writable side comes out of
/// the readable side unchanged.
pub struct IdentityTransformStream {
    pub writable: StreamWriter,
    pub readable: ReceiverStream<Result<Bytes>>,
}

impl IdentityTransformStream {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            writable: StreamWriter { tx, written: 0 },
            readable: ReceiverStream::new(rx),
        }
    }
}

impl Default for IdentityTransformStream {
    fn default() -> Self {
        Self::new()
    }
}

pub struct StreamWriter {
    tx: mpsc::Sender<Result<Bytes>>,
    written: u64,
}

impl StreamWriter {
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        let chunk = chunk.into();
        self.written += chunk.len() as u64;
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| anyhow!("stream reader dropped"))
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Close the writable side; the readable side then ends.
    pub fn close(self) {}
}

/// A passthrough that enforces an exact byte count: writing past `length`
/// errors immediately, and closing short surfaces an error to the reader.
pub struct FixedLengthStream {
    pub writable: FixedLengthWriter,
    pub readable: ReceiverStream<Result<Bytes>>,
}

impl FixedLengthStream {
    pub fn new(length: u64) -> Self {
        let (tx, rx) = mpsc::channel(16);
        Self {
            writable: FixedLengthWriter {
                tx,
                length,
                written: 0,
            },
            readable: ReceiverStream::new(rx),
        }
    }
}

pub struct FixedLengthWriter {
    tx: mpsc::Sender<Result<Bytes>>,
    length: u64,
    written: u64,
}

impl FixedLengthWriter {
    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<()> {
        let chunk = chunk.into();
        if self.written + chunk.len() as u64 > self.length {
            let err = anyhow!(
                "FixedLengthStream: wrote {} bytes past the declared length {}",
                self.written + chunk.len() as u64 - self.length,
                self.length
            );
            let _ = self
                .tx
                .send(Err(anyhow!("stream exceeded its fixed length")))
                .await;
            return Err(err);
        }
        self.written += chunk.len() as u64;
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| anyhow!("stream reader dropped"))
    }

    /// Close the writable side. Closing with fewer bytes than declared is an
    /// error on both sides.
    pub async fn close(self) -> Result<()> {
        if self.written < self.length {
            let _ = self
                .tx
                .send(Err(anyhow!(
                    "FixedLengthStream closed after {} of {} bytes",
                    self.written,
                    self.length
                )))
                .await;
            return Err(anyhow!(
                "FixedLengthStream closed after {} of {} bytes",
                self.written,
                self.length
            ));
        }
        Ok(())
    }
}
