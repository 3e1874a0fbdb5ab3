//! Per-process output buffers shared by the client implementations.
//!
//! Every (container, process, stream) has its own ordered queue, so a slow
//! reader of one process never holds up another. Frames are admitted by a
//! connection-wide sequence number; a frame at or below the high-water mark
//! is a replay and is dropped.

use crate::api::StreamKind;
use crate::error::{HyperstartError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct StreamKey {
    pub container: String,
    pub process: String,
    pub kind: StreamKind,
}

impl StreamKey {
    pub fn new(container: &str, process: &str, kind: StreamKind) -> Self {
        Self {
            container: container.to_string(),
            process: process.to_string(),
            kind,
        }
    }
}

struct Stream {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: tokio::sync::Mutex<Reader>,
    eof: AtomicBool,
}

struct Reader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: Bytes,
}

impl Stream {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(Reader {
                rx,
                pending: Bytes::new(),
            }),
            eof: AtomicBool::new(false),
        }
    }

    fn finish(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }
}

#[derive(Default)]
struct Table {
    streams: HashMap<StreamKey, Arc<Stream>>,
    last_seq: u64,
    closed: Option<String>,
}

/// Output streams of every process reachable through one channel.
#[derive(Default)]
pub(crate) struct StreamTable {
    inner: Mutex<Table>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart sequencing above `seq` after a reconnect.
    pub fn with_last_seq(seq: u64) -> Self {
        let table = Self::new();
        if let Ok(mut inner) = table.inner.lock() {
            inner.last_seq = seq;
        }
        table
    }

    fn stream(&self, key: &StreamKey) -> Result<Arc<Stream>> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| HyperstartError::Transport("stream table poisoned".into()))?;
        let closed = inner.closed.is_some();
        let stream = inner
            .streams
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Stream::new()))
            .clone();
        // A stream first seen after the channel went away has no writer
        if closed {
            stream.finish();
        }
        Ok(stream)
    }

    /// Admit a frame. Returns false if it was a replay and got dropped.
    pub fn push(&self, key: StreamKey, seq: u64, data: Bytes, eof: bool) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if seq <= inner.last_seq {
            tracing::trace!(seq, last_seq = inner.last_seq, "Dropping replayed stream frame");
            return false;
        }
        inner.last_seq = seq;

        let stream = inner
            .streams
            .entry(key)
            .or_insert_with(|| Arc::new(Stream::new()))
            .clone();
        drop(inner);

        if !data.is_empty() {
            if let Ok(tx) = stream.tx.lock() {
                if let Some(tx) = tx.as_ref() {
                    let _ = tx.send(data);
                }
            }
        }
        if eof {
            stream.eof.store(true, Ordering::Release);
            stream.finish();
        }
        true
    }

    /// Read into `buf`, waiting for data. Returns 0 at end of stream.
    pub async fn read(&self, key: &StreamKey, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let stream = self.stream(key)?;
        let mut reader = stream.rx.lock().await;

        if reader.pending.is_empty() {
            match reader.rx.recv().await {
                Some(chunk) => reader.pending = chunk,
                None => {
                    if stream.eof.load(Ordering::Acquire) {
                        return Ok(0);
                    }
                    let reason = self.closed_reason().unwrap_or_else(|| "stream closed".into());
                    return Err(HyperstartError::Transport(reason));
                }
            }
        }

        let n = buf.len().min(reader.pending.len());
        let chunk = reader.pending.split_to(n);
        buf[..n].copy_from_slice(&chunk);
        Ok(n)
    }

    /// Highest admitted sequence number.
    pub fn last_seq(&self) -> u64 {
        self.inner.lock().map(|inner| inner.last_seq).unwrap_or(0)
    }

    /// End every stream because the channel is gone.
    ///
    /// Buffered data stays readable; readers see a transport error after it,
    /// except on streams the guest already finished.
    pub fn close_all(&self, reason: &str) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.closed = Some(reason.to_string());
        for stream in inner.streams.values() {
            stream.finish();
        }
    }

    fn closed_reason(&self) -> Option<String> {
        self.inner.lock().ok().and_then(|inner| inner.closed.clone())
    }
}
