//! Streaming transport seam.
//!
//! The admission core only needs to push frames and close the stream. Wire formats live in
//! the transport (see `transport::http` for the SSE encoding).

use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;

/// A frame pushed to the caller's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    /// The request is waiting for capacity.
    Queued { position: usize },
    Metadata {
        conversation_id: String,
        task_id: String,
    },
    Rejection { text: String },
    Message { text: String },
    Title { title: String },
    Done,
}

impl StreamFrame {
    /// SSE event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Metadata { .. } => "metadata",
            Self::Rejection { .. } => "rejection",
            Self::Message { .. } => "message",
            Self::Title { .. } => "title",
            Self::Done => "done",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("stream closed")]
    Closed,
}

#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: StreamFrame) -> Result<(), SinkError>;

    /// Close the stream. Idempotent.
    async fn close(&self);
}

/// Sink over a bounded mpsc channel. Closing drops the sender, ending the receiver's stream.
pub struct ChannelSink {
    tx: StdMutex<Option<mpsc::Sender<StreamFrame>>>,
}

impl ChannelSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<StreamFrame>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx: StdMutex::new(Some(tx)),
            },
            rx,
        )
    }

    fn sender(&self) -> Option<mpsc::Sender<StreamFrame>> {
        self.tx.lock().ok().and_then(|guard| guard.clone())
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&self, frame: StreamFrame) -> Result<(), SinkError> {
        let tx = self.sender().ok_or(SinkError::Closed)?;
        tx.send(frame).await.map_err(|_| SinkError::Closed)
    }

    async fn close(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }
    }
}

/// Sink that discards everything, for callers without a stream.
pub struct NullSink;

#[async_trait]
impl FrameSink for NullSink {
    async fn send(&self, _frame: StreamFrame) -> Result<(), SinkError> {
        Ok(())
    }

    async fn close(&self) {}
}
