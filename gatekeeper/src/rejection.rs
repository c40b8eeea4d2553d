//! Rejection hand-off for tickets whose wait deadline passed.
//!
//! The recorder persists the rejected request and returns the ids the caller's stream needs.
//! The stream then receives a fixed wind-down: metadata, rejection text, the same text as a
//! message, an optional title and a terminal done frame.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::sink::{FrameSink, StreamFrame};
use crate::ticket::RequestId;

const TITLE_MAX_CHARS: usize = 32;

#[derive(Debug, Clone, Serialize)]
pub struct RejectedRequest {
    pub request_id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub question: String,
    pub rejected_at: DateTime<Utc>,
}

impl RejectedRequest {
    pub fn new(request_id: RequestId, conversation_id: Option<String>, question: String) -> Self {
        Self {
            request_id,
            conversation_id,
            question,
            rejected_at: Utc::now(),
        }
    }
}

/// What the recorder hands back to drive the notification frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectionRecord {
    pub conversation_id: String,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl RejectionRecord {
    /// Ids derived from the request alone, used when the recorder fails.
    pub fn fallback(request: &RejectedRequest) -> Self {
        Self {
            conversation_id: request
                .conversation_id
                .clone()
                .unwrap_or_else(|| request.request_id.to_string()),
            task_id: request.request_id.to_string(),
            title: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("failed to record rejected request: {0}")]
    Failed(String),
}

#[async_trait]
pub trait RejectionRecorder: Send + Sync {
    async fn record(&self, request: RejectedRequest) -> Result<RejectionRecord, RecorderError>;
}

/// Title for a new conversation: the question's first line, truncated.
pub fn derive_title(question: &str) -> Option<String> {
    let line = question.lines().map(str::trim).find(|l| !l.is_empty())?;
    let mut title: String = line.chars().take(TITLE_MAX_CHARS).collect();
    if line.chars().count() > TITLE_MAX_CHARS {
        title.push('…');
    }
    Some(title)
}

/// In-memory recorder keyed by task id.
#[derive(Default)]
pub struct MemoryRejectionLog {
    entries: DashMap<String, RejectedRequest>,
}

impl MemoryRejectionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, task_id: &str) -> Option<RejectedRequest> {
        self.entries.get(task_id).map(|e| e.clone())
    }
}

#[async_trait]
impl RejectionRecorder for MemoryRejectionLog {
    async fn record(&self, request: RejectedRequest) -> Result<RejectionRecord, RecorderError> {
        let task_id = uuid::Uuid::new_v4().to_string();
        // Only a brand-new conversation gets a title.
        let (conversation_id, title) = match request.conversation_id.clone() {
            Some(id) => (id, None),
            None => (
                uuid::Uuid::new_v4().to_string(),
                derive_title(&request.question),
            ),
        };
        self.entries.insert(task_id.clone(), request);
        Ok(RejectionRecord {
            conversation_id,
            task_id,
            title,
        })
    }
}

/// Record the rejection and stream the wind-down frames, then close the sink.
///
/// Never fails: a recorder error falls back to request-derived ids, and a sink error stops
/// the sequence early (the caller is gone).
pub async fn notify_rejection(
    recorder: &dyn RejectionRecorder,
    sink: &dyn FrameSink,
    request: RejectedRequest,
    text: &str,
) -> RejectionRecord {
    let request_id = request.request_id.clone();
    let fallback = RejectionRecord::fallback(&request);
    let record = match recorder.record(request).await {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(%request_id, error = %e, "Rejection recorder failed, using fallback ids");
            fallback
        }
    };

    let mut frames = vec![
        StreamFrame::Metadata {
            conversation_id: record.conversation_id.clone(),
            task_id: record.task_id.clone(),
        },
        StreamFrame::Rejection {
            text: text.to_string(),
        },
        StreamFrame::Message {
            text: text.to_string(),
        },
    ];
    if let Some(title) = &record.title {
        frames.push(StreamFrame::Title {
            title: title.clone(),
        });
    }
    frames.push(StreamFrame::Done);

    for frame in frames {
        if let Err(e) = sink.send(frame).await {
            tracing::debug!(%request_id, error = %e, "Caller stream gone during rejection");
            break;
        }
    }
    sink.close().await;
    record
}
