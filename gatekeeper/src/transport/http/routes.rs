//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{delete, get, post},
};
use futures::{FutureExt, Stream};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::AdmissionError;
use crate::executor::AdmittedTask;
use crate::node::AdmissionNode;
use crate::orchestrator::{AdmissionRequest, CancelOnDrop};
use crate::sink::{ChannelSink, FrameSink, StreamFrame};
use crate::ticket::RequestId;

/// Frames buffered per response stream before the producer waits.
const FRAME_BUFFER: usize = 64;

/// One admitted chat turn, as handed to the pipeline.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub request_id: RequestId,
    pub conversation_id: Option<String>,
    pub question: String,
}

/// Work that runs once a chat request holds a permit.
///
/// Frames go to `sink`. The route closes the sink once `run` returns; a caller disconnect
/// drops the future.
#[async_trait]
pub trait ChatPipeline: Send + Sync {
    async fn run(&self, turn: ChatTurn, sink: &dyn FrameSink);
}

#[derive(Clone)]
pub struct AppState {
    pub node: Arc<AdmissionNode>,
    pub pipeline: Arc<dyn ChatPipeline>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub request_id: Option<String>,
    pub conversation_id: Option<String>,
    pub question: String,
    /// Overrides the configured wait.
    pub max_wait_secs: Option<u64>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

fn frame_event(frame: &StreamFrame) -> Event {
    let name = frame.event_name();
    Event::default()
        .event(name)
        .json_data(frame)
        .unwrap_or_else(|e| {
            tracing::warn!(event = name, error = %e, "Failed to encode frame");
            Event::default().event(name)
        })
}

/// SSE body fed by the request's sink. Dropping the stream (client gone) drops the guard,
/// which withdraws the request.
fn frame_stream(
    rx: mpsc::Receiver<StreamFrame>,
    guard: CancelOnDrop,
) -> impl Stream<Item = Result<Event, Infallible>> {
    futures::stream::unfold((rx, guard), |(mut rx, mut guard)| async move {
        match rx.recv().await {
            Some(frame) => Some((Ok(frame_event(&frame)), (rx, guard))),
            None => {
                guard.disarm();
                None
            }
        }
    })
}

async fn chat(State(state): State<AppState>, Json(body): Json<ChatRequest>) -> Response {
    let request_id = body
        .request_id
        .map(RequestId::from)
        .unwrap_or_else(RequestId::generate);
    let (sink, rx) = ChannelSink::new(FRAME_BUFFER);
    let sink: Arc<dyn FrameSink> = Arc::new(sink);

    let mut request = AdmissionRequest::new(request_id.clone(), body.question.clone())
        .with_sink(Arc::clone(&sink));
    if let Some(conversation_id) = &body.conversation_id {
        request = request.with_conversation_id(conversation_id.clone());
    }
    if let Some(secs) = body.max_wait_secs {
        request = request.with_max_wait(Duration::from_secs(secs));
    }

    let turn = ChatTurn {
        request_id: request_id.clone(),
        conversation_id: body.conversation_id,
        question: body.question,
    };
    let pipeline = Arc::clone(&state.pipeline);
    let task: AdmittedTask = Box::new(move |_lease| {
        async move {
            pipeline.run(turn, sink.as_ref()).await;
            sink.close().await;
        }
        .boxed()
    });

    let handle = match state.node.admit(request, task).await {
        Ok(handle) => handle,
        Err(e @ AdmissionError::DuplicateRequest(_)) => {
            return error_response(StatusCode::CONFLICT, e.to_string());
        }
        Err(e) => {
            tracing::warn!(%request_id, error = %e, "Admission refused");
            return error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
        }
    };

    let guard = handle.cancel_on_drop();
    Sse::new(frame_stream(rx, guard))
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn cancel_chat(
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> impl IntoResponse {
    if state.node.cancel(&RequestId::from(request_id)) {
        (StatusCode::OK, Json(serde_json::json!({})))
    } else {
        (StatusCode::NOT_FOUND, Json(serde_json::json!({})))
    }
}

async fn admission_status(State(state): State<AppState>) -> Response {
    match state.node.snapshot().await {
        Ok(snapshot) => Json(snapshot).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/admission", get(admission_status))
        .route("/v1/chat", post(chat))
        .route("/v1/chat/{request_id}", delete(cancel_chat))
        .with_state(state)
}
