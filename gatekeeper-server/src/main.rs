//! gatekeeper-server: HTTP front end for the admission queue.
//!
//! Runs a single node over an in-process store, with an echo pipeline standing in for the
//! real chat backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gatekeeper::transport::{AppState, ChatPipeline, ChatTurn, ServerConfig, serve};
use gatekeeper::{
    AdmissionConfig, AdmissionNode, ConfigHandle, FrameSink, MemoryRejectionLog, MemoryStore,
    SpawnExecutor, StreamFrame,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Pause between echoed words, so streaming is visible.
const ECHO_DELAY: Duration = Duration::from_millis(50);

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("GATEKEEPER_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!(
            "gatekeeper={level},gatekeeper_server={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Streams the question back one word at a time.
struct EchoPipeline;

#[async_trait]
impl ChatPipeline for EchoPipeline {
    async fn run(&self, turn: ChatTurn, sink: &dyn FrameSink) {
        tracing::debug!(request_id = %turn.request_id, "Echo pipeline started");
        for word in turn.question.split_whitespace() {
            if sink
                .send(StreamFrame::Message {
                    text: format!("{word} "),
                })
                .await
                .is_err()
            {
                return;
            }
            tokio::time::sleep(ECHO_DELAY).await;
        }
        let _ = sink.send(StreamFrame::Done).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ConfigHandle::new(AdmissionConfig::default());
    let node = AdmissionNode::builder(Arc::new(MemoryStore::new()))
        .with_config(config)
        .with_executor(Arc::new(SpawnExecutor::new()))
        .with_recorder(Arc::new(MemoryRejectionLog::new()))
        .start();

    let state = AppState {
        node,
        pipeline: Arc::new(EchoPipeline),
    };
    serve(ServerConfig::default(), state).await
}
