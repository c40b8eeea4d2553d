//! HTTP transport: chat admission over SSE plus an admission status endpoint.

mod routes;
mod server;

pub use routes::{AppState, ChatPipeline, ChatRequest, ChatTurn, routes};
pub use server::{ServerConfig, serve};
