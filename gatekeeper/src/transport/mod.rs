//! Transport layer for the admission node.
//!
//! Currently provides HTTP transport via axum, streaming frames as Server-Sent Events.

pub mod http;

pub use http::{AppState, ChatPipeline, ChatTurn, ServerConfig, routes, serve};
