//! # Crossbar Gateway
//!
//! OpenAI-compatible HTTP surface over the `crossbar-adapters` engine:
//! `/v1/chat/completions` (streaming and non-streaming),
//! `/v1/embeddings`, `/v1/models`, plus liveness, readiness and
//! Prometheus metrics.
//!
//! This crate owns authentication and quotas, the pre-auth IP shield,
//! the SSE pipeline, usage recording, the error envelope, and the
//! programmatic admin API the management surface calls into.

pub mod admin;
pub mod auth;
pub mod config;
pub mod gateway_error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod request_context;
pub mod server;
pub mod shield;
pub mod store;
pub mod streaming;
pub mod usage;

pub use config::Config;
pub use gateway_error::ApiError;
pub use server::{create_app, create_server, AppState};
