//! # Crossbar Adapters
//!
//! The request-processing engine behind the Crossbar gateway. This crate
//! owns everything between a validated inbound request and a normalized
//! OpenAI-shaped response:
//!
//! - **Adapters**: four upstream strategies (sandboxed CLI commands,
//!   HTTP SDK endpoints, OpenAI-compatible proxies, local inference
//!   servers) behind one trait.
//! - **Registry and resolution**: copy-on-write provider table, model id
//!   resolution ordered by breaker state, priority, error rate and load.
//! - **Circuit breaker and dispatch**: per-provider breakers, retry with
//!   jittered backoff, fallback across candidates under one request id.
//! - **Pooling and queueing**: per-provider HTTP clients and bounded
//!   priority admission.
//! - **Sandbox**: single-use containers for CLI execution with stdin-only
//!   payload delivery.
//! - **Normalizer**: coercion of heterogeneous upstream shapes into the
//!   OpenAI envelope.
//!
//! The HTTP surface, authentication, rate limiting and usage accounting
//! live in the `crossbar-gateway` crate on top of this one.

pub mod adapters;
pub mod breaker;
pub mod cache;
pub mod common;
pub mod dispatch;
pub mod error;
pub mod models;
pub mod normalize;
pub mod pool;
pub mod provider;
pub mod registry;
pub mod sandbox;
pub mod secrets;

pub use adapters::{Adapter, CallContext, ChunkStream};
pub use breaker::{BreakerConfig, BreakerState, BreakerTable};
pub use dispatch::{DispatchError, DispatchMeta, Dispatcher, RetryPolicy};
pub use error::AdapterError;
pub use provider::{ModelMapping, ProviderKind, ProviderRecord, VariantConfig};
pub use registry::ProviderRegistry;
