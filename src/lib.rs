//! Axle - a single-upstream edge relay.
//!
//! Axle accepts HTTP traffic, threads a per-request identity through the
//! pipeline, observes the true outcome of every (possibly streamed)
//! response, and emits exactly one structured access-log record per
//! request. Requests are either answered by a built-in handler or
//! forwarded to one configured upstream, with protocol-upgrade requests
//! routed over a transport pinned to HTTP/1.1.
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters**
//! (implementations) and keeps request-pipeline logic inside `core`.
//! `utils` owns the server lifecycle: the serve loop races a fatal error
//! against external cancellation and drains in-flight requests within a
//! bounded grace period.
//!
//! # Error Handling
//! Per-request failures are answered in place with a content-negotiated
//! error body. Errors that affect the server as a whole (listen failure,
//! drain deadline) propagate out of [`utils::ServerLifecycle::run`] and
//! terminate the process.
//!
//! # Scope
//! Axle forwards to exactly one upstream per instance. There is no load
//! balancing, no retrying and no circuit breaking; the design optimizes
//! for correctness of observability and shutdown semantics.
pub mod config;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{AppHandler, UpstreamClient, build_router},
    core::{Forwarder, RequestId},
    ports::http_client::HttpClient,
    utils::{GracefulShutdown, ServerLifecycle},
};
