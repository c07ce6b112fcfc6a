//! Reverse-proxy data plane for mesh services
//!
//! A ProxyHandler is linked to at most one backend at a time. Forwarding
//! while unlinked, or failing to reach the backend, yields a 503 instead of
//! an error. Bodies are streamed in both directions.

pub mod client;
pub mod error;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod trace_context;

pub use client::ProxyClient;
pub use error::{ProxyError, Result};
pub use handler::{Forward, Link, LinkEvent, ProxyHandler};
pub use http::{BoxError, ProxyBody};
pub use metrics::ProxyMetrics;
pub use trace_context::HopTracer;
