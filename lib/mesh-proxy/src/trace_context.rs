//! W3C trace context propagation across proxy hops

use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

/// W3C Trace Context header
pub const TRACEPARENT: &str = "traceparent";

/// Header naming the mesh hop that forwarded the request
pub const MESH_HOP: &str = "x-mesh-hop";

/// Stamps forwarded requests with trace context for one hop
#[derive(Clone, Debug)]
pub struct HopTracer {
    hop: String,
}

impl HopTracer {
    pub fn new(hop: impl Into<String>) -> Self {
        Self { hop: hop.into() }
    }

    pub fn hop(&self) -> &str {
        &self.hop
    }

    /// Continue the inbound trace (or start one) with a fresh span for this hop
    ///
    /// Returns the trace id written to the headers.
    pub fn apply(&self, headers: &mut HeaderMap) -> String {
        let (trace_id, flags) = match Self::extract_w3c_trace_context(headers) {
            Some((trace_id, _parent_span, flags)) => (trace_id, flags),
            None => (Self::generate_trace_id(), "01".to_string()),
        };
        let span_id = Self::generate_span_id();
        let traceparent = Self::create_w3c_trace_context(&trace_id, &span_id, &flags);

        if let Ok(value) = HeaderValue::from_str(&traceparent) {
            headers.insert(HeaderName::from_static(TRACEPARENT), value);
        }
        if let Ok(value) = HeaderValue::from_str(&self.hop) {
            headers.insert(HeaderName::from_static(MESH_HOP), value);
        }

        debug!(trace_id = %trace_id, span_id = %span_id, hop = %self.hop, "Stamped trace context");
        trace_id
    }

    /// Extract W3C Trace Context from request headers
    /// Returns (trace_id, span_id, trace_flags) if present
    pub fn extract_w3c_trace_context(headers: &HeaderMap) -> Option<(String, String, String)> {
        // W3C Trace Context header format: version-trace_id-span_id-trace_flags
        let value = headers.get(TRACEPARENT)?.to_str().ok()?;
        let parts: Vec<&str> = value.split('-').collect();
        if parts.len() >= 4 && parts[1..4].iter().all(|p| !p.is_empty()) {
            Some((parts[1].to_string(), parts[2].to_string(), parts[3].to_string()))
        } else {
            None
        }
    }

    /// Create W3C Trace Context header value
    pub fn create_w3c_trace_context(trace_id: &str, span_id: &str, trace_flags: &str) -> String {
        format!("00-{}-{}-{}", trace_id, span_id, trace_flags)
    }

    /// Generate a new span ID (random 16 hex digits)
    pub fn generate_span_id() -> String {
        format!("{:016x}", rand::random::<u64>())
    }

    /// Generate a new trace ID (random 32 hex digits)
    pub fn generate_trace_id() -> String {
        format!("{:032x}", rand::random::<u128>())
    }
}
