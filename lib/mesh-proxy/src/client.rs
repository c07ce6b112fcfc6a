//! Outbound HTTP client that streams a request to a linked backend
//!
//! Nothing is buffered: the inbound body is piped to the backend connection
//! and the backend response body is piped back, so flow control on either
//! side carries through. There is no request timeout and no retry.

use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::handler::Link;
use crate::http::{box_body, strip_hop_by_hop, ProxyBody};
use crate::trace_context::HopTracer;

/// Pooled HTTP client for proxying requests to backend services
pub struct ProxyClient {
    client: Client<HttpConnector, ProxyBody>,
    connect_timeout: Option<Duration>,
}

impl ProxyClient {
    /// Create a new client with connection pooling
    pub fn new(connect_timeout: Option<Duration>) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(connect_timeout);
        connector.set_keepalive(Some(Duration::from_secs(30)));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build::<_, ProxyBody>(connector);

        Self {
            client,
            connect_timeout,
        }
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Build the backend URI for a link, replacing the path when one is given
    ///
    /// The inbound query string is kept unless the override carries its own.
    pub fn target_uri(link: &Link, inbound: &Uri, path: Option<&str>) -> Result<Uri> {
        let path_and_query = match path {
            Some(path) if path.contains('?') => path.to_string(),
            Some(path) => {
                let path = if path.starts_with('/') {
                    path.to_string()
                } else {
                    format!("/{}", path)
                };
                match inbound.query() {
                    Some(query) => format!("{}?{}", path, query),
                    None => path,
                }
            }
            None => inbound
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string()),
        };

        let target = format!("http://{}{}", link.authority(), path_and_query);
        target
            .parse::<Uri>()
            .map_err(|_| ProxyError::InvalidTarget(target))
    }

    /// Forward a request to the linked backend and return its streaming response
    pub async fn forward(
        &self,
        link: &Link,
        path: Option<&str>,
        tracer: &HopTracer,
        request: Request<ProxyBody>,
    ) -> Result<Response<ProxyBody>> {
        let (mut parts, body) = request.into_parts();

        parts.uri = Self::target_uri(link, &parts.uri, path)?;
        let removed = strip_hop_by_hop(&mut parts.headers);
        let trace_id = tracer.apply(&mut parts.headers);

        debug!(
            trace_id = %trace_id,
            method = %parts.method,
            target = %parts.uri,
            "Forwarding request (removed {} hop-by-hop headers)",
            removed
        );

        let response = self.client.request(Request::from_parts(parts, body)).await?;

        debug!(trace_id = %trace_id, status = %response.status(), "Backend responded");

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, box_body(body)))
    }
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new(None)
    }
}
