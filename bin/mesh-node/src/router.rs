//! Routes `/<service>/...` to that service's proxy handler

use hyper::body::{Body, Bytes};
use hyper::{Method, Request, Response, StatusCode};
use mesh_core::{Connectivity, ServiceRegistry};
use mesh_proxy::http::{not_found_response, service_unavailable_response, text_response};
use mesh_proxy::{BoxError, ProxyBody, ProxyMetrics};
use std::sync::Arc;
use tracing::debug;

/// Front door mapping service names (or aliases) to proxy handlers
pub struct Router {
    registry: Arc<ServiceRegistry>,
    metrics: ProxyMetrics,
}

impl Router {
    pub fn new(registry: Arc<ServiceRegistry>, metrics: ProxyMetrics) -> Self {
        Self { registry, metrics }
    }

    /// Split `/ledger/accounts/7` into `("ledger", "/accounts/7")`
    pub fn split_service_path(path: &str) -> Option<(&str, &str)> {
        let trimmed = path.strip_prefix('/')?;
        let (service, rest) = match trimmed.find('/') {
            Some(idx) => (&trimmed[..idx], &trimmed[idx..]),
            None => (trimmed, "/"),
        };
        if service.is_empty() {
            None
        } else {
            Some((service, rest))
        }
    }

    pub async fn route<B>(&self, req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let path = req.uri().path().to_string();
        debug!("{} {}", req.method(), path);

        if path == "/healthz" {
            return self.health().await;
        }

        if path == "/metrics" && req.method() == Method::GET {
            return match self.metrics.gather() {
                Ok(text) => text_response(StatusCode::OK, text),
                Err(e) => text_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to gather metrics: {}\n", e),
                ),
            };
        }

        let Some((name, rest)) = Self::split_service_path(&path) else {
            return not_found_response("no service in path");
        };

        match self.registry.resolve(name).await {
            Some(service) => {
                let forward = service.proxy().forward(Some(rest.to_string()));
                forward.handle(req).await
            }
            None => {
                debug!("No service registered as {}", name);
                not_found_response(&format!("unknown service {}", name))
            }
        }
    }

    async fn health(&self) -> Response<ProxyBody> {
        match self.registry.connected().await {
            Connectivity::Connected => text_response(StatusCode::OK, "OK\n"),
            Connectivity::Indeterminate => text_response(StatusCode::OK, "OK (no defined services)\n"),
            Connectivity::Disconnected => service_unavailable_response("defined service disconnected"),
        }
    }
}
