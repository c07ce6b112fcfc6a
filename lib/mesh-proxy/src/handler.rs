//! Proxy handler with explicit link/unlink state

use hyper::body::{Body, Bytes};
use hyper::service::Service;
use hyper::{Request, Response};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::client::ProxyClient;
use crate::error::ProxyError;
use crate::http::{box_body, BoxError, ProxyBody};
use crate::metrics::{ProxyMetrics, OUTCOME_BACKEND_ERROR, OUTCOME_FORWARDED, OUTCOME_UNLINKED};
use crate::trace_context::HopTracer;

/// The backend a proxy forwards to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Link {
    pub host: String,
    pub port: u16,
}

impl Link {
    /// `host:port`, bracketing IPv6 literals
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    Link,
    Unlink,
}

struct ProxyInner {
    name: String,
    // host and port exist exactly while linked
    link: RwLock<Option<Link>>,
    events: broadcast::Sender<LinkEvent>,
    client: Arc<ProxyClient>,
    tracer: HopTracer,
    metrics: Option<ProxyMetrics>,
}

/// Reverse proxy for one remote service
///
/// Cloning is cheap and every clone shares the same link state.
#[derive(Clone)]
pub struct ProxyHandler {
    inner: Arc<ProxyInner>,
}

impl ProxyHandler {
    /// Create an unlinked proxy with its own client
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_client(name, Arc::new(ProxyClient::default()), None)
    }

    /// Create an unlinked proxy sharing a client and metrics with other proxies
    pub fn with_client(
        name: impl Into<String>,
        client: Arc<ProxyClient>,
        metrics: Option<ProxyMetrics>,
    ) -> Self {
        let name = name.into();
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(ProxyInner {
                tracer: HopTracer::new(name.clone()),
                name,
                link: RwLock::new(None),
                events,
                client,
                metrics,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Point the proxy at a backend. Opens no connection by itself.
    pub fn link(&self, port: u16, host: impl Into<String>) {
        let link = Link {
            host: host.into(),
            port,
        };
        info!(proxy = %self.inner.name, backend = %link.authority(), "Proxy linked");
        *self.inner.link.write().unwrap_or_else(|e| e.into_inner()) = Some(link);
        let _ = self.inner.events.send(LinkEvent::Link);
    }

    /// Detach the backend. Requests already past the link check keep running.
    pub fn unlink(&self) {
        self.inner
            .link
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        info!(proxy = %self.inner.name, "Proxy unlinked");
        let _ = self.inner.events.send(LinkEvent::Unlink);
    }

    pub fn linked(&self) -> bool {
        self.current_link().is_some()
    }

    pub fn host(&self) -> Option<String> {
        self.current_link().map(|link| link.host)
    }

    pub fn port(&self) -> Option<u16> {
        self.current_link().map(|link| link.port)
    }

    pub fn current_link(&self) -> Option<Link> {
        self.inner
            .link
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Subscribe to link/unlink events
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.inner.events.subscribe()
    }

    /// A request handler forwarding to whatever backend is linked at call time
    pub fn forward(&self, path: Option<String>) -> Forward {
        Forward {
            proxy: self.clone(),
            path,
        }
    }

    fn record(&self, outcome: &str) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_outcome(&self.inner.name, outcome);
        }
    }
}

/// Request handler returned by [`ProxyHandler::forward`]
#[derive(Clone)]
pub struct Forward {
    proxy: ProxyHandler,
    path: Option<String>,
}

impl Forward {
    /// Forward one request; failures become a 503 response
    pub async fn handle<B>(&self, request: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<BoxError>,
    {
        let inner = &self.proxy.inner;

        let Some(link) = self.proxy.current_link() else {
            debug!(proxy = %inner.name, "Rejecting request, no backend linked");
            self.proxy.record(OUTCOME_UNLINKED);
            return ProxyError::Unlinked.to_response();
        };

        let request = request.map(box_body);
        match inner
            .client
            .forward(&link, self.path.as_deref(), &inner.tracer, request)
            .await
        {
            Ok(response) => {
                self.proxy.record(OUTCOME_FORWARDED);
                if let Some(metrics) = &inner.metrics {
                    metrics.record_status(&inner.name, response.status().as_u16());
                }
                response
            }
            Err(e) => {
                warn!(proxy = %inner.name, backend = %link.authority(), "Backend error: {}", e);
                self.proxy.record(OUTCOME_BACKEND_ERROR);
                e.to_response()
            }
        }
    }
}

impl<B> Service<Request<B>> for Forward
where
    B: Body<Data = Bytes> + Send + 'static,
    B::Error: Into<BoxError>,
{
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, request: Request<B>) -> Self::Future {
        let forward = self.clone();
        Box::pin(async move { Ok(forward.handle(request).await) })
    }
}
