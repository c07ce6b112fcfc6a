//! Connects registry services as discovery reports peers coming and going
//!
//! Several peers may advertise the same service name, for instance both
//! instances during a rolling restart. A service is wired to one of them at a
//! time; when that peer leaves, the service moves to another peer still
//! advertising the name, and is only torn down when none is left.

use async_trait::async_trait;
use mesh_api::attributes::{self, HTTP_PORT, SCP_PORT, SERVICE_NAME};
use mesh_discovery::{Attributes, DiscoveryEvent, DiscoveryServer, PeerRecord};
use mesh_proxy::{ProxyClient, ProxyHandler, ProxyMetrics};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::node::Node;
use crate::registry::ServiceRegistry;
use crate::remote_service::RemoteService;

/// Builds a fresh control channel for an auto-discovered service
pub type NodeFactory = Arc<dyn Fn() -> Box<dyn Node> + Send + Sync>;

/// Default bound on opening a control channel
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Current view of the peer table, used to catch up after missed events
#[async_trait]
pub trait PeerSnapshot: Send + Sync {
    async fn peers(&self) -> HashMap<String, PeerRecord>;
}

#[async_trait]
impl PeerSnapshot for DiscoveryServer {
    async fn peers(&self) -> HashMap<String, PeerRecord> {
        DiscoveryServer::peers(self).await
    }
}

/// Where one peer serves its service
struct Binding {
    service: Arc<RemoteService>,
    host: String,
    http_port: u16,
    scp_port: u16,
}

#[derive(Default)]
struct WiringState {
    // peer identifier -> service it advertises
    peers: HashMap<String, Binding>,
    // service name -> identifier of the peer it is linked to
    current: HashMap<String, String>,
}

pub struct AutoWirer {
    registry: Arc<ServiceRegistry>,
    node_factory: NodeFactory,
    client: Arc<ProxyClient>,
    metrics: Option<ProxyMetrics>,
    connect_timeout: Duration,
    state: Mutex<WiringState>,
}

impl AutoWirer {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        node_factory: NodeFactory,
        client: Arc<ProxyClient>,
        metrics: Option<ProxyMetrics>,
    ) -> Self {
        Self {
            registry,
            node_factory,
            client,
            metrics,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            state: Mutex::new(WiringState::default()),
        }
    }

    /// Bound on each control channel connect; the proxy stays linked when it expires
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Consume discovery events until the server is dropped
    ///
    /// When the receiver lags, wiring is rebuilt from `peers`.
    pub fn spawn(
        self: Arc<Self>,
        mut events: broadcast::Receiver<DiscoveryEvent>,
        peers: Arc<dyn PeerSnapshot>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if let Err(e) = self.handle(event).await {
                            warn!("Ignoring peer: {}", e);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Auto-wiring lagged behind discovery, {} events skipped, resyncing", skipped);
                        self.resync(&peers.peers().await).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Discovery event stream closed");
                        break;
                    }
                }
            }
        })
    }

    /// Apply one discovery event
    pub async fn handle(&self, event: DiscoveryEvent) -> Result<()> {
        match event {
            DiscoveryEvent::Available {
                identifier,
                attributes,
                host,
            } => self.on_available(identifier, attributes, host).await,
            DiscoveryEvent::Unavailable { identifier } => {
                self.on_unavailable(&identifier).await;
                Ok(())
            }
            other => {
                debug!(event = other.name(), "Not a peer event");
                Ok(())
            }
        }
    }

    /// Bring wiring in line with a peer table snapshot
    pub async fn resync(&self, peers: &HashMap<String, PeerRecord>) {
        let bound: Vec<String> = self.state.lock().await.peers.keys().cloned().collect();
        for identifier in bound {
            let still_available = peers.get(&identifier).map(|p| p.available).unwrap_or(false);
            if !still_available {
                self.on_unavailable(&identifier).await;
            }
        }

        for (identifier, record) in peers {
            if !record.available {
                continue;
            }
            let (Some(attributes), Some(host)) = (&record.attributes, &record.host) else {
                continue;
            };
            if let Err(e) = self
                .on_available(identifier.clone(), attributes.clone(), host.clone())
                .await
            {
                debug!("Ignoring peer during resync: {}", e);
            }
        }
    }

    /// Identifiers currently wired to a service
    pub async fn wired(&self) -> Vec<String> {
        let mut identifiers: Vec<String> = self.state.lock().await.peers.keys().cloned().collect();
        identifiers.sort();
        identifiers
    }

    async fn on_available(&self, identifier: String, attributes: Attributes, host: String) -> Result<()> {
        let http_port = attributes::port(&attributes, HTTP_PORT).ok_or_else(|| {
            CoreError::MissingAttribute {
                identifier: identifier.clone(),
                attribute: HTTP_PORT,
            }
        })?;
        let scp_port = attributes::port(&attributes, SCP_PORT).ok_or_else(|| {
            CoreError::MissingAttribute {
                identifier: identifier.clone(),
                attribute: SCP_PORT,
            }
        })?;
        let name = attributes
            .get(SERVICE_NAME)
            .filter(|n| !n.is_empty())
            .cloned()
            .unwrap_or_else(|| identifier.clone());

        let mut state = self.state.lock().await;

        if let Some(binding) = state.peers.get(&identifier) {
            let unchanged = binding.host == host
                && binding.http_port == http_port
                && binding.scp_port == scp_port
                && state.current.get(&name) == Some(&identifier)
                && binding.service.connected();
            if unchanged {
                debug!(service = %name, peer = %identifier, "Peer already wired");
                return Ok(());
            }
        }

        let service = match self.registry.get_by_name(&name).await {
            Some(service) => service,
            None => {
                let proxy = ProxyHandler::with_client(&name, self.client.clone(), self.metrics.clone());
                let service = Arc::new(RemoteService::discovered(&name, (self.node_factory)(), proxy));
                self.registry.register(service.clone()).await;
                info!(service = %name, peer = %identifier, "Registered discovered service");
                service
            }
        };

        state.peers.insert(
            identifier.clone(),
            Binding {
                service: service.clone(),
                host: host.clone(),
                http_port,
                scp_port,
            },
        );
        state.current.insert(name, identifier.clone());

        self.connect(&service, &identifier, &host, http_port, scp_port).await;
        Ok(())
    }

    async fn on_unavailable(&self, identifier: &str) {
        let mut state = self.state.lock().await;
        let Some(binding) = state.peers.remove(identifier) else {
            debug!(peer = %identifier, "Unavailable peer was never wired");
            return;
        };
        let service = binding.service;
        let name = service.name().to_string();

        if state.current.get(&name).map(String::as_str) != Some(identifier) {
            debug!(service = %name, peer = %identifier, "Departed peer was not the active backend");
            return;
        }

        let successor = state
            .peers
            .iter()
            .find(|(_, b)| Arc::ptr_eq(&b.service, &service))
            .map(|(id, b)| (id.clone(), b.host.clone(), b.http_port, b.scp_port));

        match successor {
            Some((next, host, http_port, scp_port)) => {
                info!(service = %name, from = %identifier, to = %next, "Moving service to remaining peer");
                state.current.insert(name, next.clone());
                self.connect(&service, &next, &host, http_port, scp_port).await;
            }
            None => {
                state.current.remove(&name);
                if let Err(e) = service.disconnect().await {
                    warn!(service = %name, peer = %identifier, "Control channel teardown failed: {:#}", e);
                }
                if !service.is_defined() {
                    self.registry.deregister(&service).await;
                    info!(service = %name, peer = %identifier, "Dropped discovered service");
                }
            }
        }
    }

    async fn connect(&self, service: &RemoteService, peer: &str, host: &str, http_port: u16, scp_port: u16) {
        match tokio::time::timeout(self.connect_timeout, service.connect(host, http_port, scp_port)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(service = %service.name(), peer = %peer, host = %host, "Control channel failed: {:#}", e);
            }
            Err(_) => {
                warn!(
                    service = %service.name(),
                    peer = %peer,
                    host = %host,
                    "Control channel connect timed out after {:?}",
                    self.connect_timeout
                );
            }
        }
    }
}
