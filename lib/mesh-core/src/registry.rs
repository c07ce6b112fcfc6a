//! Registry of remote services and their aggregate connectivity

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::remote_service::RemoteService;

/// Aggregate health over the explicitly defined services
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectivity {
    /// No defined services, so nothing to be connected to
    Indeterminate,
    Connected,
    Disconnected,
}

impl Connectivity {
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Connectivity::Indeterminate => None,
            Connectivity::Connected => Some(true),
            Connectivity::Disconnected => Some(false),
        }
    }
}

/// ServiceRegistry keeps registered services in insertion order, unique by identity
pub struct ServiceRegistry {
    services: Arc<RwLock<Vec<Arc<RemoteService>>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a service; registering the same instance twice is a no-op
    pub async fn register(&self, service: Arc<RemoteService>) {
        let mut services = self.services.write().await;
        if services.iter().any(|s| Arc::ptr_eq(s, &service)) {
            return;
        }
        debug!(
            service = %service.name(),
            defined = service.is_defined(),
            "Registered service"
        );
        services.push(service);
    }

    /// Remove a service by identity, returning whether it was registered
    pub async fn deregister(&self, service: &Arc<RemoteService>) -> bool {
        let mut services = self.services.write().await;
        let before = services.len();
        services.retain(|s| !Arc::ptr_eq(s, service));
        let removed = services.len() != before;
        if removed {
            debug!(service = %service.name(), "Deregistered service");
        }
        removed
    }

    /// First service with this name
    pub async fn get_by_name(&self, name: &str) -> Option<Arc<RemoteService>> {
        if name.is_empty() {
            return None;
        }
        let services = self.services.read().await;
        services.iter().find(|s| s.name() == name).cloned()
    }

    /// First service with this alias
    pub async fn get_by_alias(&self, alias: &str) -> Option<Arc<RemoteService>> {
        if alias.is_empty() {
            return None;
        }
        let services = self.services.read().await;
        services.iter().find(|s| s.alias() == Some(alias)).cloned()
    }

    /// Name first, then alias
    pub async fn resolve(&self, key: &str) -> Option<Arc<RemoteService>> {
        match self.get_by_name(key).await {
            Some(service) => Some(service),
            None => self.get_by_alias(key).await,
        }
    }

    pub async fn list(&self) -> Vec<Arc<RemoteService>> {
        self.services.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.services.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.services.read().await.is_empty()
    }

    /// Aggregate over defined services, recomputed on every call
    ///
    /// Disconnected as soon as one defined service has both its proxy
    /// unlinked and its control channel down.
    pub async fn connected(&self) -> Connectivity {
        let services = self.services.read().await;
        let mut defined = services.iter().filter(|s| s.is_defined()).peekable();
        if defined.peek().is_none() {
            return Connectivity::Indeterminate;
        }
        if defined.any(|s| s.fully_down()) {
            Connectivity::Disconnected
        } else {
            Connectivity::Connected
        }
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
