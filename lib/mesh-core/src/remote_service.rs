//! One logical peer service: a control channel plus a proxy handler

use mesh_proxy::ProxyHandler;
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::node::Node;

/// A peer service as the application knows it
///
/// Owns its `Node` and its `ProxyHandler`. `defined` services come from
/// configuration; the rest were created because discovery reported them.
pub struct RemoteService {
    name: String,
    alias: Option<String>,
    defined: bool,
    node: Box<dyn Node>,
    proxy: ProxyHandler,
}

impl RemoteService {
    /// An explicitly configured service
    pub fn defined(
        name: impl Into<String>,
        alias: Option<String>,
        node: Box<dyn Node>,
        proxy: ProxyHandler,
    ) -> Result<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(CoreError::InvalidDefinition(
                "service name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            name,
            alias: alias.filter(|a| !a.is_empty()),
            defined: true,
            node,
            proxy,
        })
    }

    /// A service created on behalf of a discovered peer
    pub fn discovered(name: impl Into<String>, node: Box<dyn Node>, proxy: ProxyHandler) -> Self {
        Self {
            name: name.into(),
            alias: None,
            defined: false,
            node,
            proxy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    pub fn is_defined(&self) -> bool {
        self.defined
    }

    pub fn node(&self) -> &dyn Node {
        self.node.as_ref()
    }

    pub fn proxy(&self) -> &ProxyHandler {
        &self.proxy
    }

    /// Link the proxy to `address:http_port`, then open the control channel
    ///
    /// The proxy is usable as soon as this is called. A control channel
    /// failure is returned unchanged and leaves the proxy linked.
    pub async fn connect(&self, address: &str, http_port: u16, scp_port: u16) -> anyhow::Result<()> {
        self.proxy.link(http_port, address);
        debug!(service = %self.name, address, scp_port, "Opening control channel");
        self.node.connect(scp_port, address).await?;
        info!(service = %self.name, address, http_port, scp_port, "Service connected");
        Ok(())
    }

    /// Unlink the proxy first, then close the control channel
    pub async fn disconnect(&self) -> anyhow::Result<()> {
        self.proxy.unlink();
        self.node.disconnect().await?;
        info!(service = %self.name, "Service disconnected");
        Ok(())
    }

    /// Both the proxy is linked and the control channel is up
    pub fn connected(&self) -> bool {
        self.proxy.linked() && self.node.connected()
    }

    /// Neither channel is up
    pub fn fully_down(&self) -> bool {
        !self.proxy.linked() && !self.node.connected()
    }
}

impl std::fmt::Debug for RemoteService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteService")
            .field("name", &self.name)
            .field("alias", &self.alias)
            .field("defined", &self.defined)
            .field("linked", &self.proxy.linked())
            .field("node_connected", &self.node.connected())
            .finish()
    }
}
