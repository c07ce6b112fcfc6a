#![allow(dead_code)]

use async_trait::async_trait;
use mesh_core::Node;
use mesh_proxy::ProxyHandler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// What a FakeNode saw, in order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Connect { port: u16, host: String, proxy_linked: bool },
    Disconnect { proxy_linked: bool },
}

/// In-memory control channel that records calls and the proxy state at each one
#[derive(Clone, Default)]
pub struct FakeNode {
    pub calls: Arc<Mutex<Vec<Call>>>,
    pub up: Arc<AtomicBool>,
    pub fail_connect: Arc<AtomicBool>,
    pub hang_connect: Arc<AtomicBool>,
    remote: Arc<Mutex<Option<(String, u16)>>>,
    watched: Arc<Mutex<Option<ProxyHandler>>>,
}

impl FakeNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record whether this proxy was linked at each call
    pub fn watching(proxy: &ProxyHandler) -> Self {
        let node = Self::default();
        *node.watched.lock().unwrap() = Some(proxy.clone());
        node
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    fn proxy_linked(&self) -> bool {
        self.watched
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.linked())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Node for FakeNode {
    async fn connect(&self, port: u16, host: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(Call::Connect {
            port,
            host: host.to_string(),
            proxy_linked: self.proxy_linked(),
        });
        if self.fail_connect.load(Ordering::SeqCst) {
            anyhow::bail!("connection refused");
        }
        if self.hang_connect.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        *self.remote.lock().unwrap() = Some((host.to_string(), port));
        self.up.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(Call::Disconnect {
            proxy_linked: self.proxy_linked(),
        });
        *self.remote.lock().unwrap() = None;
        self.up.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    fn remote_address(&self) -> Option<String> {
        self.remote.lock().unwrap().as_ref().map(|(h, _)| h.clone())
    }

    fn remote_port(&self) -> Option<u16> {
        self.remote.lock().unwrap().as_ref().map(|(_, p)| *p)
    }
}
