//! Control-channel contract and a plain TCP implementation

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Control channel to one remote service
///
/// Failures are reported as-is; callers do not reinterpret them.
#[async_trait]
pub trait Node: Send + Sync {
    async fn connect(&self, port: u16, host: &str) -> anyhow::Result<()>;

    async fn disconnect(&self) -> anyhow::Result<()>;

    fn connected(&self) -> bool;

    fn remote_address(&self) -> Option<String>;

    fn remote_port(&self) -> Option<u16>;
}

struct TcpSession {
    remote: SocketAddr,
    alive: Arc<AtomicBool>,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

/// Node that holds one TCP connection open and drains whatever the remote sends
///
/// `connected` drops to false as soon as the remote closes its side.
#[derive(Default)]
pub struct TcpNode {
    session: Mutex<Option<TcpSession>>,
}

impl TcpNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_session(&self) -> Option<TcpSession> {
        self.session.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn with_session<T>(&self, f: impl FnOnce(&TcpSession) -> T) -> Option<T> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(f)
    }

    async fn shutdown(session: TcpSession) {
        let TcpSession {
            remote,
            alive,
            mut writer,
            reader,
        } = session;
        alive.store(false, Ordering::SeqCst);
        reader.abort();
        if let Err(e) = writer.shutdown().await {
            debug!(remote = %remote, "Control channel shutdown: {}", e);
        }
    }
}

#[async_trait]
impl Node for TcpNode {
    async fn connect(&self, port: u16, host: &str) -> anyhow::Result<()> {
        if let Some(previous) = self.take_session() {
            Self::shutdown(previous).await;
        }

        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let remote = stream.peer_addr()?;
        let (mut read_half, writer) = stream.into_split();

        let alive = Arc::new(AtomicBool::new(true));
        let reader_alive = alive.clone();
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        debug!(remote = %remote, "Control channel closed by remote");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(remote = %remote, "Control channel read failed: {}", e);
                        break;
                    }
                }
            }
            reader_alive.store(false, Ordering::SeqCst);
        });

        info!(remote = %remote, "Control channel connected");
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = Some(TcpSession {
            remote,
            alive,
            writer,
            reader,
        });
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        if let Some(session) = self.take_session() {
            info!(remote = %session.remote, "Control channel disconnected");
            Self::shutdown(session).await;
        }
        Ok(())
    }

    fn connected(&self) -> bool {
        self.with_session(|s| s.alive.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn remote_address(&self) -> Option<String> {
        self.with_session(|s| s.remote.ip().to_string())
    }

    fn remote_port(&self) -> Option<u16> {
        self.with_session(|s| s.remote.port())
    }
}
