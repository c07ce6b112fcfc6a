//! Inbound side of the control channel
//!
//! Peers hold one TCP connection open per service; the connection closing is
//! their signal that this node went away. Nothing is exchanged on it yet.

use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

pub async fn accept_loop(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!("Control channel opened by {}", peer_addr);
                tokio::spawn(async move {
                    hold(stream).await;
                    debug!("Control channel from {} closed", peer_addr);
                });
            }
            Err(e) => {
                warn!("Error accepting control connection: {}", e);
            }
        }
    }
}

async fn hold(mut stream: TcpStream) {
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}
