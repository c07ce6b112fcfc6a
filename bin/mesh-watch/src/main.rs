use anyhow::{Context, Result};
use mesh_api::{LogFormat, MeshConfig};
use mesh_discovery::{DiscoveryEvent, DiscoveryServer};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = MeshConfig::from_env().context("Failed to load configuration")?;
    init_tracing(config.log_format);

    let identifier = format!("{}-watch", config.resolve_identifier());
    info!(identifier = %identifier, "Starting mesh-watch...");

    // Listens without advertising any ports, so nobody wires to it
    let discovery = DiscoveryServer::builder(identifier)
        .interface(config.discovery.interface)
        .announce_interval(None)
        .multicast_ttl(config.discovery.multicast_ttl)
        .build();
    let mut events = discovery.subscribe();

    discovery
        .listen(config.discovery.port, config.discovery.multicast_address)
        .await
        .context("Failed to join discovery group")?;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Skipped {} discovery events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    let peers = discovery.peers().await;
    let available = peers.values().filter(|p| p.available).count();
    info!("Known peers: {} ({} available)", peers.len(), available);
    match serde_json::to_string(&peers) {
        Ok(snapshot) => debug!("Peer table: {}", snapshot),
        Err(e) => warn!("Failed to serialize peer table: {}", e),
    }

    if let Err(e) = discovery.close().await {
        error!("Discovery close failed: {}", e);
    }
    Ok(())
}

fn log_event(event: &DiscoveryEvent) {
    match event {
        DiscoveryEvent::Available {
            identifier,
            attributes,
            host,
        } => info!(identifier = %identifier, host = %host, ?attributes, "Peer available"),
        DiscoveryEvent::Unavailable { identifier } => {
            info!(identifier = %identifier, "Peer unavailable")
        }
        DiscoveryEvent::Error(e) => error!("Discovery error: {}", e),
        other => debug!(event = other.name(), "Discovery lifecycle"),
    }
}
