use anyhow::{Context, Result};
use futures::future::join_all;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use mesh_api::{LogFormat, MeshConfig};
use mesh_core::{AutoWirer, Node, NodeFactory, RemoteService, ServiceRegistry, TcpNode};
use mesh_discovery::DiscoveryServer;
use mesh_proxy::{ProxyClient, ProxyHandler, ProxyMetrics};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod control;
mod router;

use router::Router;

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

    let identifier = config.resolve_identifier();
    info!(identifier = %identifier, name = %config.name, "Starting mesh-node...");

    let metrics = ProxyMetrics::new()?;
    let client = Arc::new(ProxyClient::new(config.proxy.connect_timeout()));
    info!("Proxy client initialized (connect timeout {:?})", client.connect_timeout());

    // Explicitly configured services
    let registry = Arc::new(ServiceRegistry::new());
    for definition in &config.services {
        let proxy = ProxyHandler::with_client(&definition.name, client.clone(), Some(metrics.clone()));
        let service = RemoteService::defined(
            definition.name.clone(),
            definition.alias.clone(),
            Box::new(TcpNode::new()),
            proxy,
        )?;
        registry.register(Arc::new(service)).await;
        info!(service = %definition.name, alias = ?definition.alias, "Defined service");
    }

    // Control channel peers connect to
    let control = TcpListener::bind((config.http.listen.ip(), config.scp_port)).await?;
    info!("Control channel listening on {}", control.local_addr()?);
    tokio::spawn(control::accept_loop(control));

    let discovery = Arc::new(
        DiscoveryServer::builder(identifier.clone())
            .attributes(config.advertised_attributes())
            .interface(config.discovery.interface)
            .announce_interval(config.discovery.announce_interval())
            .multicast_ttl(config.discovery.multicast_ttl)
            .build(),
    );

    let node_factory: NodeFactory = Arc::new(|| Box::new(TcpNode::new()) as Box<dyn Node>);
    let mut wirer = AutoWirer::new(registry.clone(), node_factory, client.clone(), Some(metrics.clone()));
    if let Some(timeout) = config.proxy.connect_timeout() {
        wirer = wirer.with_connect_timeout(timeout);
    }
    let wiring = Arc::new(wirer).spawn(discovery.subscribe(), discovery.clone());

    discovery
        .listen(config.discovery.port, config.discovery.multicast_address)
        .await
        .context("Failed to join discovery group")?;
    info!(
        group = %config.discovery.multicast_address,
        port = config.discovery.port,
        "Discovery listening"
    );

    let http_listener = TcpListener::bind(config.http.listen).await?;
    info!("HTTP server listening on {}", config.http.listen);

    let router = Arc::new(Router::new(registry.clone(), metrics));

    tokio::select! {
        result = serve(http_listener, router) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        _ = discovery.released() => info!("Discovery socket released"),
    }

    if discovery.is_listening() {
        if let Err(e) = discovery.close().await {
            warn!("Discovery close failed: {}", e);
        }
    }
    let services = registry.list().await;
    let results = join_all(services.iter().map(|service| service.disconnect())).await;
    for (service, result) in services.iter().zip(results) {
        if let Err(e) = result {
            debug!(service = %service.name(), "Disconnect on shutdown: {:#}", e);
        }
    }
    wiring.abort();

    info!("mesh-node stopped");
    Ok(())
}

async fn serve(listener: TcpListener, router: Arc<Router>) -> Result<()> {
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let router = router.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let router = router.clone();
                async move { Ok::<_, Infallible>(router.route(req).await) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }
}
