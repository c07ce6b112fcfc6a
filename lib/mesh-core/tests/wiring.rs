mod common;

use async_trait::async_trait;
use common::{Call, FakeNode};
use mesh_core::{
    AutoWirer, CoreError, Node, NodeFactory, PeerSnapshot, RemoteService, ServiceRegistry, DEFAULT_CONNECT_TIMEOUT,
};
use mesh_discovery::{Attributes, DiscoveryEvent, PeerRecord};
use mesh_proxy::{ProxyClient, ProxyHandler};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

struct Harness {
    registry: Arc<ServiceRegistry>,
    wirer: Arc<AutoWirer>,
    created: Arc<Mutex<Vec<FakeNode>>>,
}

fn harness() -> Harness {
    harness_with(DEFAULT_CONNECT_TIMEOUT)
}

fn harness_with(connect_timeout: Duration) -> Harness {
    let registry = Arc::new(ServiceRegistry::new());
    let created = Arc::new(Mutex::new(Vec::new()));
    let factory_created = created.clone();
    let factory: NodeFactory = Arc::new(move || {
        let node = FakeNode::new();
        factory_created.lock().unwrap().push(node.clone());
        Box::new(node) as Box<dyn Node>
    });
    let wirer = Arc::new(
        AutoWirer::new(registry.clone(), factory, Arc::new(ProxyClient::default()), None)
            .with_connect_timeout(connect_timeout),
    );
    Harness {
        registry,
        wirer,
        created,
    }
}

fn attributes(pairs: &[(&str, &str)]) -> Attributes {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn available(identifier: &str, attributes: Attributes, host: &str) -> DiscoveryEvent {
    DiscoveryEvent::Available {
        identifier: identifier.to_string(),
        attributes,
        host: host.to_string(),
    }
}

fn unavailable(identifier: &str) -> DiscoveryEvent {
    DiscoveryEvent::Unavailable {
        identifier: identifier.to_string(),
    }
}

/// Peer table served from memory
#[derive(Default)]
struct StaticPeers(Mutex<HashMap<String, PeerRecord>>);

impl StaticPeers {
    fn up(&self, identifier: &str, attributes: Attributes, host: &str) {
        self.0.lock().unwrap().insert(
            identifier.to_string(),
            PeerRecord {
                available: true,
                attributes: Some(attributes),
                host: Some(host.to_string()),
                last_seen: chrono::Utc::now(),
            },
        );
    }

    fn down(&self, identifier: &str) {
        self.0.lock().unwrap().insert(
            identifier.to_string(),
            PeerRecord {
                available: false,
                attributes: None,
                host: None,
                last_seen: chrono::Utc::now(),
            },
        );
    }
}

#[async_trait]
impl PeerSnapshot for StaticPeers {
    async fn peers(&self) -> HashMap<String, PeerRecord> {
        self.0.lock().unwrap().clone()
    }
}

async fn wait_for_wired(wirer: &AutoWirer, expected: &[&str]) -> bool {
    for _ in 0..100 {
        if wirer.wired().await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn available_peer_becomes_discovered_service() {
    let h = harness();

    h.wirer
        .handle(available(
            "SVC1",
            attributes(&[("name", "ledger"), ("http", "3001"), ("scp", "4001")]),
            "10.0.0.5",
        ))
        .await
        .unwrap();

    let service = h.registry.get_by_name("ledger").await.unwrap();
    assert!(!service.is_defined());
    assert!(service.connected());
    assert_eq!(service.proxy().port(), Some(3001));
    assert_eq!(service.node().remote_address().as_deref(), Some("10.0.0.5"));
    assert_eq!(h.wirer.wired().await, vec!["SVC1".to_string()]);
}

#[tokio::test]
async fn identifier_names_the_service_without_name_attribute() {
    let h = harness();

    h.wirer
        .handle(available(
            "SVC1",
            attributes(&[("http", "3001"), ("scp", "4001")]),
            "10.0.0.5",
        ))
        .await
        .unwrap();

    assert!(h.registry.get_by_name("SVC1").await.is_some());
}

#[tokio::test]
async fn unavailable_drops_discovered_service() {
    let h = harness();
    h.wirer
        .handle(available(
            "SVC1",
            attributes(&[("name", "ledger"), ("http", "3001"), ("scp", "4001")]),
            "10.0.0.5",
        ))
        .await
        .unwrap();

    h.wirer.handle(unavailable("SVC1")).await.unwrap();

    assert!(h.registry.get_by_name("ledger").await.is_none());
    assert!(h.wirer.wired().await.is_empty());
    let node = h.created.lock().unwrap()[0].clone();
    assert_eq!(node.calls().last(), Some(&Call::Disconnect { proxy_linked: false }));
}

#[tokio::test]
async fn defined_service_is_reused_and_kept() {
    let h = harness();
    let proxy = ProxyHandler::new("ledger");
    let node = FakeNode::watching(&proxy);
    let ledger = Arc::new(
        RemoteService::defined("ledger", Some("books".to_string()), Box::new(node.clone()), proxy.clone())
            .unwrap(),
    );
    h.registry.register(ledger.clone()).await;

    h.wirer
        .handle(available(
            "SVC1",
            attributes(&[("name", "ledger"), ("http", "3001"), ("scp", "4001")]),
            "10.0.0.5",
        ))
        .await
        .unwrap();

    assert!(h.created.lock().unwrap().is_empty());
    assert!(ledger.connected());
    assert_eq!(h.registry.len().await, 1);

    h.wirer.handle(unavailable("SVC1")).await.unwrap();

    assert!(!ledger.connected());
    assert!(!proxy.linked());
    assert!(Arc::ptr_eq(&h.registry.get_by_name("ledger").await.unwrap(), &ledger));
}

#[tokio::test]
async fn peer_without_ports_is_rejected() {
    let h = harness();

    let err = h
        .wirer
        .handle(available("SVC1", attributes(&[("http", "3001")]), "10.0.0.5"))
        .await
        .unwrap_err();

    assert!(matches!(err, CoreError::MissingAttribute { attribute: "scp", .. }));
    assert!(h.registry.is_empty().await);
}

#[tokio::test]
async fn unknown_unavailable_is_ignored() {
    let h = harness();
    assert!(h.wirer.handle(unavailable("ghost")).await.is_ok());
    assert!(h.wirer.handle(DiscoveryEvent::Listening).await.is_ok());
}

#[tokio::test]
async fn spawned_wirer_follows_event_stream() {
    let h = harness();
    let (tx, rx) = broadcast::channel(16);
    let task = h.wirer.clone().spawn(rx, Arc::new(StaticPeers::default()));

    tx.send(available(
        "SVC1",
        attributes(&[("http", "3001"), ("scp", "4001")]),
        "10.0.0.5",
    ))
    .unwrap();

    let mut found = false;
    for _ in 0..50 {
        if h.registry.get_by_name("SVC1").await.is_some() {
            found = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(found);

    drop(tx);
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn rolling_restart_keeps_service_on_new_instance() {
    let h = harness();
    let ledger = attributes(&[("name", "ledger"), ("http", "3001"), ("scp", "4001")]);

    h.wirer.handle(available("ledger-old", ledger.clone(), "10.0.0.5")).await.unwrap();
    h.wirer.handle(available("ledger-new", ledger.clone(), "10.0.0.6")).await.unwrap();
    h.wirer.handle(unavailable("ledger-old")).await.unwrap();

    let service = h.registry.get_by_name("ledger").await.unwrap();
    assert!(service.connected());
    assert_eq!(service.proxy().host().as_deref(), Some("10.0.0.6"));
    assert_eq!(service.node().remote_address().as_deref(), Some("10.0.0.6"));
    assert_eq!(h.wirer.wired().await, vec!["ledger-new".to_string()]);
    assert_eq!(h.created.lock().unwrap().len(), 1);

    h.wirer.handle(unavailable("ledger-new")).await.unwrap();

    assert!(h.registry.get_by_name("ledger").await.is_none());
    assert!(h.wirer.wired().await.is_empty());
}

#[tokio::test]
async fn departing_active_peer_hands_service_to_remaining_peer() {
    let h = harness();
    let ledger = attributes(&[("name", "ledger"), ("http", "3001"), ("scp", "4001")]);

    h.wirer.handle(available("ledger-a", ledger.clone(), "10.0.0.5")).await.unwrap();
    h.wirer.handle(available("ledger-b", ledger.clone(), "10.0.0.6")).await.unwrap();
    h.wirer.handle(unavailable("ledger-b")).await.unwrap();

    let service = h.registry.get_by_name("ledger").await.unwrap();
    assert!(service.connected());
    assert_eq!(service.proxy().host().as_deref(), Some("10.0.0.5"));
    let node = h.created.lock().unwrap()[0].clone();
    assert_eq!(
        node.calls().last(),
        Some(&Call::Connect {
            port: 4001,
            host: "10.0.0.5".to_string(),
            proxy_linked: false,
        })
    );
    assert_eq!(h.wirer.wired().await, vec!["ledger-a".to_string()]);
}

#[tokio::test]
async fn hung_control_connect_does_not_stall_wiring() {
    let h = harness_with(Duration::from_millis(50));
    let proxy = ProxyHandler::new("ledger");
    let node = FakeNode::watching(&proxy);
    node.hang_connect.store(true, Ordering::SeqCst);
    let ledger = Arc::new(RemoteService::defined("ledger", None, Box::new(node), proxy.clone()).unwrap());
    h.registry.register(ledger.clone()).await;

    tokio::time::timeout(
        Duration::from_secs(2),
        h.wirer.handle(available(
            "SVC1",
            attributes(&[("name", "ledger"), ("http", "3001"), ("scp", "4001")]),
            "10.0.0.5",
        )),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(proxy.linked());
    assert!(!ledger.connected());

    h.wirer
        .handle(available(
            "SVC2",
            attributes(&[("http", "3002"), ("scp", "4002")]),
            "10.0.0.6",
        ))
        .await
        .unwrap();
    assert!(h.registry.get_by_name("SVC2").await.unwrap().connected());
}

#[tokio::test]
async fn lagged_wirer_resyncs_from_peer_table() {
    let h = harness();
    let audit = attributes(&[("name", "audit"), ("http", "3009"), ("scp", "4009")]);
    h.wirer.handle(available("AUDIT", audit, "10.0.0.9")).await.unwrap();

    let peers = Arc::new(StaticPeers::default());
    peers.down("AUDIT");
    let (tx, rx) = broadcast::channel(1);
    for (i, identifier) in ["SVC1", "SVC2", "SVC3"].iter().enumerate() {
        let http = (3001 + i).to_string();
        let scp = (4001 + i).to_string();
        let attrs = attributes(&[("http", http.as_str()), ("scp", scp.as_str())]);
        peers.up(identifier, attrs.clone(), "10.0.0.5");
        tx.send(available(identifier, attrs, "10.0.0.5")).unwrap();
    }

    let task = h.wirer.clone().spawn(rx, peers.clone());

    assert!(wait_for_wired(&h.wirer, &["SVC1", "SVC2", "SVC3"]).await);
    assert!(h.registry.get_by_name("audit").await.is_none());
    assert_eq!(h.registry.get_by_name("SVC1").await.unwrap().proxy().port(), Some(3001));
    assert_eq!(h.registry.len().await, 3);

    drop(tx);
    tokio::time::timeout(Duration::from_secs(1), task)
        .await
        .unwrap()
        .unwrap();
}
