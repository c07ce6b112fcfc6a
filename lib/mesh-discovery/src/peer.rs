//! Peer table and the availability state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::event::DiscoveryEvent;
use crate::pod::{Attributes, Pod};

/// What this instance knows about one remote identifier
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub available: bool,
    /// None while the peer is unavailable
    pub attributes: Option<Attributes>,
    /// Source address of the last transition to available
    pub host: Option<String>,
    pub last_seen: DateTime<Utc>,
}

/// Peer records keyed by identifier
///
/// Records are never removed: an unavailable record is kept so that repeated
/// unavailable gossip is recognized as a duplicate.
#[derive(Debug)]
pub struct PeerTable {
    local_identifier: String,
    peers: HashMap<String, PeerRecord>,
}

impl PeerTable {
    pub fn new(local_identifier: impl Into<String>) -> Self {
        Self {
            local_identifier: local_identifier.into(),
            peers: HashMap::new(),
        }
    }

    /// Apply one received pod and return the event the transition produces, if any
    pub fn observe(&mut self, pod: Pod, host: &str) -> Option<DiscoveryEvent> {
        if pod.identifier() == self.local_identifier {
            return None;
        }

        let now = Utc::now();
        let identifier = pod.identifier().to_string();
        let available = pod.available();

        if !self.peers.contains_key(&identifier) {
            return self.first_sighting(identifier, pod, host);
        }
        let record = self.peers.get_mut(&identifier)?;
        record.last_seen = now;

        match (record.available, available) {
            (false, true) => {
                let attributes = pod.into_attributes();
                info!(identifier = %identifier, host = %host, "Peer available again");
                record.available = true;
                record.attributes = Some(attributes.clone());
                record.host = Some(host.to_string());
                Some(DiscoveryEvent::Available {
                    identifier,
                    attributes,
                    host: host.to_string(),
                })
            }
            (true, false) => {
                info!(identifier = %identifier, "Peer unavailable");
                record.available = false;
                record.attributes = None;
                record.host = None;
                Some(DiscoveryEvent::Unavailable { identifier })
            }
            _ => {
                debug!(identifier = %identifier, available, "Duplicate gossip");
                None
            }
        }
    }

    fn first_sighting(&mut self, identifier: String, pod: Pod, host: &str) -> Option<DiscoveryEvent> {
        let now = Utc::now();

        if !pod.available() {
            debug!(identifier = %identifier, "First sighting of peer is unavailable");
            self.peers.insert(
                identifier,
                PeerRecord {
                    available: false,
                    attributes: None,
                    host: None,
                    last_seen: now,
                },
            );
            return None;
        }

        let attributes = pod.into_attributes();
        info!(identifier = %identifier, host = %host, "Peer available");
        self.peers.insert(
            identifier.clone(),
            PeerRecord {
                available: true,
                attributes: Some(attributes.clone()),
                host: Some(host.to_string()),
                last_seen: now,
            },
        );
        Some(DiscoveryEvent::Available {
            identifier,
            attributes,
            host: host.to_string(),
        })
    }

    pub fn get(&self, identifier: &str) -> Option<&PeerRecord> {
        self.peers.get(identifier)
    }

    /// Snapshot of every known peer
    pub fn snapshot(&self) -> HashMap<String, PeerRecord> {
        self.peers.clone()
    }

    /// Identifiers of peers currently available
    pub fn available(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .peers
            .iter()
            .filter(|(_, record)| record.available)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
