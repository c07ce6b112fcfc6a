//! Multicast peer discovery for the mesh
//!
//! This library provides:
//! - The Pod gossip message and its text wire codec
//! - A peer table that debounces duplicate and out-of-order gossip
//! - DiscoveryServer, which owns the multicast socket, resolves its own
//!   network-visible address through a self-echo handshake and publishes
//!   peer availability events

pub mod error;
pub mod event;
pub mod peer;
pub mod pod;
pub mod server;

pub use error::{DiscoveryError, PodError, Result};
pub use event::DiscoveryEvent;
pub use peer::{PeerRecord, PeerTable};
pub use pod::{Attributes, Pod};
pub use server::{DiscoveryServer, DiscoveryServerBuilder};
