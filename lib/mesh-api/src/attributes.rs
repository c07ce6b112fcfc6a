//! Attribute keys carried in discovery gossip
//!
//! Peers on the same multicast group agree on these out of band; values are
//! always strings on the wire.

use std::collections::BTreeMap;

/// Port of the peer's HTTP data plane
pub const HTTP_PORT: &str = "http";

/// Port of the peer's control channel
pub const SCP_PORT: &str = "scp";

/// Logical service name of the peer
pub const SERVICE_NAME: &str = "name";

/// Characters that delimit the gossip wire format
pub const WIRE_DELIMITERS: [char; 4] = ['*', '$', '&', '='];

/// True when the value can travel in gossip without being split apart
pub fn is_wire_safe(value: &str) -> bool {
    !value.contains(&WIRE_DELIMITERS[..])
}

/// Parse a port-valued attribute, returning None when absent or not a port
pub fn port(attributes: &BTreeMap<String, String>, key: &str) -> Option<u16> {
    attributes.get(key).and_then(|v| v.trim().parse::<u16>().ok())
}
