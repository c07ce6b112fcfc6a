//! Events published by the discovery server

use crate::error::DiscoveryError;
use crate::pod::Attributes;

#[derive(Clone, Debug)]
pub enum DiscoveryEvent {
    /// The self-echo handshake completed and the server is listening
    Listening,

    /// A peer became available, either for the first time or after a restart
    Available {
        identifier: String,
        attributes: Attributes,
        host: String,
    },

    /// A previously available peer announced it is going away
    Unavailable { identifier: String },

    /// A socket-level failure
    Error(DiscoveryError),

    /// The close handshake completed and the socket is torn down
    Close,
}

impl DiscoveryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DiscoveryEvent::Listening => "listening",
            DiscoveryEvent::Available { .. } => "available",
            DiscoveryEvent::Unavailable { .. } => "unavailable",
            DiscoveryEvent::Error(_) => "error",
            DiscoveryEvent::Close => "close",
        }
    }
}
