use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// A datagram payload that does not follow the pod grammar
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PodError {
    #[error("Malformed pod: missing identifier segment")]
    MissingIdentifier,

    #[error("Malformed pod: missing availability segment")]
    MissingAvailability,

    #[error("Malformed pod: invalid availability {0:?}")]
    InvalidAvailability(String),

    #[error("Malformed pod: payload is not valid UTF-8")]
    InvalidEncoding,

    #[error("Malformed pod: {0:?} contains a wire delimiter")]
    ReservedCharacter(String),
}

// Cloneable so the same failure can be published as an event and returned.
#[derive(Error, Debug, Clone)]
pub enum DiscoveryError {
    #[error("Socket error: {0}")]
    Socket(#[source] Arc<std::io::Error>),

    #[error("Failed to join multicast group {group}: {source}")]
    Membership {
        group: Ipv4Addr,
        #[source]
        source: Arc<std::io::Error>,
    },

    #[error(transparent)]
    MalformedPod(#[from] PodError),

    #[error("Discovery server is already listening")]
    AlreadyListening,

    #[error("Discovery server is not listening")]
    NotListening,

    #[error("Receive loop stopped before the echo arrived")]
    EchoAborted,
}

impl From<std::io::Error> for DiscoveryError {
    fn from(err: std::io::Error) -> Self {
        DiscoveryError::Socket(Arc::new(err))
    }
}
