//! Service bookkeeping for the mesh
//!
//! This library provides:
//! - The `Node` control-channel contract and a TCP implementation
//! - `RemoteService`, pairing a control channel with a proxy handler
//! - `ServiceRegistry` with its aggregate connectivity signal
//! - `AutoWirer`, which connects services as discovery reports peers

pub mod error;
pub mod node;
pub mod registry;
pub mod remote_service;
pub mod wiring;

pub use error::{CoreError, Result};
pub use node::{Node, TcpNode};
pub use registry::{Connectivity, ServiceRegistry};
pub use remote_service::RemoteService;
pub use wiring::{AutoWirer, NodeFactory, PeerSnapshot, DEFAULT_CONNECT_TIMEOUT};
