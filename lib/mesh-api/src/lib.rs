//! Shared types for the mesh sidecar
//!
//! This library defines:
//! - MeshConfig: the YAML configuration document for a mesh node
//! - The attribute vocabulary peers advertise in discovery gossip

pub mod attributes;
pub mod config;

pub use config::{
    DiscoveryConfig, HttpConfig, LogFormat, MeshConfig, ProxyConfig, ServiceDefinition,
};
