use hyper::Response;
use thiserror::Error;

use crate::http::{service_unavailable_response, ProxyBody};

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("No backend linked")]
    Unlinked,

    #[error("Invalid backend target: {0}")]
    InvalidTarget(String),

    #[error("Backend request failed: {0}")]
    Backend(#[from] hyper_util::client::legacy::Error),
}

impl ProxyError {
    /// The response delivered to the original caller
    pub fn to_response(&self) -> Response<ProxyBody> {
        match self {
            ProxyError::Unlinked => service_unavailable_response("no backend linked"),
            ProxyError::InvalidTarget(_) | ProxyError::Backend(_) => {
                service_unavailable_response("backend unreachable")
            }
        }
    }
}
