//! Domain Errors

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("failed to read request: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("client stayed idle for more than {0:?}")]
    IdleTimeout(Duration),
}

#[derive(Debug, Error)]
pub enum ResponseError {
    #[error("a response was already sent on this connection")]
    AlreadySent,
    #[error("failed to load asset `{id}`: {source}")]
    Asset {
        id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize response body: {0}")]
    Serialize(String),
}

impl RequestError {
    /// Transport level failures leave the connection unusable. The worker closes it
    /// without attempting a response.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io(_) | Self::IdleTimeout(_))
    }
}
