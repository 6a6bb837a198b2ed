use std::fmt::Display;

pub use crate::model::ErrorData;
use crate::{handler::server::RegistryError, service::EndpointError};

impl Display for ErrorData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.0, self.message)?;
        if let Some(data) = &self.data {
            write!(f, "({})", data)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorData {}

/// This is an unified error type for the errors could be returned by the host.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),
    #[cfg(feature = "transport-streamable-http-server")]
    #[error("Session error: {0}")]
    Session(#[from] crate::transport::streamable_http_server::SessionError),
    #[cfg(feature = "transport-streamable-http-server")]
    #[error("Event store error: {0}")]
    EventStore(#[from] crate::transport::streamable_http_server::EventStoreError),
    #[cfg(feature = "transport-streamable-http-server")]
    #[error("Invalid header value: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Runtime error: {0}")]
    Runtime(#[from] tokio::task::JoinError),
}
