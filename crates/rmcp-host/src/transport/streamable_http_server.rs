//! Streamable HTTP Server Transport Module
//!
//! One endpoint path serves the whole MCP streamable HTTP transport:
//!
//! - `POST` carries client messages. A lone `initialize` without a
//!   `mcp-session-id` header opens a session; everything else must name one.
//! - `GET` opens (or, with `Last-Event-ID`, resumes) the session's
//!   server-to-client SSE stream.
//! - `DELETE` ends the session.
//!
//! - [`session`] owns the session table and its lifecycle.
//! - [`event_store`] records outgoing events so streams can be resumed.
//! - [`tower`] maps the HTTP verbs onto both, as an axum router.
//!
//! ```ignore
//! use rmcp_host::transport::streamable_http_server::{StreamableHttpService, StreamableHttpServerConfig};
//! let service = StreamableHttpService::new(registry, server_info, StreamableHttpServerConfig::default());
//! let router = service.router("/mcp");
//! ```

pub mod event_store;
pub mod session;
pub mod tower;

use std::time::Duration;

pub use event_store::{EventId, EventStore, EventStoreError, StoredEvent, StreamId};
pub use session::{Session, SessionError, SessionManager, SessionTransport, StreamGuard};
pub use tower::StreamableHttpService;

pub use super::common::server_side_http::{ServerSseMessage, SessionId};

/// Configuration for the streamable HTTP server
#[derive(Debug, Clone)]
pub struct StreamableHttpServerConfig {
    /// The ping message duration for SSE connections.
    pub sse_keep_alive: Option<Duration>,
    /// Answer POSTs with `application/json` even when the client accepts SSE.
    pub json_response: bool,
    /// Close sessions that saw no request and had no open stream for this long.
    pub session_idle_timeout: Option<Duration>,
}

impl Default for StreamableHttpServerConfig {
    fn default() -> Self {
        Self {
            sse_keep_alive: Some(Duration::from_secs(15)),
            json_response: false,
            session_idle_timeout: Some(Duration::from_secs(300)),
        }
    }
}
