//! # Transport
//!
//! How MCP messages reach the host. The only transport is streamable HTTP:
//!
//! | module | role |
//! | --- | --- |
//! | [`streamable_http_server`] | sessions, event store and the axum endpoint |
//! | [`http_server`] | listener, CORS, `/health` and `/ping`, graceful shutdown |
//!
//! ```ignore
//! let service = StreamableHttpService::new(registry, ServerInfo::default(), Default::default());
//! let server = HttpServer::serve_with_config(HttpServerConfig::new([127, 0, 0, 1], 8000), service).await?;
//! server.waiting().await?;
//! ```

pub mod common;

#[cfg(feature = "transport-streamable-http-server")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-streamable-http-server")))]
pub mod streamable_http_server;
#[cfg(feature = "transport-streamable-http-server")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-streamable-http-server")))]
pub use streamable_http_server::{StreamableHttpServerConfig, StreamableHttpService};

#[cfg(feature = "transport-streamable-http-server")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-streamable-http-server")))]
pub mod http_server;
#[cfg(feature = "transport-streamable-http-server")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport-streamable-http-server")))]
pub use http_server::{HttpServer, HttpServerConfig};
