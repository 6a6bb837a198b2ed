#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]
#![doc = include_str!("../README.md")]

mod error;
pub use error::{ErrorData, HostError};

/// Basic data types in MCP specification
pub mod model;
pub mod service;
pub use service::{Peer, RequestContext, ServerEndpoint};

pub mod handler;
pub use handler::server::{
    CapabilityProvider, Dispatcher, PromptRoute, RegistrationPolicy, Registry, ResourceRoute,
    ToolRoute,
};

pub mod transport;

// re-export
pub use schemars;
pub use serde;
pub use serde_json;
