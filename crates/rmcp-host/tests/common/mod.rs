#![allow(dead_code)]

pub mod calculator;
#[cfg(feature = "transport-streamable-http-server")]
pub mod http;

use std::sync::Arc;

use rmcp_host::{Registry, model::NumberOrString, service::Peer, RequestContext};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub fn init() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".to_string().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

pub fn calculator_registry(calculator: &calculator::Calculator) -> Arc<Registry> {
    let registry = Registry::new();
    registry
        .register(calculator)
        .expect("calculator registers cleanly");
    Arc::new(registry)
}

pub fn context(id: i64) -> RequestContext {
    RequestContext::new(NumberOrString::Number(id), Peer::detached())
}
