use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::model::{
    JsonObject, LoggingLevel, LoggingMessageNotificationParam, ProgressNotificationParam,
    ProgressToken, RequestId, ServerJsonRpcMessage, method,
};

mod server;
pub use server::*;

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("endpoint already closed")]
    AlreadyClosed,
    #[error("transport closed")]
    TransportClosed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where server-to-client messages of a session go.
///
/// The streamable HTTP transport implements this on top of its event store;
/// every message handed to [`OutboundSink::send`] becomes one event.
pub trait OutboundSink: Send + Sync + 'static {
    fn send(&self, message: ServerJsonRpcMessage) -> BoxFuture<'_, Result<(), EndpointError>>;
}

/// A sink that accepts and drops everything, for endpoints without a client stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedSink;

impl OutboundSink for DetachedSink {
    fn send(&self, message: ServerJsonRpcMessage) -> BoxFuture<'_, Result<(), EndpointError>> {
        tracing::trace!(?message, "dropping message for detached peer");
        Box::pin(futures::future::ready(Ok(())))
    }
}

/// Minimum severity the client asked for via `logging/setLevel`.
#[derive(Debug, Clone, Default)]
pub struct LogLevelFilter(Arc<AtomicU8>);

impl LogLevelFilter {
    pub fn set(&self, level: LoggingLevel) {
        self.0.store(level as u8, Ordering::Relaxed);
    }
    pub fn enabled(&self, level: LoggingLevel) -> bool {
        level as u8 >= self.0.load(Ordering::Relaxed)
    }
}

/// The client side of a session, as seen by a handler.
#[derive(Clone)]
pub struct Peer {
    sink: Arc<dyn OutboundSink>,
    log_filter: LogLevelFilter,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("log_filter", &self.log_filter)
            .finish_non_exhaustive()
    }
}

macro_rules! method {
    (peer_not $method:ident $Method:ident($Param: ident)) => {
        pub async fn $method(&self, params: $Param) -> Result<(), EndpointError> {
            self.send_notification(method::$Method, params).await
        }
    };
}

impl Peer {
    pub fn new(sink: Arc<dyn OutboundSink>, log_filter: LogLevelFilter) -> Self {
        Self { sink, log_filter }
    }

    pub fn detached() -> Self {
        Self::new(Arc::new(DetachedSink), LogLevelFilter::default())
    }

    pub async fn send_notification<P: serde::Serialize>(
        &self,
        method: &str,
        params: P,
    ) -> Result<(), EndpointError> {
        let params = match serde_json::to_value(params)? {
            serde_json::Value::Object(object) => Some(object),
            serde_json::Value::Null => None,
            other => Some(JsonObject::from_iter([("value".to_owned(), other)])),
        };
        self.sink
            .send(ServerJsonRpcMessage::notification(method, params))
            .await
    }

    /// Sends a `notifications/message`, unless it is below the level the client asked for.
    pub async fn notify_logging_message(
        &self,
        params: LoggingMessageNotificationParam,
    ) -> Result<(), EndpointError> {
        if !self.log_filter.enabled(params.level) {
            return Ok(());
        }
        self.send_notification(method::LOGGING_MESSAGE_NOTIFICATION, params)
            .await
    }

    method!(peer_not notify_progress PROGRESS_NOTIFICATION(ProgressNotificationParam));
}

/// Execution context handed to every tool, resource and prompt handler.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// JSON-RPC id of the request being served.
    pub id: RequestId,
    /// Fresh per invocation, unlike `id` which the client chooses.
    pub call_id: uuid::Uuid,
    pub received_at: DateTime<Utc>,
    /// Cancelled on `notifications/cancelled`, client disconnect or session teardown.
    pub ct: CancellationToken,
    pub progress_token: Option<ProgressToken>,
    pub peer: Peer,
}

impl RequestContext {
    pub fn new(id: RequestId, peer: Peer) -> Self {
        Self {
            id,
            call_id: uuid::Uuid::new_v4(),
            received_at: Utc::now(),
            ct: CancellationToken::new(),
            progress_token: None,
            peer,
        }
    }

    /// Report progress if the client attached a progress token to the request.
    pub async fn notify_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) -> Result<(), EndpointError> {
        let Some(progress_token) = self.progress_token.clone() else {
            return Ok(());
        };
        self.peer
            .notify_progress(ProgressNotificationParam {
                progress_token,
                progress,
                total,
                message,
            })
            .await
    }
}
