//! Session management for the Streamable HTTP transport.
//!
//! A *session* groups the logically related interactions between a single MCP
//! client and the server, starting from the `initialize` handshake. The server
//! assigns each session a unique [`SessionId`] (returned to the client via the
//! `Mcp-Session-Id` response header) and the client includes that ID on every
//! subsequent request.
//!
//! Every session binds one [`ServerEndpoint`] to one [`SessionTransport`].
//! The session is torn down exactly once, by whichever comes first: an HTTP
//! DELETE, the transport closing (idle reaping, server shutdown) or
//! [`SessionManager::close_all`].

use std::{
    collections::HashMap,
    sync::{
        Arc, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::{sync::RwLock, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::event_store::{EventStore, EventStoreError, STANDALONE_STREAM_ID, StreamId};
pub use crate::transport::common::server_side_http::{ServerSseMessage, SessionId};
use crate::{
    handler::server::Registry,
    model::{ClientJsonRpcMessage, JsonRpcMessage, ServerInfo, ServerJsonRpcMessage},
    service::{EndpointError, OutboundSink, ServerEndpoint},
    transport::common::server_side_http::session_id,
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session `{0}` not found")]
    NotFound(SessionId),
    #[error("session `{0}` is closing")]
    Closing(SessionId),
}

/// Appends server-to-client messages to one stream of a session's event store.
///
/// Messages for a request stream that has already completed fall back to the
/// standalone stream.
#[derive(Debug, Clone)]
struct EventSink {
    store: Arc<EventStore>,
    stream_id: StreamId,
}

impl OutboundSink for EventSink {
    fn send(&self, message: ServerJsonRpcMessage) -> BoxFuture<'_, Result<(), EndpointError>> {
        Box::pin(async move {
            let result = match self.store.append(&self.stream_id, message.clone()).await {
                Err(EventStoreError::StreamCompleted(_))
                    if &*self.stream_id != STANDALONE_STREAM_ID =>
                {
                    self.store.append(STANDALONE_STREAM_ID, message).await
                }
                result => result,
            };
            result.map(drop).map_err(|error| {
                tracing::debug!(stream_id = %self.stream_id, %error, "dropping outbound message");
                EndpointError::TransportClosed
            })
        })
    }
}

/// The HTTP side of a session: its event store, liveness and activity.
#[derive(Debug)]
pub struct SessionTransport {
    store: Arc<EventStore>,
    ct: CancellationToken,
    last_activity: std::sync::Mutex<Instant>,
    attached: AtomicUsize,
}

impl SessionTransport {
    pub fn new(ct: CancellationToken) -> Self {
        Self {
            store: Arc::new(EventStore::new()),
            ct,
            last_activity: std::sync::Mutex::new(Instant::now()),
            attached: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    /// Cancelled when the transport closes.
    pub fn ct(&self) -> &CancellationToken {
        &self.ct
    }

    pub fn close(&self) {
        self.ct.cancel();
    }

    pub async fn closed(&self) {
        self.ct.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.ct.is_cancelled()
    }

    pub fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of SSE responses and POST bodies currently being served.
    pub fn attached_streams(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    /// Hold the session busy until the guard drops; the idle reaper skips
    /// busy sessions.
    pub fn attach(self: &Arc<Self>) -> StreamGuard {
        self.attached.fetch_add(1, Ordering::AcqRel);
        self.touch();
        StreamGuard {
            transport: self.clone(),
        }
    }

    pub fn standalone_sink(&self) -> Arc<dyn OutboundSink> {
        self.sink(STANDALONE_STREAM_ID.into())
    }

    pub fn sink(&self, stream_id: StreamId) -> Arc<dyn OutboundSink> {
        Arc::new(EventSink {
            store: self.store.clone(),
            stream_id,
        })
    }
}

#[derive(Debug)]
pub struct StreamGuard {
    transport: Arc<SessionTransport>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.transport.attached.fetch_sub(1, Ordering::AcqRel);
        self.transport.touch();
    }
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    endpoint: Arc<ServerEndpoint>,
    transport: Arc<SessionTransport>,
    closing: AtomicBool,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn endpoint(&self) -> &Arc<ServerEndpoint> {
        &self.endpoint
    }

    pub fn transport(&self) -> &Arc<SessionTransport> {
        &self.transport
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Claim the teardown. Only the first caller gets `true`.
    fn begin_close(&self) -> bool {
        self.closing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Feed the messages of one POST body to the endpoint.
    ///
    /// Requests are served concurrently; their responses come back in request
    /// order. Notifications are handled inline and client responses are
    /// ignored, neither produces output. The session counts as busy until
    /// every response is ready.
    pub async fn handle_messages(
        &self,
        messages: Vec<ClientJsonRpcMessage>,
        sink: Arc<dyn OutboundSink>,
    ) -> Vec<ServerJsonRpcMessage> {
        let _busy = self.transport.attach();
        let mut requests = Vec::new();
        for message in messages {
            match message {
                JsonRpcMessage::Request(request) => {
                    requests.push(self.endpoint.handle_request(request, sink.clone()));
                }
                JsonRpcMessage::Notification(notification) => {
                    self.endpoint.handle_notification(notification);
                }
                JsonRpcMessage::Response(_) | JsonRpcMessage::Error(_) => {
                    tracing::debug!(session_id = %self.id, "ignoring client response");
                }
            }
        }
        futures::future::join_all(requests).await
    }
}

/// The authoritative session table.
#[derive(Debug)]
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    info: Arc<ServerInfo>,
    registry: Arc<Registry>,
    idle_timeout: Option<Duration>,
    closed: AtomicU64,
    ct: CancellationToken,
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.ct.cancel();
    }
}

impl SessionManager {
    pub fn new(
        info: Arc<ServerInfo>,
        registry: Arc<Registry>,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            sessions: RwLock::default(),
            info,
            registry,
            idle_timeout,
            closed: AtomicU64::new(0),
            ct: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Create a session with a fresh id and a new endpoint and transport.
    pub async fn create_session(self: &Arc<Self>) -> Arc<Session> {
        let id = session_id();
        let session = Arc::new(Session {
            id: id.clone(),
            endpoint: Arc::new(ServerEndpoint::new(
                self.info.clone(),
                self.registry.clone(),
            )),
            transport: Arc::new(SessionTransport::new(self.ct.child_token())),
            closing: AtomicBool::new(false),
            created_at: Utc::now(),
        });
        self.sessions.write().await.insert(id.clone(), session.clone());
        tokio::spawn(
            watch_transport(Arc::downgrade(self), session.clone(), self.idle_timeout)
                .instrument(tracing::info_span!("session", session_id = %id)),
        );
        tracing::info!(session_id = %id, "session created");
        session
    }

    /// Look up a live session.
    pub async fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        let session = self
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.into()))?;
        if session.is_closing() {
            return Err(SessionError::Closing(session.id.clone()));
        }
        Ok(session)
    }

    pub async fn has_session(&self, id: &str) -> bool {
        self.get(id).await.is_ok()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// How many sessions have been torn down so far.
    pub fn closed_sessions(&self) -> u64 {
        self.closed.load(Ordering::Acquire)
    }

    /// Close a session on client request (HTTP DELETE).
    pub async fn close_session(&self, id: &str) -> Result<(), SessionError> {
        let session = self.get(id).await?;
        if !session.begin_close() {
            return Err(SessionError::Closing(session.id.clone()));
        }
        self.teardown(&session).await;
        Ok(())
    }

    /// Close every session, logging rather than failing on individual errors.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.read().await.values().cloned().collect();
        let mut count = 0usize;
        for session in sessions {
            if session.begin_close() {
                self.teardown(&session).await;
                count += 1;
            }
        }
        tracing::info!(sessions = count, "all sessions closed");
    }

    async fn on_transport_closed(&self, session: &Session) {
        if session.begin_close() {
            tracing::debug!(session_id = %session.id, "transport closed");
            self.teardown(session).await;
        }
    }

    async fn teardown(&self, session: &Session) {
        session.transport.close();
        if let Err(error) = session.endpoint.close() {
            tracing::error!(session_id = %session.id, %error, "failed to close protocol endpoint");
        }
        self.sessions.write().await.remove(&session.id);
        session.transport.store.clear().await;
        self.closed.fetch_add(1, Ordering::AcqRel);
        tracing::info!(session_id = %session.id, "session closed");
    }
}

async fn watch_transport(
    manager: Weak<SessionManager>,
    session: Arc<Session>,
    idle_timeout: Option<Duration>,
) {
    let transport = session.transport.clone();
    match idle_timeout {
        Some(timeout) => loop {
            let deadline = transport.last_activity() + timeout;
            tokio::select! {
                _ = transport.closed() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    if transport.attached_streams() > 0 {
                        transport.touch();
                    } else if transport.last_activity() + timeout <= Instant::now() {
                        tracing::info!(?timeout, "session idle, closing transport");
                        transport.close();
                        break;
                    }
                }
            }
        },
        None => transport.closed().await,
    }
    match manager.upgrade() {
        Some(manager) => manager.on_transport_closed(&session).await,
        None => {
            if session.begin_close() {
                if let Err(error) = session.endpoint.close() {
                    tracing::error!(session_id = %session.id, %error, "failed to close protocol endpoint");
                }
            }
        }
    }
}
