use std::{
    future::Future,
    io,
    panic::AssertUnwindSafe,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{MethodRouter, post},
};
use bytes::Bytes;
use futures::{FutureExt, Stream, StreamExt, stream::BoxStream};
use tracing::Instrument;

use super::{
    StreamableHttpServerConfig,
    event_store::{EventId, STANDALONE_STREAM_ID, StoredEvent, StreamId},
    session::{Session, SessionManager, StreamGuard},
};
use crate::{
    error::HostError,
    handler::server::Registry,
    model::{ErrorData, JsonRpcMessage, JsonRpcPayload, ServerInfo, ServerJsonRpcMessage},
    transport::common::{
        http_header::{EVENT_STREAM_MIME_TYPE, HEADER_LAST_EVENT_ID, HEADER_SESSION_ID},
        server_side_http::{ServerSseMessage, accepts},
    },
};

/// The streamable HTTP transport as an axum service.
///
/// Cloning is cheap; all clones share one [`SessionManager`].
///
/// A `GET` without `last-event-id` starts at the standalone stream's latest
/// event. Notifications stored before that, such as progress or log messages
/// sent during JSON-mode POSTs, are only delivered to a client that resumes
/// with a cursor, `0` replaying the whole standalone stream.
#[derive(Debug, Clone)]
pub struct StreamableHttpService {
    config: StreamableHttpServerConfig,
    manager: Arc<SessionManager>,
}

impl StreamableHttpService {
    pub fn new(registry: Arc<Registry>, info: ServerInfo, config: StreamableHttpServerConfig) -> Self {
        let manager = Arc::new(SessionManager::new(
            Arc::new(info),
            registry,
            config.session_idle_timeout,
        ));
        Self { config, manager }
    }

    pub fn config(&self) -> &StreamableHttpServerConfig {
        &self.config
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// POST, GET and DELETE on one path; any other method is a 404.
    pub fn method_router<S>(&self) -> MethodRouter<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        post(handle_post)
            .get(handle_get)
            .delete(handle_delete)
            .fallback(not_found)
            .with_state(self.clone())
    }

    pub fn router(&self, path: &str) -> Router {
        Router::new()
            .route(path, self.method_router())
            .fallback(not_found)
    }

    /// Close every session. Called once on server shutdown.
    pub async fn shutdown(&self) {
        tracing::info!("streamable http service shutting down");
        self.manager.close_all().await;
    }

    async fn post(&self, headers: &HeaderMap, body: Bytes) -> Result<Response, HostError> {
        let payload = match JsonRpcPayload::from_slice(&body) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::warn!(%error, "rejecting malformed POST body");
                return Ok(error_response(StatusCode::BAD_REQUEST, error));
            }
        };
        let wants_sse =
            !self.config.json_response && accepts_header(headers, EVENT_STREAM_MIME_TYPE);
        let session = match header_str(headers, HEADER_SESSION_ID) {
            Some(id) => match self.manager.get(id).await {
                Ok(session) => session,
                Err(error) => {
                    tracing::warn!(session_id = id, %error, "rejecting POST");
                    return Ok(no_valid_session());
                }
            },
            None if payload.is_initialize_request() => {
                return self.initialize(payload, wants_sse).await;
            }
            None => {
                tracing::warn!("rejecting POST without session id");
                return Ok(no_valid_session());
            }
        };
        tracing::debug!(session_id = %session.id(), batch = payload.is_batch(), wants_sse, "POST");
        self.respond(session, payload, wants_sse).await
    }

    async fn initialize(
        &self,
        payload: JsonRpcPayload,
        wants_sse: bool,
    ) -> Result<Response, HostError> {
        let session = self.manager.create_session().await;
        let sink = session.transport().standalone_sink();
        let responses = session.handle_messages(payload.into_messages(), sink).await;
        if let Some(JsonRpcMessage::Error(failure)) = responses.first() {
            tracing::warn!(
                session_id = %session.id(),
                error = %failure.error,
                "initialize failed, discarding session"
            );
            if let Err(error) = self.manager.close_session(session.id()).await {
                tracing::debug!(%error, "session already gone");
            }
            return Ok((StatusCode::BAD_REQUEST, Json(failure)).into_response());
        }
        let mut response = if wants_sse {
            self.recorded_sse(&session, responses).await?
        } else {
            json_responses(false, responses)
        };
        response
            .headers_mut()
            .insert(HEADER_SESSION_ID, HeaderValue::from_str(session.id())?);
        Ok(response)
    }

    async fn respond(
        &self,
        session: Arc<Session>,
        payload: JsonRpcPayload,
        wants_sse: bool,
    ) -> Result<Response, HostError> {
        let is_batch = payload.is_batch();
        let messages = payload.into_messages();
        let transport = session.transport().clone();
        if !messages
            .iter()
            .any(|message| matches!(message, JsonRpcMessage::Request(_)))
        {
            session
                .handle_messages(messages, transport.standalone_sink())
                .await;
            return Ok(StatusCode::ACCEPTED.into_response());
        }
        if !wants_sse {
            // dropping this future (client gone) cancels the requests
            let responses = session
                .handle_messages(messages, transport.standalone_sink())
                .await;
            return Ok(json_responses(is_batch, responses));
        }

        let store = transport.store().clone();
        let stream_id = store.open_stream().await;
        let events = store
            .subscribe(&stream_id, 0, transport.ct().child_token())
            .await?;
        let guard = transport.attach();
        let span = tracing::debug_span!(
            "request-stream",
            session_id = %session.id(),
            stream_id = %stream_id
        );
        tokio::spawn(
            async move {
                let sink = transport.sink(stream_id.clone());
                let responses = session.handle_messages(messages, sink).await;
                for response in responses {
                    if let Err(error) = store.append(&stream_id, response).await {
                        tracing::warn!(%error, "failed to record response");
                    }
                }
                if let Err(error) = store.complete(&stream_id).await {
                    tracing::debug!(%error, "request stream dropped before completion");
                }
            }
            .instrument(span),
        );
        Ok(self.sse_response(events, guard))
    }

    /// Record already computed responses on a fresh request stream and send it.
    async fn recorded_sse(
        &self,
        session: &Session,
        responses: Vec<ServerJsonRpcMessage>,
    ) -> Result<Response, HostError> {
        let transport = session.transport();
        let store = transport.store();
        let stream_id = store.open_stream().await;
        for response in responses {
            store.append(&stream_id, response).await?;
        }
        store.complete(&stream_id).await?;
        let events = store
            .subscribe(&stream_id, 0, transport.ct().child_token())
            .await?;
        Ok(self.sse_response(events, transport.attach()))
    }

    async fn get(&self, headers: &HeaderMap) -> Result<Response, HostError> {
        let Some(id) = header_str(headers, HEADER_SESSION_ID) else {
            tracing::warn!("rejecting GET without session id");
            return Ok(bad_request("Bad Request: No sessionId"));
        };
        let session = match self.manager.get(id).await {
            Ok(session) => session,
            Err(error) => {
                tracing::warn!(session_id = id, %error, "rejecting GET");
                return Ok(bad_request("Bad Request: No active transport"));
            }
        };
        if !accepts_header(headers, EVENT_STREAM_MIME_TYPE) {
            return Ok(error_response(
                StatusCode::NOT_ACCEPTABLE,
                ErrorData::bad_request(
                    "Not Acceptable: Client must accept text/event-stream",
                    None,
                ),
            ));
        }
        let transport = session.transport();
        let store = transport.store();
        let (stream_id, after) = match header_str(headers, HEADER_LAST_EVENT_ID) {
            Some(last_event_id) => match store.resolve(last_event_id).await {
                Ok(EventId { stream_id, seq }) => {
                    tracing::debug!(session_id = id, event_id = last_event_id, "resuming stream");
                    (stream_id, seq)
                }
                Err(error) => {
                    tracing::warn!(
                        session_id = id,
                        event_id = last_event_id,
                        %error,
                        "rejecting resume cursor"
                    );
                    return Ok(bad_request(format!("Bad Request: {error}")));
                }
            },
            None => {
                let stream_id = StreamId::from(STANDALONE_STREAM_ID);
                let latest = store.latest(&stream_id).await?;
                tracing::debug!(session_id = id, "opening standalone stream");
                (stream_id, latest)
            }
        };
        let events = store
            .subscribe(&stream_id, after, transport.ct().child_token())
            .await?;
        Ok(self.sse_response(events, transport.attach()))
    }

    async fn delete(&self, headers: &HeaderMap) -> Result<Response, HostError> {
        let Some(id) = header_str(headers, HEADER_SESSION_ID) else {
            return Ok(bad_request("Bad Request: No sessionId"));
        };
        match self.manager.close_session(id).await {
            Ok(()) => Ok(StatusCode::OK.into_response()),
            Err(error) => {
                tracing::warn!(session_id = id, %error, "rejecting DELETE");
                Ok(bad_request("Bad Request: No active transport"))
            }
        }
    }

    fn sse_response(
        &self,
        events: impl Stream<Item = StoredEvent> + Send + 'static,
        guard: StreamGuard,
    ) -> Response {
        let stream = GuardedStream {
            inner: events
                .map(|event| sse_event(ServerSseMessage::from(event)))
                .boxed(),
            _guard: guard,
        };
        let sse = Sse::new(stream);
        match self.config.sse_keep_alive {
            Some(interval) => sse
                .keep_alive(KeepAlive::new().interval(interval))
                .into_response(),
            None => sse.into_response(),
        }
    }
}

/// Keeps the session's stream count up while the response body is alive.
struct GuardedStream {
    inner: BoxStream<'static, Result<Event, io::Error>>,
    _guard: StreamGuard,
}

impl Stream for GuardedStream {
    type Item = Result<Event, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

fn sse_event(message: ServerSseMessage) -> Result<Event, io::Error> {
    let data = serde_json::to_string(message.message.as_ref())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let event = Event::default().event("message").data(data);
    Ok(match message.event_id {
        Some(id) => event.id(id),
        None => event,
    })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn accepts_header(headers: &HeaderMap, mime_type: &str) -> bool {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| accepts(value, mime_type))
}

fn json_responses(is_batch: bool, mut responses: Vec<ServerJsonRpcMessage>) -> Response {
    if !is_batch && responses.len() == 1 {
        if let Some(response) = responses.pop() {
            return Json(response).into_response();
        }
    }
    Json(responses).into_response()
}

fn error_response(status: StatusCode, error: ErrorData) -> Response {
    (status, Json(ServerJsonRpcMessage::error(error, None))).into_response()
}

fn bad_request(message: impl Into<std::borrow::Cow<'static, str>>) -> Response {
    error_response(StatusCode::BAD_REQUEST, ErrorData::bad_request(message, None))
}

fn no_valid_session() -> Response {
    bad_request("Bad Request: No valid session ID provided")
}

fn internal_server_error() -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorData::internal_error("Internal Server Error", None),
    )
}

/// Turn errors and panics of a verb handler into the generic 500 envelope.
async fn guarded(
    verb: &'static str,
    future: impl Future<Output = Result<Response, HostError>>,
) -> Response {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(response)) => response,
        Ok(Err(error)) => {
            tracing::error!(verb, %error, "failed to handle request");
            internal_server_error()
        }
        Err(_) => {
            tracing::error!(verb, "request handler panicked");
            internal_server_error()
        }
    }
}

async fn handle_post(
    State(service): State<StreamableHttpService>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    guarded("POST", service.post(&headers, body)).await
}

async fn handle_get(State(service): State<StreamableHttpService>, headers: HeaderMap) -> Response {
    guarded("GET", service.get(&headers)).await
}

async fn handle_delete(
    State(service): State<StreamableHttpService>,
    headers: HeaderMap,
) -> Response {
    guarded("DELETE", service.delete(&headers)).await
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NumberOrString;

    #[test]
    fn test_single_response_is_not_wrapped() {
        let response = JsonRpcMessage::response(serde_json::json!({}), NumberOrString::Number(1));
        assert_eq!(
            json_responses(false, vec![response.clone()]).status(),
            StatusCode::OK
        );
        assert_eq!(json_responses(true, vec![response]).status(), StatusCode::OK);
    }

    #[test]
    fn test_sse_event_carries_id() {
        let message = ServerSseMessage {
            event_id: Some("3/1".into()),
            message: Arc::new(JsonRpcMessage::notification("notifications/message", None)),
        };
        assert!(sse_event(message).is_ok());
    }
}
