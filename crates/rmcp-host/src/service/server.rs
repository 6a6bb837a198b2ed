use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{EndpointError, LogLevelFilter, OutboundSink, Peer, RequestContext};
use crate::{
    handler::server::{Dispatcher, Registry},
    model::{
        CancelledNotificationParam, EmptyResult, ErrorData, Implementation, InitializeRequestParam,
        InitializeResult, JsonRpcNotification, JsonRpcRequest, ProtocolVersion, RequestId,
        ServerCapabilities, ServerInfo, ServerJsonRpcMessage, SetLevelRequestParam, method,
    },
};

#[derive(Debug, Clone, PartialEq)]
pub enum EndpointState {
    AwaitingInitialize,
    Initialized {
        protocol_version: ProtocolVersion,
        client_info: Implementation,
    },
    Closed,
}

fn empty_result() -> Result<Value, ErrorData> {
    serde_json::to_value(EmptyResult {})
        .map_err(|e| ErrorData::internal_error(format!("fail to serialize result: {e}"), None))
}

type InFlight = Mutex<HashMap<RequestId, (u64, CancellationToken)>>;

/// Removes a request from the in-flight table and cancels its token when
/// the request future finishes or is dropped.
struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
    id: RequestId,
    generation: u64,
    ct: CancellationToken,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if matches!(in_flight.get(&self.id), Some((generation, _)) if *generation == self.generation)
        {
            in_flight.remove(&self.id);
        }
        self.ct.cancel();
    }
}

/// The per-session MCP protocol state machine.
///
/// It negotiates `initialize`, answers `ping` and `logging/setLevel`, tracks
/// in-flight requests for cancellation and hands capability requests to the
/// [`Dispatcher`]. Every session owns one endpoint; the [`Registry`] behind it
/// is shared.
#[derive(Debug)]
pub struct ServerEndpoint {
    info: Arc<ServerInfo>,
    dispatcher: Dispatcher,
    state: Mutex<EndpointState>,
    log_filter: LogLevelFilter,
    in_flight: InFlight,
    next_generation: AtomicU64,
    ct: CancellationToken,
}

impl ServerEndpoint {
    pub fn new(info: Arc<ServerInfo>, registry: Arc<Registry>) -> Self {
        Self {
            info,
            dispatcher: Dispatcher::new(registry),
            state: Mutex::new(EndpointState::AwaitingInitialize),
            log_filter: LogLevelFilter::default(),
            in_flight: Mutex::default(),
            next_generation: AtomicU64::new(0),
            ct: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> EndpointState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.state(), EndpointState::Initialized { .. })
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state(), EndpointState::Closed)
    }

    pub fn peer(&self, sink: Arc<dyn OutboundSink>) -> Peer {
        Peer::new(sink, self.log_filter.clone())
    }

    /// Number of requests currently being served.
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Close the endpoint, cancelling every in-flight request.
    pub fn close(&self) -> Result<(), EndpointError> {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == EndpointState::Closed {
                return Err(EndpointError::AlreadyClosed);
            }
            *state = EndpointState::Closed;
        }
        self.ct.cancel();
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }

    fn track(&self, id: RequestId) -> InFlightGuard<'_> {
        let ct = self.ct.child_token();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), (generation, ct.clone()));
        if previous.is_some() {
            tracing::warn!(request_id = %id, "request id reused while still in flight");
        }
        InFlightGuard {
            in_flight: &self.in_flight,
            id,
            generation,
            ct,
        }
    }

    /// Serve one request and produce its response (or error) message.
    ///
    /// Server-to-client messages produced while serving go to `sink`.
    pub async fn handle_request(
        &self,
        request: JsonRpcRequest,
        sink: Arc<dyn OutboundSink>,
    ) -> ServerJsonRpcMessage {
        let id = request.id.clone();
        if self.is_closed() {
            return ServerJsonRpcMessage::error(
                ErrorData::internal_error("endpoint is closed", None),
                Some(id),
            );
        }
        let guard = self.track(id.clone());
        let context = RequestContext {
            id: id.clone(),
            call_id: uuid::Uuid::new_v4(),
            received_at: chrono::Utc::now(),
            ct: guard.ct.clone(),
            progress_token: request.progress_token(),
            peer: self.peer(sink),
        };
        let ct = guard.ct.clone();
        let result = tokio::select! {
            biased;
            _ = ct.cancelled() => {
                tracing::debug!(request_id = %id, "request cancelled");
                Err(ErrorData::request_cancelled())
            }
            result = self.serve(&request, context) => result,
        };
        drop(guard);
        match result {
            Ok(value) => ServerJsonRpcMessage::response(value, id),
            Err(error) => ServerJsonRpcMessage::error(error, Some(id)),
        }
    }

    async fn serve(
        &self,
        request: &JsonRpcRequest,
        context: RequestContext,
    ) -> Result<Value, ErrorData> {
        match request.method.as_str() {
            method::INITIALIZE => self.initialize(request.parse_params()?),
            method::PING => empty_result(),
            method::SET_LEVEL => {
                let SetLevelRequestParam { level } = request.parse_params()?;
                tracing::debug!(?level, "client logging level set");
                self.log_filter.set(level);
                empty_result()
            }
            capability if Dispatcher::handles(capability) => {
                self.dispatcher.dispatch(request, context).await
            }
            other => Err(ErrorData::method_not_found(other)),
        }
    }

    fn initialize(&self, params: InitializeRequestParam) -> Result<Value, ErrorData> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != EndpointState::AwaitingInitialize {
            return Err(ErrorData::invalid_request(
                "Invalid Request: Server already initialized",
                None,
            ));
        }
        let protocol_version = if params.protocol_version.is_known() {
            params.protocol_version
        } else {
            ProtocolVersion::LATEST
        };
        tracing::info!(
            client = %params.client_info.name,
            client_version = %params.client_info.version,
            %protocol_version,
            "initialize"
        );
        let capabilities = if self.info.capabilities == ServerCapabilities::default() {
            self.dispatcher.registry().capabilities()
        } else {
            self.info.capabilities.clone()
        };
        let result = InitializeResult {
            protocol_version: protocol_version.clone(),
            capabilities,
            server_info: self.info.server_info.clone(),
            instructions: self.info.instructions.clone(),
        };
        *state = EndpointState::Initialized {
            protocol_version,
            client_info: params.client_info,
        };
        serde_json::to_value(result)
            .map_err(|e| ErrorData::internal_error(format!("fail to serialize result: {e}"), None))
    }

    pub fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            method::INITIALIZED_NOTIFICATION => {
                tracing::debug!("client initialized");
            }
            method::CANCELLED_NOTIFICATION => {
                match notification.parse_params::<CancelledNotificationParam>() {
                    Ok(CancelledNotificationParam { request_id, reason }) => {
                        let ct = self
                            .in_flight
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .get(&request_id)
                            .map(|(_, ct)| ct.clone());
                        match ct {
                            Some(ct) => {
                                tracing::info!(%request_id, ?reason, "cancelling request");
                                ct.cancel();
                            }
                            None => {
                                tracing::debug!(%request_id, "cancel for unknown request ignored")
                            }
                        }
                    }
                    Err(error) => tracing::warn!(%error, "malformed cancel notification"),
                }
            }
            other => tracing::debug!(method = other, "unhandled notification"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        handler::server::ToolRoute,
        model::{ErrorCode, JsonRpcMessage, NumberOrString, Tool},
        service::DetachedSink,
    };

    fn initialize_request(id: i64, version: &str) -> JsonRpcRequest {
        JsonRpcRequest::new(
            NumberOrString::Number(id),
            method::INITIALIZE,
            Some(crate::object!({
                "protocolVersion": version,
                "capabilities": {},
                "clientInfo": {"name": "test-client", "version": "0.0.1"}
            })),
        )
    }

    fn endpoint(registry: Registry) -> ServerEndpoint {
        ServerEndpoint::new(Arc::new(ServerInfo::default()), Arc::new(registry))
    }

    fn error_code(message: &JsonRpcMessage) -> Option<ErrorCode> {
        match message {
            JsonRpcMessage::Error(error) => Some(error.error.code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_initialize_negotiates_version() {
        let endpoint = endpoint(Registry::new());
        let response = endpoint
            .handle_request(initialize_request(1, "2025-03-26"), Arc::new(DetachedSink))
            .await;
        let JsonRpcMessage::Response(response) = response else {
            panic!("expected response, got {response:?}");
        };
        assert_eq!(response.result["protocolVersion"], "2025-03-26");
        assert!(response.result["capabilities"]["tools"].is_object());
        assert!(endpoint.is_initialized());

        let again = endpoint
            .handle_request(initialize_request(2, "2025-03-26"), Arc::new(DetachedSink))
            .await;
        assert_eq!(error_code(&again), Some(ErrorCode::INVALID_REQUEST));
    }

    #[tokio::test]
    async fn test_unknown_version_answers_latest() {
        let endpoint = endpoint(Registry::new());
        let JsonRpcMessage::Response(response) = endpoint
            .handle_request(initialize_request(1, "1999-01-01"), Arc::new(DetachedSink))
            .await
        else {
            panic!("expected response");
        };
        assert_eq!(
            response.result["protocolVersion"],
            ProtocolVersion::LATEST.as_str()
        );
    }

    #[tokio::test]
    async fn test_cancelled_notification_cancels_request() {
        let registry = Registry::new();
        registry
            .register_tool(ToolRoute::with_schema(
                Tool::new("sleep", "sleeps forever", crate::object!({"type": "object"})),
                |_, _| async move {
                    futures::future::pending::<()>().await;
                    "woke"
                },
            ))
            .unwrap();
        let endpoint = Arc::new(endpoint(registry));
        let request = JsonRpcRequest::new(
            NumberOrString::Number(9),
            method::CALL_TOOL,
            Some(crate::object!({"name": "sleep"})),
        );
        let task = tokio::spawn({
            let endpoint = endpoint.clone();
            async move { endpoint.handle_request(request, Arc::new(DetachedSink)).await }
        });
        while endpoint.in_flight() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        endpoint.handle_notification(JsonRpcNotification::new(
            method::CANCELLED_NOTIFICATION,
            Some(crate::object!({"requestId": 9, "reason": "user abort"})),
        ));
        let response = task.await.unwrap();
        assert_eq!(error_code(&response), Some(ErrorCode::REQUEST_CANCELLED));
        assert_eq!(endpoint.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_close_is_exactly_once() {
        let endpoint = endpoint(Registry::new());
        endpoint.close().unwrap();
        assert!(matches!(endpoint.close(), Err(EndpointError::AlreadyClosed)));
        let response = endpoint
            .handle_request(initialize_request(1, "2025-06-18"), Arc::new(DetachedSink))
            .await;
        assert_eq!(error_code(&response), Some(ErrorCode::INTERNAL_ERROR));
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let endpoint = endpoint(Registry::new());
        let response = endpoint
            .handle_request(
                JsonRpcRequest::new(NumberOrString::Number(3), "roots/list", None),
                Arc::new(DetachedSink),
            )
            .await;
        assert_eq!(error_code(&response), Some(ErrorCode::METHOD_NOT_FOUND));
    }
}
