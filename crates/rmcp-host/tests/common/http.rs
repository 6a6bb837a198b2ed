use std::time::Duration;

use axum::{
    Router,
    body::Body,
    http::{Request, Response, StatusCode, header},
};
use http_body_util::BodyExt;
use rmcp_host::transport::{
    HttpServer, HttpServerConfig, StreamableHttpServerConfig, StreamableHttpService,
};
use serde_json::{Value, json};
use tower::ServiceExt;

use super::{calculator::Calculator, calculator_registry};

pub const SSE_AND_JSON: &str = "application/json, text/event-stream";
pub const JSON_ONLY: &str = "application/json";

pub fn service(calculator: &Calculator, config: StreamableHttpServerConfig) -> StreamableHttpService {
    StreamableHttpService::new(
        calculator_registry(calculator),
        Default::default(),
        config,
    )
}

/// The full server router (CORS, diagnostics, `/mcp`) without a listener.
pub fn router(service: &StreamableHttpService) -> Router {
    let mut config = HttpServerConfig::new([127, 0, 0, 1], 0);
    config.handle_signals = false;
    HttpServer::router(&config, service)
}

pub fn initialize_body(id: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2025-06-18",
            "capabilities": {},
            "clientInfo": {"name": "integration-test", "version": "0.0.1"}
        }
    })
}

pub fn request_body(id: i64, method: &str, params: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
}

pub fn post(session_id: Option<&str>, accept: &str, body: &Value) -> Request<Body> {
    let mut builder = Request::post("/mcp")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ACCEPT, accept);
    if let Some(session_id) = session_id {
        builder = builder.header("mcp-session-id", session_id);
    }
    builder
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

pub fn get(session_id: Option<&str>, last_event_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::get("/mcp").header(header::ACCEPT, "text/event-stream");
    if let Some(session_id) = session_id {
        builder = builder.header("mcp-session-id", session_id);
    }
    if let Some(last_event_id) = last_event_id {
        builder = builder.header("last-event-id", last_event_id);
    }
    builder.body(Body::empty()).unwrap()
}

pub fn delete(session_id: &str) -> Request<Body> {
    Request::delete("/mcp")
        .header("mcp-session-id", session_id)
        .body(Body::empty())
        .unwrap()
}

pub async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
    router.clone().oneshot(request).await.unwrap()
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub fn session_header(response: &Response<Body>) -> Option<String> {
    response
        .headers()
        .get("mcp-session-id")
        .map(|value| value.to_str().unwrap().to_owned())
}

/// Initialize a session over JSON and return its id.
pub async fn initialize(router: &Router) -> String {
    let response = send(router, post(None, JSON_ONLY, &initialize_body(0))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let session_id = session_header(&response).expect("session id header");
    let body = json_body(response).await;
    assert_eq!(body["id"], 0);
    assert!(body["result"]["serverInfo"].is_object());
    session_id
}

#[derive(Debug, Clone)]
pub struct SseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: Value,
}

/// Incremental reader of an SSE response body.
pub struct SseReader {
    body: Body,
    buffer: String,
}

impl SseReader {
    pub fn new(response: Response<Body>) -> Self {
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        Self {
            body: response.into_body(),
            buffer: String::new(),
        }
    }

    /// The next event carrying data; `None` once the stream ends.
    pub async fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            while let Some(end) = self.buffer.find("\n\n") {
                let block: String = self.buffer.drain(..end + 2).collect();
                if let Some(event) = parse_block(&block) {
                    return Some(event);
                }
            }
            let frame = self.body.frame().await?.unwrap();
            if let Ok(data) = frame.into_data() {
                self.buffer.push_str(std::str::from_utf8(&data).unwrap());
            }
        }
    }

    pub async fn expect_event(&mut self) -> SseEvent {
        tokio::time::timeout(Duration::from_secs(5), self.next_event())
            .await
            .expect("sse event in time")
            .expect("sse stream still open")
    }

    /// Asserts that nothing arrives for a short while.
    pub async fn expect_quiet(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(200), self.next_event()).await;
        assert!(next.is_err(), "unexpected event: {next:?}");
    }
}

fn parse_block(block: &str) -> Option<SseEvent> {
    let mut id = None;
    let mut event = None;
    let mut data = String::new();
    for line in block.lines() {
        if let Some(value) = line.strip_prefix("id:") {
            id = Some(value.trim().to_owned());
        } else if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim().to_owned());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push_str(value.trim_start());
        }
    }
    if data.is_empty() {
        return None;
    }
    Some(SseEvent {
        id,
        event,
        data: serde_json::from_str(&data).unwrap(),
    })
}
