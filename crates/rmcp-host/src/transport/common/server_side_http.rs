use std::sync::Arc;

use crate::model::ServerJsonRpcMessage;

pub type SessionId = Arc<str>;

pub fn session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

/// One server-to-client message as it goes out on an SSE stream.
#[derive(Debug, Clone)]
pub struct ServerSseMessage {
    pub event_id: Option<String>,
    pub message: Arc<ServerJsonRpcMessage>,
}

/// Whether an `Accept` header value admits `mime_type`, directly or through a wildcard.
pub fn accepts(accept: &str, mime_type: &str) -> bool {
    let (kind, _) = mime_type.split_once('/').unwrap_or((mime_type, ""));
    accept.split(',').any(|range| {
        let range = range.split(';').next().unwrap_or_default().trim();
        range == mime_type || range == "*/*" || range == format!("{kind}/*")
    })
}
