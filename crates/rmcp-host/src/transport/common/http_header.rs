pub const HEADER_SESSION_ID: &str = "mcp-session-id";
pub const HEADER_LAST_EVENT_ID: &str = "last-event-id";
pub const EVENT_STREAM_MIME_TYPE: &str = "text/event-stream";
