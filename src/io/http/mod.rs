//! Streamable HTTP carrier
//!
//! Client and server halves of the HTTP transport: POST for requests,
//! Server-Sent Events for streamed responses and server-initiated messages,
//! and an event store backing stream resumption.

pub mod client;
pub mod event_store;
pub mod server;
pub mod sse;

pub use client::{HttpTransport, HttpTransportMonitor};
pub use event_store::{EventRecord, EventStore, FileEventStore, MemoryEventStore, create_event_store};
pub use server::{HttpServer, HttpServerState, router};
pub use sse::{SseEvent, SseParser};

/// Header carrying the server-issued session id
pub const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Header carrying the negotiated protocol version on post-handshake requests
pub const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";

/// Standard SSE resumption header
pub const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";

pub(crate) const EVENT_STREAM: &str = "text/event-stream";
pub(crate) const JSON: &str = "application/json";
