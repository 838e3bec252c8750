//! JSON-RPC session and transport engine for the Model Context Protocol
//!
//! Layers, bottom up:
//!
//! - [`protocol`]: wire codec, error codes, method namespace
//! - [`io`]: carriers (stdio child process, streamable HTTP with SSE, in-memory)
//! - [`rpc`]: request/response correlation over any [`io::Transport`]
//! - [`session`]: client handshake and the server session store
//! - [`server`]: dispatch, lifecycle, error handling and the stdio server loop

pub mod config;
pub mod error;
pub mod io;
pub mod logging;
pub mod protocol;
pub mod rpc;
pub mod server;
pub mod session;

#[cfg(test)]
mod test_utils;

pub use config::{ClientConfig, HttpClientConfig, RetryPolicy, ServerConfig, StdioConfig};
pub use error::{ErrorKind, McpError, McpResult};
pub use io::{MemoryTransport, StdioTransport, Transport, TransportKind};
pub use io::http::{HttpServer, HttpTransport};
pub use rpc::RequestCorrelator;
pub use server::{Dispatcher, LifecycleManager, Router, StdioServer};
pub use session::{ClientSession, InMemorySessionStore, ServerSessionStore};
