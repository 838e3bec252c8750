//! I/O layer - carriers that move encoded messages between peers
//!
//! - **Process**: child process lifecycle for the stdio carrier
//! - **Transport**: the [`Transport`] trait plus stdio and in-memory carriers
//! - **Http**: streamable HTTP client and server, SSE framing, event replay
//!
//! Nothing here interprets JSON-RPC beyond what a carrier must (the HTTP
//! carriers need request ids to route responses).

pub mod http;
pub mod process;
pub mod transport;

pub use process::{
    ChildProcessManager, ProcessExitEvent, ProcessExitHandler, ProcessState, StopMode,
};
pub use transport::{MemoryTransport, StdioTransport, Transport, TransportKind};
