//! Server side - dispatch boundary, lifecycle and the stdio loop
//!
//! - **Dispatch**: sessions, typed routing, panic and error isolation
//! - **Router / Auth**: collaborator contracts supplied by the application
//! - **Lifecycle**: phase machine and hooks around a [`Service`]
//! - **ErrorHandler**: error responses, statistics and recovery strategies
//! - **Stdio**: line-delimited server loop
//!
//! The HTTP server lives with the HTTP carrier in [`crate::io::http`].

pub mod auth;
pub mod dispatch;
pub mod error_handler;
pub mod lifecycle;
pub mod router;
pub mod stdio;

pub use auth::{AllowAll, AuthInfo, Authenticator, Credentials, StaticTokenAuthenticator};
pub use dispatch::Dispatcher;
pub use error_handler::{ErrorFilter, ErrorHandler, ErrorStats, RecoveryStrategy};
pub use lifecycle::{LifecycleHook, LifecycleManager, LifecyclePhase, LifecycleStats, Service, hook_fn};
pub use router::{EchoRouter, Notifier, RequestContext, Router};
pub use stdio::StdioServer;
