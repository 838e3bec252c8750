//! Sessions on both sides of the connection
//!
//! [`ClientSession`] drives the handshake from the client. The server keeps
//! its sessions in a [`ServerSessionStore`].

pub mod handshake;
pub mod id;
pub mod store;

pub use handshake::{ClientSession, SessionPhase};
pub use id::{generate_session_id, is_well_formed};
pub use store::{InMemorySessionStore, ServerSessionStore, SessionInfo, SessionMetadata};
