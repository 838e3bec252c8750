//! RPC layer - request/response correlation over a transport

pub mod correlator;

pub use correlator::{MessageHandler, PendingRequest, RequestCorrelator};
