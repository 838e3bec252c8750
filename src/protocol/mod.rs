//! Protocol layer - wire format and method namespace
//!
//! - **Codec**: JSON-RPC 2.0 messages and batches
//! - **Codes**: reserved error codes
//! - **Methods**: method names and typed params

pub mod codec;
pub mod codes;
pub mod methods;

pub use codec::{
    Decoded, ErrorObject, ErrorResponse, JSONRPC_VERSION, Message, Notification, Payload,
    Rejected, Request, RequestId, Response, decode, decode_tolerant, encode_batch,
    encode_message, encode_payload,
};
pub use methods::{
    ClientNotification, ClientRequest, Implementation, InitializeParams, InitializeResult,
    LATEST_PROTOCOL_VERSION, LEGACY_SSE_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
