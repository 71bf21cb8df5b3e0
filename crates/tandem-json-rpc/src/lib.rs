//! # JSON-RPC 2.0 Runtime Core
//!
//! Transport-agnostic building blocks for exposing named services over a
//! duplex byte stream. Nothing in this crate performs I/O; the
//! `tandem-rpc-server` crate layers sockets, connections and the server
//! lifecycle on top.
//!
//! ## Features
//! - Validating message model: malformed input never fails to decode, it
//!   becomes an `Invalid` message carrying the `InvalidRequest` reply
//! - Incremental framing of back-to-back JSON documents with no delimiter
//! - Explicit method descriptors with typed parameters, defaults, in/out
//!   parameters and overloads resolved by argument shape
//! - Deferred replies completed after dispatch returns

pub mod dispatch;
pub mod error;
pub mod framer;
pub mod message;
pub mod prelude;
pub mod service;
pub mod types;

// Re-export main types
pub use dispatch::{DeferredReply, DispatchOutcome, ServiceRegistry};
pub use error::{JsonRpcError, JsonRpcErrorCode, JsonRpcErrorObject, MethodError};
pub use framer::Framer;
pub use message::{
    InvalidMessage, IntoParams, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Message,
    MessageKind, RequestParams,
};
pub use service::{Arguments, Direction, MethodDescriptor, ParamDescriptor, ParamKind, Service};
pub use types::RequestId;

/// JSON-RPC 2.0 version constant
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC 2.0 error codes
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    // Server error range: -32099 to -32000
    pub const SERVER_ERROR_START: i64 = -32099;
    pub const SERVER_ERROR_END: i64 = -32000;
}
