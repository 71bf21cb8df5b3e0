//! Error types for connections and servers

use std::time::Duration;

use tandem_json_rpc::{MessageKind, RequestId};
use thiserror::Error;

/// Result type for connection and server operations
pub type RpcResult<T> = Result<T, RpcError>;

/// Local failures. Remote failures arrive as error messages, not as `RpcError`.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The stream closed before the operation could complete
    #[error("Connection closed")]
    ConnectionClosed,

    /// No reply arrived within the request timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Binding a listening endpoint failed
    #[error("Failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Only requests (or invalid payloads carrying an id) can await a reply
    #[error("Cannot await a reply to a {0:?} message")]
    NotARequest(MessageKind),

    /// A call with this id is already waiting for its reply
    #[error("A call with id {0} is already pending")]
    DuplicateId(RequestId),

    #[error("Server is already listening on {0}")]
    AlreadyListening(String),

    #[error("Server has been closed")]
    ServerClosed,
}

impl RpcError {
    pub fn bind(endpoint: impl ToString, source: std::io::Error) -> Self {
        Self::Bind {
            endpoint: endpoint.to_string(),
            source,
        }
    }

    /// Whether the failure means the connection is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Io(_))
    }
}
