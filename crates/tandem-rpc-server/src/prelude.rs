//! # Server Prelude
//!
//! Everything needed to serve or call JSON-RPC services in one import.
//!
//! ```rust
//! use tandem_rpc_server::prelude::*;
//! ```

pub use tandem_json_rpc::prelude::*;

pub use crate::config::{ConnectionConfig, ServerConfig};
pub use crate::connection::{Connection, ConnectionId};
pub use crate::error::{RpcError, RpcResult};
pub use crate::reply::ReplyHandle;
pub use crate::server::{Server, ServerEvent};
pub use crate::transport::Endpoint;
