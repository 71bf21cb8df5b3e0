//! # JSON-RPC Core Prelude
//!
//! Convenient re-exports of the types needed to describe services and
//! exchange messages.
//!
//! ```rust
//! use tandem_json_rpc::prelude::*;
//! ```

// Wire model
pub use crate::error::{JsonRpcError, JsonRpcErrorCode, JsonRpcErrorObject, MethodError};
pub use crate::framer::Framer;
pub use crate::message::{IntoParams, Message, MessageKind, RequestParams};
pub use crate::types::RequestId;

// Services and dispatch
pub use crate::dispatch::{DeferredReply, DispatchOutcome, ServiceRegistry};
pub use crate::service::{Arguments, Direction, MethodDescriptor, ParamKind, Service};

// Standard error codes
pub use crate::error_codes::*;
