//! # JSON-RPC 2.0 Server and Connections
//!
//! Runs [`tandem_json_rpc`] services over TCP or Unix-domain sockets.
//!
//! A [`Server`] accepts clients, dispatches their requests to its registered
//! services and can notify every connected client at once. A [`Connection`]
//! is the client side: fire-and-forget sends, calls that wait for their
//! reply, and [`ReplyHandle`]s for calls awaited later.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tandem_rpc_server::prelude::*;
//!
//! # async fn run() -> RpcResult<()> {
//! let service = Service::builder("calc")
//!     .method(
//!         MethodDescriptor::builder("add")
//!             .param("a", ParamKind::Integer)
//!             .param("b", ParamKind::Integer)
//!             .handler(|args| Ok(json!(args.get::<i64>("a")? + args.get::<i64>("b")?))),
//!     )
//!     .build();
//!
//! let server = Server::new();
//! server.add_service(Arc::new(service)).await?;
//! let endpoint = server.listen(Endpoint::tcp("127.0.0.1:0")).await?;
//!
//! let client = Connection::connect(&endpoint, ConnectionConfig::default()).await?;
//! let reply = client.invoke("calc.add", json!([1, 2])).await?;
//! assert_eq!(reply.result(), Some(&json!(3)));
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod prelude;
pub mod reply;
pub mod server;
pub mod transport;

pub use codec::MessageCodec;
pub use config::{ConnectionConfig, ServerConfig};
pub use connection::{Connection, ConnectionId};
pub use error::{RpcError, RpcResult};
pub use reply::ReplyHandle;
pub use server::{Server, ServerEvent};
pub use transport::{AsyncStream, BoxedStream, Endpoint};
