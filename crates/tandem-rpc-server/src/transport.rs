//! Byte-stream transports: endpoint addressing, listeners and client connect.
//!
//! Both TCP and Unix-domain sockets produce a [`BoxedStream`], so the rest
//! of the crate never cares which one it is talking over.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::error::{RpcError, RpcResult};

/// Any ordered, reliable duplex byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Address of a listening server
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `host:port`
    Tcp(String),
    /// Filesystem path of a Unix-domain socket
    Unix(PathBuf),
}

impl Endpoint {
    pub fn tcp(address: impl Into<String>) -> Self {
        Self::Tcp(address.into())
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix(path.into())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(address) => write!(f, "tcp://{}", address),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = RpcError;

    /// Accepts `tcp://host:port`, `unix:/path`, `unix:///path` or a bare `host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(address) = s.strip_prefix("tcp://") {
            return parse_tcp(address, s);
        }
        if let Some(path) = s.strip_prefix("unix://").or_else(|| s.strip_prefix("unix:")) {
            if path.is_empty() {
                return Err(RpcError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Endpoint::Unix(PathBuf::from(path)));
        }
        parse_tcp(s, s)
    }
}

fn parse_tcp(address: &str, original: &str) -> RpcResult<Endpoint> {
    let valid = address
        .rsplit_once(':')
        .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if valid {
        Ok(Endpoint::Tcp(address.to_string()))
    } else {
        Err(RpcError::InvalidEndpoint(original.to_string()))
    }
}

/// Open a client stream to `endpoint`
pub async fn connect(endpoint: &Endpoint) -> RpcResult<BoxedStream> {
    debug!(endpoint = %endpoint, "Connecting");
    match endpoint {
        Endpoint::Tcp(address) => {
            let stream = TcpStream::connect(address.as_str()).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(RpcError::InvalidEndpoint(endpoint.to_string())),
    }
}

/// A bound listening socket
#[derive(Debug)]
pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    /// Bind `endpoint`, returning the listener and the address actually bound.
    ///
    /// A Unix path that already exists is a bind error; it is never removed here.
    pub(crate) async fn bind(endpoint: &Endpoint) -> RpcResult<(Self, Endpoint)> {
        match endpoint {
            Endpoint::Tcp(address) => {
                let listener = TcpListener::bind(address.as_str())
                    .await
                    .map_err(|e| RpcError::bind(endpoint, e))?;
                let local = listener
                    .local_addr()
                    .map_err(|e| RpcError::bind(endpoint, e))?;
                Ok((Listener::Tcp(listener), Endpoint::Tcp(local.to_string())))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                let listener = UnixListener::bind(path).map_err(|e| RpcError::bind(endpoint, e))?;
                Ok((Listener::Unix(listener), endpoint.clone()))
            }
            #[cfg(not(unix))]
            Endpoint::Unix(_) => Err(RpcError::InvalidEndpoint(endpoint.to_string())),
        }
    }

    /// Wait for the next client, returning its stream and a printable peer address
    pub(crate) async fn accept(&self) -> std::io::Result<(BoxedStream, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Box::new(stream), peer.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (stream, peer) = listener.accept().await?;
                let peer = peer
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unnamed".to_string());
                Ok((Box::new(stream), peer))
            }
        }
    }
}
