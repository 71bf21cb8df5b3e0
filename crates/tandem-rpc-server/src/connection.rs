//! A JSON-RPC peer over one duplex stream.
//!
//! Each [`Connection`] is a cheap handle to an actor task that owns the
//! stream, the framer state and the pending-call table. Every operation is a
//! command posted to that task, so registry edits never need a lock and are
//! applied in posting order. Writes go through a separate writer task so a
//! slow peer never stops the actor from reading.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tandem_json_rpc::{IntoParams, Message, RequestId};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use crate::codec::MessageCodec;
use crate::config::ConnectionConfig;
use crate::error::{RpcError, RpcResult};
use crate::reply::ReplyHandle;
use crate::transport::{self, AsyncStream, BoxedStream, Endpoint};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_CALL_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

pub(crate) type ReplySender = oneshot::Sender<RpcResult<Message>>;

/// Identifies one `call_async` so a cancel only removes its own entry
pub(crate) type CallToken = u64;

struct PendingCall {
    token: CallToken,
    reply: ReplySender,
}

pub(crate) enum Command {
    Send(Message),
    Call {
        id: RequestId,
        token: CallToken,
        message: Message,
        reply: ReplySender,
    },
    Cancel { id: RequestId, token: CallToken },
    PendingCount(oneshot::Sender<usize>),
    Close,
}

/// Events the owning server processes in arrival order
#[derive(Debug)]
pub(crate) enum ConnectionEvent {
    /// An inbound request, notification or invalid payload
    Message(ConnectionId, Message),
    Closed(ConnectionId),
    /// A deferred request was answered or abandoned; its id may be reused
    Released {
        connection: ConnectionId,
        id: RequestId,
        token: u64,
    },
}

/// Handle to a live (or closed) connection.
///
/// Clones share the same actor. When the stream closes, every outstanding
/// call fails with [`RpcError::ConnectionClosed`].
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<Message>,
    config: ConnectionConfig,
}

impl Connection {
    /// Connect to a listening server
    pub async fn connect(endpoint: &Endpoint, config: ConnectionConfig) -> RpcResult<Self> {
        let stream = transport::connect(endpoint).await?;
        Ok(Self::spawn(stream, config, None))
    }

    /// Run a connection over an already-connected stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_stream<S: AsyncStream>(stream: S, config: ConnectionConfig) -> Self {
        Self::spawn(Box::new(stream), config, None)
    }

    pub(crate) fn spawn(
        stream: BoxedStream,
        config: ConnectionConfig,
        owner: Option<mpsc::UnboundedSender<ConnectionEvent>>,
    ) -> Self {
        let id = ConnectionId::next();
        let (read, write) = tokio::io::split(stream);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        let writer_task = tokio::spawn(write_loop(
            id,
            FramedWrite::new(write, MessageCodec::new()),
            outgoing_rx,
        ));
        let actor = ConnectionActor {
            id,
            commands: command_rx,
            reader: FramedRead::new(read, MessageCodec::new()),
            outgoing,
            writer_task,
            pending: HashMap::new(),
            events: events.clone(),
            owner,
        };
        tokio::spawn(actor.run());
        debug!(connection = %id, "Connection started");

        Self {
            id,
            commands,
            events,
            config,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Write a message without waiting for any reply
    pub fn send(&self, message: Message) -> RpcResult<()> {
        self.commands
            .send(Command::Send(message))
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Send a request and wait for its reply, up to the configured timeout.
    ///
    /// The reply may be a success response or an error message; only local
    /// failures (timeout, closed stream) are returned as `Err`.
    pub async fn call(&self, message: Message) -> RpcResult<Message> {
        self.call_with_timeout(message, self.config.request_timeout)
            .await
    }

    pub async fn call_with_timeout(&self, message: Message, timeout: Duration) -> RpcResult<Message> {
        let handle = self.call_async(message)?;
        let id = handle.id().clone();
        match tokio::time::timeout(timeout, handle).await {
            Ok(result) => result,
            Err(_) => {
                debug!(connection = %self.id, id = %id, "Call timed out");
                Err(RpcError::Timeout(timeout))
            }
        }
    }

    /// Send a request and return a handle that resolves with its reply.
    ///
    /// Invalid payloads that still carry an id are accepted too, so the
    /// peer's `InvalidRequest` answer can be awaited.
    pub fn call_async(&self, message: Message) -> RpcResult<ReplyHandle> {
        let id = match (&message, message.id()) {
            (Message::Request(_) | Message::Invalid(_), Some(id)) => id.clone(),
            _ => return Err(RpcError::NotARequest(message.kind())),
        };
        let token = NEXT_CALL_TOKEN.fetch_add(1, Ordering::Relaxed);
        let (reply, receiver) = oneshot::channel();
        self.commands
            .send(Command::Call {
                id: id.clone(),
                token,
                message,
                reply,
            })
            .map_err(|_| RpcError::ConnectionClosed)?;
        Ok(ReplyHandle::new(id, token, receiver, self.commands.clone()))
    }

    /// Build a request with a fresh id and wait for its reply
    pub async fn invoke(&self, method: &str, params: impl IntoParams) -> RpcResult<Message> {
        self.call(Message::request(method, params)).await
    }

    /// Send a notification
    pub fn notify(&self, method: &str, params: impl IntoParams) -> RpcResult<()> {
        self.send(Message::notification(method, params))
    }

    /// Every inbound message: unsolicited requests and notifications, and
    /// replies that matched a pending call.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.events.subscribe()
    }

    /// Number of calls still waiting for their reply
    pub async fn pending_calls(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::PendingCount(tx)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Close the stream after flushing queued writes
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Wait until the connection has shut down
    pub async fn closed(&self) {
        self.commands.closed().await
    }
}

struct ConnectionActor {
    id: ConnectionId,
    commands: mpsc::UnboundedReceiver<Command>,
    reader: FramedRead<ReadHalf<BoxedStream>, MessageCodec>,
    outgoing: mpsc::UnboundedSender<Message>,
    writer_task: JoinHandle<()>,
    pending: HashMap<RequestId, PendingCall>,
    events: broadcast::Sender<Message>,
    owner: Option<mpsc::UnboundedSender<ConnectionEvent>>,
}

impl ConnectionActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Close) => {
                        debug!(connection = %self.id, "Closing connection");
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!(connection = %self.id, "All handles dropped");
                        break;
                    }
                },
                inbound = self.reader.next() => match inbound {
                    Some(Ok(message)) => self.handle_inbound(message),
                    Some(Err(err)) => {
                        warn!(connection = %self.id, error = %err, "Read failed");
                        break;
                    }
                    None => {
                        debug!(connection = %self.id, "Peer closed the stream");
                        break;
                    }
                },
                _ = &mut self.writer_task => {
                    debug!(connection = %self.id, "Writer stopped");
                    break;
                }
            }
        }
        self.shutdown();
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send(message) => self.write(message),
            Command::Call {
                id,
                token,
                message,
                reply,
            } => {
                if self.pending.contains_key(&id) {
                    let _ = reply.send(Err(RpcError::DuplicateId(id)));
                    return;
                }
                if self.outgoing.send(message).is_err() {
                    let _ = reply.send(Err(RpcError::ConnectionClosed));
                    return;
                }
                trace!(connection = %self.id, id = %id, "Call pending");
                self.pending.insert(id, PendingCall { token, reply });
            }
            Command::Cancel { id, token } => {
                // A handle rejected as a duplicate shares the id but not the token
                if self.pending.get(&id).is_some_and(|call| call.token == token) {
                    self.pending.remove(&id);
                    debug!(connection = %self.id, id = %id, "Pending call disposed");
                }
            }
            Command::PendingCount(reply) => {
                let _ = reply.send(self.pending.len());
            }
            Command::Close => {}
        }
    }

    fn write(&mut self, message: Message) {
        if self.outgoing.send(message).is_err() {
            debug!(connection = %self.id, "Dropping write on a stopped writer");
        }
    }

    fn handle_inbound(&mut self, message: Message) {
        trace!(connection = %self.id, kind = ?message.kind(), "Message received");

        if message.is_reply() {
            let Some(id) = message.id().cloned() else {
                // An error with a null id cannot be correlated with any call
                let _ = self.events.send(message);
                return;
            };
            match self.pending.remove(&id) {
                Some(call) if !call.reply.is_closed() => {
                    let _ = self.events.send(message.clone());
                    let _ = call.reply.send(Ok(message));
                }
                _ => debug!(connection = %self.id, id = %id, "Dropping reply with no pending call"),
            }
            return;
        }

        let _ = self.events.send(message.clone());
        if let Some(owner) = &self.owner {
            let _ = owner.send(ConnectionEvent::Message(self.id, message));
        }
    }

    fn shutdown(mut self) {
        for (_, call) in self.pending.drain() {
            let _ = call.reply.send(Err(RpcError::ConnectionClosed));
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Call { reply, .. } = command {
                let _ = reply.send(Err(RpcError::ConnectionClosed));
            }
        }
        if let Some(owner) = self.owner.take() {
            let _ = owner.send(ConnectionEvent::Closed(self.id));
        }
        debug!(connection = %self.id, "Connection closed");
    }
}

/// Drain queued messages to the stream, flushing once per batch
async fn write_loop(
    id: ConnectionId,
    mut sink: FramedWrite<WriteHalf<BoxedStream>, MessageCodec>,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outgoing.recv().await {
        let mut result = sink.feed(message).await;
        while result.is_ok() {
            match outgoing.try_recv() {
                Ok(next) => result = sink.feed(next).await,
                Err(_) => break,
            }
        }
        if result.is_ok() {
            result = sink.flush().await;
        }
        if let Err(err) = result {
            warn!(connection = %id, error = %err, "Write failed");
            return;
        }
    }
    let _ = sink.close().await;
}
