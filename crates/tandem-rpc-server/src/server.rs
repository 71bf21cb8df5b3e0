//! JSON-RPC server: a listening endpoint, live connections and registered
//! services, all owned by one actor task.
//!
//! [`Server`] handles post commands to the actor and await its answer, so
//! registry changes from any task are applied in posting order. Inbound
//! requests are dispatched on the actor as well; a handler that needs to wait
//! on other work should be registered as a deferred method.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tandem_json_rpc::{DispatchOutcome, IntoParams, Message, RequestId, Service, ServiceRegistry};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionId};
use crate::error::{RpcError, RpcResult};
use crate::transport::{AsyncStream, BoxedStream, Endpoint, Listener};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Client lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected(ConnectionId),
    /// Fired after the connection has left the registry
    ClientDisconnected(ConnectionId),
}

enum ServerCommand {
    Listen {
        endpoint: Endpoint,
        reply: oneshot::Sender<RpcResult<Endpoint>>,
    },
    Attach {
        stream: BoxedStream,
        reply: oneshot::Sender<RpcResult<ConnectionId>>,
    },
    AddService {
        service: Arc<Service>,
        reply: oneshot::Sender<bool>,
    },
    RemoveService {
        service: Arc<Service>,
        reply: oneshot::Sender<bool>,
    },
    Services(oneshot::Sender<Vec<Arc<Service>>>),
    ClientCount(oneshot::Sender<usize>),
    Notify {
        message: Message,
        reply: oneshot::Sender<usize>,
    },
    LocalEndpoint(oneshot::Sender<Option<Endpoint>>),
    Close(oneshot::Sender<()>),
}

/// Handle to a server actor.
///
/// Clones share the same server. The actor shuts down once every handle is
/// dropped.
#[derive(Debug, Clone)]
pub struct Server {
    commands: mpsc::UnboundedSender<ServerCommand>,
    events: broadcast::Sender<ServerEvent>,
}

impl Server {
    /// Start a server with default settings.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (connection_tx, connection_rx) = mpsc::unbounded_channel();
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();

        let actor = ServerActor {
            config,
            commands: command_rx,
            events: events.clone(),
            registry: ServiceRegistry::new(),
            connections: BTreeMap::new(),
            in_flight: HashMap::new(),
            next_token: 0,
            connection_tx,
            connection_rx,
            accepted_tx,
            accepted_rx,
            accept_task: None,
            local: None,
            closed: false,
        };
        tokio::spawn(actor.run());

        Self { commands, events }
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ServerCommand,
    ) -> RpcResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| RpcError::ServerClosed)?;
        rx.await.map_err(|_| RpcError::ServerClosed)
    }

    /// Bind `endpoint` and start accepting clients.
    ///
    /// Returns the endpoint actually bound, which differs from the request
    /// when a TCP port of 0 was given.
    pub async fn listen(&self, endpoint: Endpoint) -> RpcResult<Endpoint> {
        self.request(|reply| ServerCommand::Listen { endpoint, reply })
            .await?
    }

    /// Serve an already-connected stream as if it had been accepted
    pub async fn attach<S: AsyncStream>(&self, stream: S) -> RpcResult<ConnectionId> {
        let stream: BoxedStream = Box::new(stream);
        self.request(|reply| ServerCommand::Attach { stream, reply })
            .await?
    }

    /// Register a service instance. Returns `false` if this instance is
    /// already registered.
    pub async fn add_service(&self, service: Arc<Service>) -> RpcResult<bool> {
        self.request(|reply| ServerCommand::AddService { service, reply })
            .await
    }

    /// Returns `false` if this instance was not registered
    pub async fn remove_service(&self, service: &Arc<Service>) -> RpcResult<bool> {
        let service = Arc::clone(service);
        self.request(|reply| ServerCommand::RemoveService { service, reply })
            .await
    }

    pub async fn services(&self) -> RpcResult<Vec<Arc<Service>>> {
        self.request(ServerCommand::Services).await
    }

    pub async fn client_count(&self) -> RpcResult<usize> {
        self.request(ServerCommand::ClientCount).await
    }

    /// Write `message` to every connected client in connection order.
    ///
    /// Returns how many clients it was queued for; a failed client does not
    /// stop delivery to the rest.
    pub async fn notify_connected_clients(&self, message: Message) -> RpcResult<usize> {
        self.request(|reply| ServerCommand::Notify { message, reply })
            .await
    }

    /// Send a notification to every connected client
    pub async fn broadcast(&self, method: &str, params: impl IntoParams) -> RpcResult<usize> {
        self.notify_connected_clients(Message::notification(method, params))
            .await
    }

    pub async fn local_endpoint(&self) -> RpcResult<Option<Endpoint>> {
        self.request(ServerCommand::LocalEndpoint).await
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Stop accepting and drop every live connection.
    ///
    /// Registered services are kept and may still be changed afterwards.
    pub async fn close(&self) -> RpcResult<()> {
        self.request(ServerCommand::Close).await
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

struct ServerActor {
    config: ServerConfig,
    commands: mpsc::UnboundedReceiver<ServerCommand>,
    events: broadcast::Sender<ServerEvent>,
    registry: ServiceRegistry,
    /// Keyed by id, which also orders connections by registration
    connections: BTreeMap<ConnectionId, Connection>,
    /// Request ids each client is still waiting on, with the token of the
    /// dispatch that owns them
    in_flight: HashMap<ConnectionId, HashMap<RequestId, u64>>,
    next_token: u64,
    connection_tx: mpsc::UnboundedSender<ConnectionEvent>,
    connection_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    accepted_tx: mpsc::UnboundedSender<BoxedStream>,
    accepted_rx: mpsc::UnboundedReceiver<BoxedStream>,
    accept_task: Option<JoinHandle<()>>,
    local: Option<Endpoint>,
    closed: bool,
}

impl ServerActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = self.connection_rx.recv() => self.handle_connection_event(event),
                Some(stream) = self.accepted_rx.recv() => {
                    if self.closed {
                        debug!("Dropping a client accepted after close");
                    } else {
                        self.register(stream);
                    }
                }
            }
        }
        debug!("All server handles dropped");
        self.shutdown();
    }

    async fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::Listen { endpoint, reply } => {
                let _ = reply.send(self.listen(endpoint).await);
            }
            ServerCommand::Attach { stream, reply } => {
                let result = if self.closed {
                    Err(RpcError::ServerClosed)
                } else {
                    Ok(self.register(stream))
                };
                let _ = reply.send(result);
            }
            ServerCommand::AddService { service, reply } => {
                let name = service.name().to_string();
                let added = self.registry.add(service);
                if added {
                    info!(service = %name, "Service registered");
                }
                let _ = reply.send(added);
            }
            ServerCommand::RemoveService { service, reply } => {
                let removed = self.registry.remove(&service);
                if removed {
                    info!(service = %service.name(), "Service removed");
                }
                let _ = reply.send(removed);
            }
            ServerCommand::Services(reply) => {
                let _ = reply.send(self.registry.services().to_vec());
            }
            ServerCommand::ClientCount(reply) => {
                let _ = reply.send(self.connections.len());
            }
            ServerCommand::Notify { message, reply } => {
                let _ = reply.send(self.notify(message));
            }
            ServerCommand::LocalEndpoint(reply) => {
                let _ = reply.send(self.local.clone());
            }
            ServerCommand::Close(reply) => {
                self.shutdown();
                let _ = reply.send(());
            }
        }
    }

    async fn listen(&mut self, endpoint: Endpoint) -> RpcResult<Endpoint> {
        if self.closed {
            return Err(RpcError::ServerClosed);
        }
        if let Some(local) = &self.local {
            return Err(RpcError::AlreadyListening(local.to_string()));
        }

        let (listener, local) = Listener::bind(&endpoint).await?;
        info!(endpoint = %local, "Server listening");

        let accepted = self.accepted_tx.clone();
        self.accept_task = Some(tokio::spawn(accept_loop(listener, accepted)));
        self.local = Some(local.clone());
        Ok(local)
    }

    fn register(&mut self, stream: BoxedStream) -> ConnectionId {
        let connection = Connection::spawn(
            stream,
            self.config.connection.clone(),
            Some(self.connection_tx.clone()),
        );
        let id = connection.id();
        self.connections.insert(id, connection);
        debug!(connection = %id, clients = self.connections.len(), "Client connected");
        let _ = self.events.send(ServerEvent::ClientConnected(id));
        id
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message(id, message) => self.dispatch(id, message),
            ConnectionEvent::Closed(id) => {
                self.in_flight.remove(&id);
                if self.connections.remove(&id).is_some() {
                    debug!(connection = %id, clients = self.connections.len(), "Client disconnected");
                    let _ = self.events.send(ServerEvent::ClientDisconnected(id));
                }
            }
            ConnectionEvent::Released { connection, id, token } => {
                if let Some(in_flight) = self.in_flight.get_mut(&connection) {
                    if in_flight.get(&id) == Some(&token) {
                        in_flight.remove(&id);
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, id: ConnectionId, message: Message) {
        let Some(connection) = self.connections.get(&id) else {
            debug!(connection = %id, "Dropping message from a deregistered client");
            return;
        };

        let mut guard = None;
        if let Message::Request(request) = &message {
            let in_flight = self.in_flight.entry(id).or_default();
            if in_flight.contains_key(&request.id) {
                warn!(connection = %id, id = %request.id, "Ignoring request whose id is still in flight");
                return;
            }
            self.next_token += 1;
            in_flight.insert(request.id.clone(), self.next_token);
            guard = Some(InFlightGuard {
                connection: id,
                id: request.id.clone(),
                token: self.next_token,
                events: self.connection_tx.clone(),
            });
        }

        let responder = connection.clone();
        let sink = move |reply: Message| {
            let _guard = guard;
            if let Err(err) = responder.send(reply) {
                debug!(connection = %responder.id(), error = %err, "Deferred reply not delivered");
            }
        };

        let outcome = self.registry.dispatch(&message, sink);
        if !matches!(outcome, DispatchOutcome::Deferred) {
            if let (Message::Request(request), Some(in_flight)) =
                (&message, self.in_flight.get_mut(&id))
            {
                in_flight.remove(&request.id);
            }
        }
        if let DispatchOutcome::Reply(reply) = outcome {
            if let Err(err) = connection.send(reply) {
                debug!(connection = %id, error = %err, "Reply not delivered");
            }
        }
    }

    fn notify(&self, message: Message) -> usize {
        let mut delivered = 0;
        for (id, connection) in &self.connections {
            match connection.send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => debug!(connection = %id, error = %err, "Notification not delivered"),
            }
        }
        delivered
    }

    fn shutdown(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Some(local) = self.local.take() {
            info!(endpoint = %local, "Server stopped listening");
        }
        self.closed = true;
        self.in_flight.clear();

        for (id, connection) in std::mem::take(&mut self.connections) {
            connection.close();
            let _ = self.events.send(ServerEvent::ClientDisconnected(id));
        }
        // Streams accepted but not yet registered
        while let Ok(stream) = self.accepted_rx.try_recv() {
            drop(stream);
        }
    }
}

/// Travels with a deferred reply's sink and frees the request id when the
/// sink is used or dropped
struct InFlightGuard {
    connection: ConnectionId,
    id: RequestId,
    token: u64,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let _ = self.events.send(ConnectionEvent::Released {
            connection: self.connection,
            id: self.id.clone(),
            token: self.token,
        });
    }
}

async fn accept_loop(listener: Listener, accepted: mpsc::UnboundedSender<BoxedStream>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(peer = %peer, "Accepted connection");
                if accepted.send(stream).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, "Accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}
