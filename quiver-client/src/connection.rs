//! Connection management for Quiver client

use crate::auth::Credential;
use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::endpoint::Endpoint;
use crate::error::{ClientError, ServerError};
use crate::metrics::ClientMetrics;
use crate::protocol::{BrokerCodec, Command, ProducerId, RequestId, SequenceId, PROTOCOL_VERSION};
use crate::tls::BrokerStream;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub type ConnectionId = u64;

/// Lifecycle of a broker session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Authenticated,
    Closing,
    Closed,
}

/// Inbound traffic routed to a producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerEvent {
    Receipt {
        sequence_id: SequenceId,
        ledger_id: u64,
        entry_id: u64,
    },
    SendError {
        sequence_id: SequenceId,
        code: ServerError,
        message: String,
    },
    /// A `Send` frame for these sequences could not be encoded and was never written
    FrameRejected {
        first_sequence_id: SequenceId,
        last_sequence_id: SequenceId,
        reason: String,
    },
    ConnectionClosed {
        connection_id: ConnectionId,
    },
}

/// State shared between a connection handle and its I/O actor
#[derive(Debug)]
struct Shared {
    id: ConnectionId,
    endpoint: Endpoint,
    pending_requests: DashMap<RequestId, oneshot::Sender<Command>>,
    producers: DashMap<ProducerId, mpsc::UnboundedSender<ProducerEvent>>,
    state: watch::Sender<ConnectionState>,
    last_activity: Mutex<Instant>,
}

impl Shared {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn route(&self, producer_id: ProducerId, event: ProducerEvent) {
        match self.producers.get(&producer_id) {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => warn!(
                "Dropping event for unknown producer {} on {}",
                producer_id, self.endpoint
            ),
        }
    }
}

/// One authenticated session to a broker, driven by a dedicated I/O task
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    endpoint: Endpoint,
    server_version: String,
    max_message_size: usize,
    request_counter: AtomicU64,
    operation_timeout: Duration,
    outbound_tx: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
    _handle: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Open a socket, negotiate TLS if the endpoint asks for it and authenticate
    pub async fn connect(
        id: ConnectionId,
        endpoint: Endpoint,
        credential: &Credential,
        config: &ClientConfig,
    ) -> Result<Arc<Self>, ClientError> {
        debug!("Creating connection {} to {}", id, endpoint);
        let connect_timeout_ms = config.connection_timeout.as_millis() as u64;

        let tcp = timeout(config.connection_timeout, TcpStream::connect(endpoint.address()))
            .await
            .map_err(|_| ClientError::timeout(connect_timeout_ms))?
            .map_err(|e| {
                ClientError::network(format!("Failed to connect to {}: {}", endpoint, e))
            })?;
        tcp.set_nodelay(true)?;

        let stream = match credential.tls_for(&endpoint)? {
            Some(tls) => BrokerStream::Tls(tls.connect(&endpoint.host, tcp).await?),
            None => BrokerStream::Tcp(tcp),
        };

        let mut framed = Framed::new(stream, BrokerCodec::new());
        let authentication = credential.authentication();
        framed
            .send(Command::Connect {
                client_version: format!("quiver-client-{}", crate::VERSION),
                auth_method: authentication.method_name().to_string(),
                auth_data: authentication.auth_data()?,
                protocol_version: PROTOCOL_VERSION,
            })
            .await?;

        let reply = timeout(config.connection_timeout, framed.next())
            .await
            .map_err(|_| ClientError::timeout(connect_timeout_ms))?;

        let (server_version, max_message_size) = match reply {
            Some(Ok(Command::Connected {
                server_version,
                max_message_size,
            })) => (server_version, max_message_size as usize),
            Some(Ok(Command::Error { code, message, .. })) => {
                warn!("Broker {} refused session: {:?} {}", endpoint, code, message);
                return Err(code.to_client_error(&endpoint.to_string(), &message));
            }
            Some(Ok(other)) => {
                return Err(ClientError::protocol(format!(
                    "Expected Connected from {}, got {:?}",
                    endpoint, other
                )))
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(ClientError::network(format!(
                    "{} closed the connection during handshake",
                    endpoint
                )))
            }
        };

        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            id,
            endpoint: endpoint.clone(),
            pending_requests: DashMap::new(),
            producers: DashMap::new(),
            state: state_tx,
            last_activity: Mutex::new(Instant::now()),
        });
        shared.state.send_replace(ConnectionState::Authenticated);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(Self::run(
            shared.clone(),
            framed,
            outbound_rx,
            config.keep_alive_interval,
            shutdown.clone(),
        ));

        info!(
            "Connected to broker {} (server {}, max message size {})",
            endpoint, server_version, max_message_size
        );

        Ok(Arc::new(Self {
            id,
            endpoint,
            server_version,
            max_message_size,
            request_counter: AtomicU64::new(1),
            operation_timeout: config.operation_timeout,
            outbound_tx,
            shared,
            shutdown,
            _handle: handle,
        }))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Largest payload the broker accepts
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Watch state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Check if connection is healthy
    pub fn is_healthy(&self) -> bool {
        self.state() == ConnectionState::Authenticated && !self.outbound_tx.is_closed()
    }

    /// Queue a frame for the I/O task
    pub fn send_frame(&self, command: Command) -> Result<(), ClientError> {
        if self.state() != ConnectionState::Authenticated {
            return Err(ClientError::network(format!(
                "Connection to {} is {:?}",
                self.endpoint,
                self.state()
            )));
        }
        self.outbound_tx
            .send(command)
            .map_err(|_| ClientError::network(format!("Connection to {} closed", self.endpoint)))
    }

    /// Send a request and wait for the response carrying the same request id
    pub async fn send_request(&self, mut command: Command) -> Result<Command, ClientError> {
        let request_id = self.request_counter.fetch_add(1, Ordering::SeqCst);
        command.set_request_id(request_id);

        let (response_tx, response_rx) = oneshot::channel();
        self.shared.pending_requests.insert(request_id, response_tx);

        if let Err(e) = self.send_frame(command) {
            self.shared.pending_requests.remove(&request_id);
            return Err(e);
        }

        match timeout(self.operation_timeout, response_rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(ClientError::network(format!(
                "Connection to {} closed before request {} completed",
                self.endpoint, request_id
            ))),
            Err(_) => {
                self.shared.pending_requests.remove(&request_id);
                Err(ClientError::timeout(self.operation_timeout.as_millis() as u64))
            }
        }
    }

    /// Route receipts and errors for `producer_id` to `events`
    pub fn register_producer(
        &self,
        producer_id: ProducerId,
        events: mpsc::UnboundedSender<ProducerEvent>,
    ) -> Result<(), ClientError> {
        self.shared.producers.insert(producer_id, events);
        // The I/O task marks the state closed before draining producers
        if self.state() != ConnectionState::Authenticated {
            self.shared.producers.remove(&producer_id);
            return Err(ClientError::network(format!(
                "Connection to {} closed",
                self.endpoint
            )));
        }
        Ok(())
    }

    pub fn remove_producer(&self, producer_id: ProducerId) {
        self.shared.producers.remove(&producer_id);
    }

    pub fn producer_count(&self) -> usize {
        self.shared.producers.len()
    }

    /// Close the connection
    pub fn close(&self) {
        if self.state() == ConnectionState::Authenticated {
            self.shared.state.send_replace(ConnectionState::Closing);
        }
        self.shutdown.cancel();
    }

    async fn run(
        shared: Arc<Shared>,
        framed: Framed<BrokerStream, BrokerCodec>,
        outbound_rx: mpsc::UnboundedReceiver<Command>,
        keep_alive: Duration,
        shutdown: CancellationToken,
    ) {
        let result =
            Self::connection_loop(&shared, framed, outbound_rx, keep_alive, shutdown).await;

        match result {
            Ok(()) => debug!("Connection {} to {} closed", shared.id, shared.endpoint),
            Err(e) => error!("Connection {} to {} lost: {}", shared.id, shared.endpoint, e),
        }

        shared.state.send_replace(ConnectionState::Closed);

        // Dropping the senders fails every waiting request
        shared.pending_requests.clear();

        let producers: Vec<_> = shared
            .producers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        shared.producers.clear();
        for tx in producers {
            let _ = tx.send(ProducerEvent::ConnectionClosed {
                connection_id: shared.id,
            });
        }
    }

    async fn connection_loop(
        shared: &Shared,
        mut framed: Framed<BrokerStream, BrokerCodec>,
        mut outbound_rx: mpsc::UnboundedReceiver<Command>,
        keep_alive: Duration,
        shutdown: CancellationToken,
    ) -> Result<(), ClientError> {
        let mut keep_alive_timer = tokio::time::interval(keep_alive);
        keep_alive_timer.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Shutdown requested for connection to {}", shared.endpoint);
                    let _ = framed.close().await;
                    return Ok(());
                }

                // Handle outgoing frames
                outbound = outbound_rx.recv() => {
                    let Some(command) = outbound else {
                        return Ok(());
                    };
                    let owner = FrameOwner::of(&command);
                    match framed.send(command).await {
                        Ok(()) => {}
                        Err(e @ ClientError::Io(_)) => return Err(e),
                        // The codec leaves the write buffer untouched on encode errors
                        Err(e) => Self::reject_frame(shared, owner, e),
                    }
                }

                // Handle incoming frames
                inbound = framed.next() => {
                    match inbound {
                        Some(Ok(command)) => {
                            *shared.last_activity.lock() = Instant::now();
                            if let Some(reply) = Self::dispatch(shared, command) {
                                framed.send(reply).await?;
                            }
                        }
                        Some(Err(e)) => return Err(e),
                        None => {
                            return Err(ClientError::network(format!(
                                "{} closed the connection",
                                shared.endpoint
                            )))
                        }
                    }
                }

                _ = keep_alive_timer.tick() => {
                    let idle = shared.last_activity.lock().elapsed();
                    if idle > keep_alive * 2 {
                        return Err(ClientError::network(format!(
                            "No traffic from {} for {:?}",
                            shared.endpoint, idle
                        )));
                    }
                    framed.send(Command::Ping).await?;
                }
            }
        }
    }

    /// Tell whoever queued an unencodable frame that it was dropped
    fn reject_frame(shared: &Shared, owner: FrameOwner, e: ClientError) {
        warn!("Dropping frame for {}: {}", shared.endpoint, e);
        match owner {
            FrameOwner::Producer {
                producer_id,
                first_sequence_id,
                last_sequence_id,
            } => shared.route(
                producer_id,
                ProducerEvent::FrameRejected {
                    first_sequence_id,
                    last_sequence_id,
                    reason: e.to_string(),
                },
            ),
            FrameOwner::Request(request_id) => {
                if let Some((_, response_tx)) = shared.pending_requests.remove(&request_id) {
                    let _ = response_tx.send(Command::Error {
                        request_id,
                        code: ServerError::InvalidCommand,
                        message: e.to_string(),
                    });
                }
            }
            FrameOwner::Connection => {}
        }
    }

    /// Route an inbound frame; returns a frame to write back, if any
    fn dispatch(shared: &Shared, command: Command) -> Option<Command> {
        match command {
            Command::Ping => return Some(Command::Pong),
            Command::Pong => {}
            Command::SendReceipt {
                producer_id,
                sequence_id,
                ledger_id,
                entry_id,
            } => shared.route(
                producer_id,
                ProducerEvent::Receipt {
                    sequence_id,
                    ledger_id,
                    entry_id,
                },
            ),
            Command::SendError {
                producer_id,
                sequence_id,
                code,
                message,
            } => shared.route(
                producer_id,
                ProducerEvent::SendError {
                    sequence_id,
                    code,
                    message,
                },
            ),
            command => match command.response_request_id() {
                Some(request_id) => match shared.pending_requests.remove(&request_id) {
                    Some((_, response_tx)) => {
                        let _ = response_tx.send(command);
                    }
                    None => warn!(
                        "Received response for unknown request {} from {}",
                        request_id, shared.endpoint
                    ),
                },
                None => warn!("Unexpected frame from {}: {:?}", shared.endpoint, command),
            },
        }
        None
    }
}

/// Who queued an outbound frame
enum FrameOwner {
    Producer {
        producer_id: ProducerId,
        first_sequence_id: SequenceId,
        last_sequence_id: SequenceId,
    },
    Request(RequestId),
    Connection,
}

impl FrameOwner {
    fn of(command: &Command) -> Self {
        match command {
            Command::Send {
                producer_id,
                sequence_id,
                highest_sequence_id,
                ..
            } => FrameOwner::Producer {
                producer_id: *producer_id,
                first_sequence_id: *sequence_id,
                last_sequence_id: *highest_sequence_id,
            },
            Command::Lookup { request_id, .. }
            | Command::Producer { request_id, .. }
            | Command::CloseProducer { request_id, .. } => FrameOwner::Request(*request_id),
            _ => FrameOwner::Connection,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Connection manager for broker sessions, one per client
#[derive(Debug)]
pub struct ConnectionManager {
    connections: DashMap<Endpoint, Arc<Connection>>,
    connect_locks: DashMap<Endpoint, Arc<tokio::sync::Mutex<()>>>,
    credential: Credential,
    config: ClientConfig,
    metrics: Arc<ClientMetrics>,
    next_connection_id: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig, credential: Credential, metrics: Arc<ClientMetrics>) -> Self {
        Self {
            connections: DashMap::new(),
            connect_locks: DashMap::new(),
            credential,
            config,
            metrics,
            next_connection_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Get a healthy connection to `endpoint`, connecting if needed
    pub async fn get_connection(&self, endpoint: &Endpoint) -> Result<Arc<Connection>, ClientError> {
        if let Some(conn) = self.healthy(endpoint) {
            return Ok(conn);
        }

        let lock = self
            .connect_locks
            .entry(endpoint.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have connected while we waited
        if let Some(conn) = self.healthy(endpoint) {
            return Ok(conn);
        }

        let conn = self.connect_with_retry(endpoint).await?;
        self.connections.insert(endpoint.clone(), conn.clone());
        Ok(conn)
    }

    fn healthy(&self, endpoint: &Endpoint) -> Option<Arc<Connection>> {
        let existing = self.connections.get(endpoint).map(|c| c.value().clone())?;
        if existing.is_healthy() {
            return Some(existing);
        }
        debug!("Discarding unhealthy connection to {}", endpoint);
        self.connections
            .remove_if(endpoint, |_, conn| conn.id() == existing.id());
        None
    }

    async fn connect_with_retry(&self, endpoint: &Endpoint) -> Result<Arc<Connection>, ClientError> {
        let mut backoff = Backoff::new(self.config.retry_config.clone());

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(ClientError::ClientClosed);
            }

            let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
            match Connection::connect(id, endpoint.clone(), &self.credential, &self.config).await {
                Ok(conn) => {
                    self.metrics.record_connection_created();
                    return Ok(conn);
                }
                Err(e) => {
                    self.metrics.record_connection_failed();
                    if !e.is_retryable() {
                        warn!("Connecting to {} failed permanently: {}", endpoint, e);
                        return Err(e);
                    }
                    match backoff.next_delay() {
                        Some(delay) => {
                            warn!(
                                "Failed to connect to {} (attempt {}): {}; retrying in {:?}",
                                endpoint,
                                backoff.attempts(),
                                e,
                                delay
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            error!(
                                "Giving up on {} after {} attempts: {}",
                                endpoint,
                                backoff.attempts() + 1,
                                e
                            );
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Close all connections; later `get_connection` calls fail with `ClientClosed`
    pub fn close_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for entry in self.connections.iter() {
            entry.value().close();
        }
        self.connections.clear();
        info!("All broker connections closed");
    }
}
