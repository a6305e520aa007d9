//! In-process broker speaking the client wire protocol, for tests

use crate::endpoint::Endpoint;
use crate::error::ServerError;
use crate::protocol::{BrokerCodec, Command, LookupOutcome};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// How the mock answers `Send` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckMode {
    /// Cumulative receipt for every frame
    Immediate,
    /// Never answer
    Never,
    /// Answer with a `SendError` carrying this code
    Reject(ServerError),
}

#[derive(Debug, Clone)]
pub struct MockBrokerConfig {
    /// Token the client must present; any credential is accepted when `None`
    pub token: Option<String>,
    pub max_message_size: u32,
    pub ack_mode: AckMode,
    /// Close the first connection, unacknowledged, once it has received this many messages
    pub drop_first_connection_after: Option<usize>,
    /// Topics answered with `TopicNotFound`
    pub unknown_topics: Vec<String>,
    /// Answer this many lookups with a redirect back to the mock
    pub redirect_lookups: usize,
    /// Answer the first producer registration with `ServiceNotReady`
    pub not_owner_once: bool,
    pub ignore_lookups: bool,
    /// Leave pings on the first connection unanswered
    pub ignore_pings_on_first_connection: bool,
    /// Serve `pulsar+ssl://localhost` with this certificate
    pub tls: Option<Arc<ServerConfig>>,
}

impl Default for MockBrokerConfig {
    fn default() -> Self {
        Self {
            token: None,
            max_message_size: 5 * 1024 * 1024,
            ack_mode: AckMode::Immediate,
            drop_first_connection_after: None,
            unknown_topics: Vec::new(),
            redirect_lookups: 0,
            not_owner_once: false,
            ignore_lookups: false,
            ignore_pings_on_first_connection: false,
            tls: None,
        }
    }
}

/// A message as the mock received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub connection: u64,
    pub sequence_id: u64,
    pub payload: String,
}

#[derive(Debug)]
struct MockState {
    config: MockBrokerConfig,
    service_url: String,
    connections: AtomicU64,
    lookups: AtomicUsize,
    send_frames: AtomicUsize,
    producer_requests: AtomicUsize,
    refused_producer: AtomicBool,
    received: Mutex<Vec<Received>>,
    live: Mutex<Vec<CancellationToken>>,
}

#[derive(Debug)]
pub struct MockBroker {
    addr: SocketAddr,
    state: Arc<MockState>,
    shutdown: CancellationToken,
}

impl MockBroker {
    pub async fn start(config: MockBrokerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let acceptor = config.tls.clone().map(TlsAcceptor::from);
        let service_url = match acceptor {
            Some(_) => format!("pulsar+ssl://localhost:{}", addr.port()),
            None => format!("pulsar://{}", addr),
        };
        let state = Arc::new(MockState {
            config,
            service_url,
            connections: AtomicU64::new(0),
            lookups: AtomicUsize::new(0),
            send_frames: AtomicUsize::new(0),
            producer_requests: AtomicUsize::new(0),
            refused_producer: AtomicBool::new(false),
            received: Mutex::new(Vec::new()),
            live: Mutex::new(Vec::new()),
        });
        let shutdown = CancellationToken::new();

        let accept_state = state.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        let number = accept_state.connections.fetch_add(1, Ordering::SeqCst) + 1;
                        let token = accept_shutdown.child_token();
                        accept_state.live.lock().push(token.clone());
                        let state = accept_state.clone();
                        match acceptor.clone() {
                            Some(acceptor) => {
                                tokio::spawn(async move {
                                    // Clients that distrust the certificate abort here
                                    if let Ok(stream) = acceptor.accept(stream).await {
                                        serve(state, stream, number, token).await;
                                    }
                                });
                            }
                            None => {
                                tokio::spawn(serve(state, stream, number, token));
                            }
                        }
                    }
                }
            }
        });

        Self {
            addr,
            state,
            shutdown,
        }
    }

    pub fn service_url(&self) -> String {
        self.state.service_url.clone()
    }

    pub fn endpoint(&self) -> Endpoint {
        match self.state.config.tls {
            Some(_) => Endpoint::new("localhost", self.addr.port(), true),
            None => Endpoint::new(self.addr.ip().to_string(), self.addr.port(), false),
        }
    }

    pub fn connection_count(&self) -> u64 {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn lookup_count(&self) -> usize {
        self.state.lookups.load(Ordering::SeqCst)
    }

    pub fn send_frame_count(&self) -> usize {
        self.state.send_frames.load(Ordering::SeqCst)
    }

    pub fn producer_request_count(&self) -> usize {
        self.state.producer_requests.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().clone()
    }

    pub fn received_payloads(&self) -> Vec<String> {
        self.received().into_iter().map(|r| r.payload).collect()
    }

    /// Drop every open client connection
    pub fn disconnect_all(&self) {
        for token in self.state.live.lock().drain(..) {
            token.cancel();
        }
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn serve<S>(state: Arc<MockState>, stream: S, number: u64, token: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, BrokerCodec::new());

    match framed.next().await {
        Some(Ok(Command::Connect {
            auth_method,
            auth_data,
            ..
        })) => {
            if let Some(expected) = &state.config.token {
                if auth_method != "token" || auth_data.as_ref() != expected.as_bytes() {
                    let _ = framed
                        .send(Command::Error {
                            request_id: 0,
                            code: ServerError::AuthenticationError,
                            message: "invalid token".to_string(),
                        })
                        .await;
                    return;
                }
            }
        }
        _ => return,
    }

    let connected = Command::Connected {
        server_version: "mock-broker".to_string(),
        max_message_size: state.config.max_message_size,
    };
    if framed.send(connected).await.is_err() {
        return;
    }

    let mut entry_id = 0u64;
    let mut received_here = 0usize;

    loop {
        let command = tokio::select! {
            _ = token.cancelled() => return,
            inbound = framed.next() => match inbound {
                Some(Ok(command)) => command,
                _ => return,
            },
        };

        let reply = match command {
            Command::Ping if number == 1 && state.config.ignore_pings_on_first_connection => None,
            Command::Ping => Some(Command::Pong),

            Command::Lookup { request_id, topic } => {
                let lookups = state.lookups.fetch_add(1, Ordering::SeqCst) + 1;
                if state.config.ignore_lookups {
                    None
                } else if state.config.unknown_topics.contains(&topic) {
                    Some(Command::LookupResponse {
                        request_id,
                        outcome: LookupOutcome::Failed {
                            code: ServerError::TopicNotFound,
                            message: format!("{} does not exist", topic),
                        },
                    })
                } else if lookups <= state.config.redirect_lookups {
                    Some(Command::LookupResponse {
                        request_id,
                        outcome: LookupOutcome::Redirect {
                            broker_url: state.service_url.clone(),
                        },
                    })
                } else {
                    Some(Command::LookupResponse {
                        request_id,
                        outcome: LookupOutcome::Connect {
                            broker_url: state.service_url.clone(),
                        },
                    })
                }
            }

            Command::Producer {
                request_id,
                producer_id,
                producer_name,
                ..
            } => {
                state.producer_requests.fetch_add(1, Ordering::SeqCst);
                if state.config.not_owner_once && !state.refused_producer.swap(true, Ordering::SeqCst)
                {
                    Some(Command::Error {
                        request_id,
                        code: ServerError::ServiceNotReady,
                        message: "not the owner".to_string(),
                    })
                } else {
                    Some(Command::ProducerSuccess {
                        request_id,
                        producer_name: producer_name
                            .unwrap_or_else(|| format!("mock-{}", producer_id)),
                        last_sequence_id: -1,
                    })
                }
            }

            Command::Send {
                producer_id,
                highest_sequence_id,
                sequence_id,
                messages,
            } => {
                state.send_frames.fetch_add(1, Ordering::SeqCst);
                received_here += messages.len();
                {
                    let mut received = state.received.lock();
                    for (offset, message) in messages.iter().enumerate() {
                        received.push(Received {
                            connection: number,
                            sequence_id: sequence_id + offset as u64,
                            payload: String::from_utf8_lossy(&message.payload).into_owned(),
                        });
                    }
                }

                if number == 1
                    && state
                        .config
                        .drop_first_connection_after
                        .is_some_and(|limit| received_here >= limit)
                {
                    return;
                }

                match state.config.ack_mode {
                    AckMode::Immediate => {
                        entry_id += 1;
                        Some(Command::SendReceipt {
                            producer_id,
                            sequence_id: highest_sequence_id,
                            ledger_id: number,
                            entry_id,
                        })
                    }
                    AckMode::Never => None,
                    AckMode::Reject(code) => Some(Command::SendError {
                        producer_id,
                        sequence_id: highest_sequence_id,
                        code,
                        message: "rejected by mock".to_string(),
                    }),
                }
            }

            Command::CloseProducer { request_id, .. } => Some(Command::Success { request_id }),

            _ => None,
        };

        if let Some(reply) = reply {
            if framed.send(reply).await.is_err() {
                return;
            }
        }
    }
}

/// Throwaway certificate authority with a `localhost` server certificate
pub struct TestPki {
    pub ca_path: PathBuf,
    pub server_config: Arc<ServerConfig>,
}

impl TestPki {
    /// Write the CA bundle into `dir` and build the matching server config
    pub fn generate(dir: &Path, name: &str) -> Self {
        let mut ca_params = CertificateParams::default();
        ca_params
            .distinguished_name
            .push(DnType::CommonName, format!("{name} test ca"));
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.self_signed(&ca_key).unwrap();

        let mut leaf_params = CertificateParams::default();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, "localhost");
        leaf_params.subject_alt_names = vec![SanType::DnsName("localhost".try_into().unwrap())];
        let leaf_key = KeyPair::generate().unwrap();
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .unwrap();

        let ca_path = dir.join(format!("{name}-ca.pem"));
        std::fs::write(&ca_path, ca_cert.pem()).unwrap();

        let cert_chain = vec![CertificateDer::from(leaf_cert.der().clone())];
        let key_der = PrivatePkcs8KeyDer::from(leaf_key.serialize_der());
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(cert_chain, PrivateKeyDer::Pkcs8(key_der))
            .unwrap();

        Self {
            ca_path,
            server_config: Arc::new(server_config),
        }
    }
}
