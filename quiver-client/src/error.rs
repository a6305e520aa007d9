//! Error types for the Quiver client library

use crate::tls::TlsError;

/// Main error type for Quiver client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// The broker rejected our credentials
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// Transport-level failure; recovered by reconnecting
    #[error("Network error: {message}")]
    Network { message: String },

    /// Could not establish a usable connection while creating a producer
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: Box<ClientError>,
    },

    /// Topic does not exist
    #[error("Topic '{topic}' not found")]
    NotFound { topic: String },

    /// Topic lookup did not complete in time
    #[error("Lookup for topic '{topic}' timed out after {timeout_ms}ms")]
    LookupTimeout { topic: String, timeout_ms: u64 },

    /// Message too large
    #[error("Message size {size} exceeds maximum {max_size}")]
    MessageTooLarge { size: usize, max_size: usize },

    /// Protocol violation by either side
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Timeout errors
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The client has been closed
    #[error("Client is closed")]
    ClientClosed,

    /// The producer has been closed
    #[error("Producer is closed")]
    ProducerClosed,

    /// Too many messages awaiting acknowledgment
    #[error("Producer queue is full ({max_pending} pending messages)")]
    ProducerQueueFull { max_pending: usize },

    /// A message could not be delivered after exhausting its retries
    #[error("Send of sequence {sequence_id} failed after {retries} retries: {reason}")]
    SendFailed {
        sequence_id: u64,
        retries: u32,
        reason: String,
    },

    /// Non-retryable error reported by the broker
    #[error("Broker error {code:?}: {message}")]
    Server { code: ServerError, message: String },

    /// Malformed topic address
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Create a new authentication error
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    /// Create a new protocol error
    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Wrap a connection-setup failure for the given endpoint
    pub fn connect<S: Into<String>>(endpoint: S, source: ClientError) -> Self {
        Self::Connect {
            endpoint: endpoint.into(),
            source: Box::new(source),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. } => true,
            Self::Timeout { .. } => true,
            Self::Io(_) => true,
            Self::Server { code, .. } => code.is_retryable(),
            _ => false,
        }
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Network { .. } | Self::Io(_) | Self::Connect { .. }
        )
    }

    /// Check if this error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::LookupTimeout { .. })
    }

    /// Errors raised while establishing a session; wrapped in `Connect` at
    /// producer creation.
    pub(crate) fn is_connection_setup(&self) -> bool {
        matches!(
            self,
            Self::Auth { .. } | Self::Tls(_) | Self::Network { .. } | Self::Timeout { .. } | Self::Io(_)
        )
    }
}

/// Error codes carried in broker `Error`, `LookupResponse` and `SendError` frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerError {
    /// Unknown server error
    Unknown = -1,
    /// Broker could not persist the message
    PersistenceError = 1,
    /// Credentials were rejected
    AuthenticationError = 2,
    /// Credentials valid but lacking permission
    AuthorizationError = 3,
    /// Topic does not exist
    TopicNotFound = 4,
    /// Broker is not serving this topic (not owner)
    ServiceNotReady = 5,
    /// Another producer with the same name is connected
    ProducerBusy = 6,
    /// Payload exceeds the broker limit
    MessageTooLarge = 7,
    /// Malformed command
    InvalidCommand = 8,
}

impl ServerError {
    /// Codes that are recovered locally by resending
    pub fn is_retryable(self) -> bool {
        matches!(self, ServerError::PersistenceError | ServerError::ServiceNotReady)
    }

    /// Convert error code to a client error
    pub fn to_client_error(self, context: &str, message: &str) -> ClientError {
        match self {
            ServerError::AuthenticationError | ServerError::AuthorizationError => {
                ClientError::auth(format!("{}: {}", context, message))
            }
            ServerError::TopicNotFound => ClientError::NotFound {
                topic: context.to_string(),
            },
            ServerError::InvalidCommand => {
                ClientError::protocol(format!("{}: {}", context, message))
            }
            code => ClientError::Server {
                code,
                message: format!("{}: {}", context, message),
            },
        }
    }
}

impl From<i16> for ServerError {
    fn from(code: i16) -> Self {
        match code {
            1 => ServerError::PersistenceError,
            2 => ServerError::AuthenticationError,
            3 => ServerError::AuthorizationError,
            4 => ServerError::TopicNotFound,
            5 => ServerError::ServiceNotReady,
            6 => ServerError::ProducerBusy,
            7 => ServerError::MessageTooLarge,
            8 => ServerError::InvalidCommand,
            _ => ServerError::Unknown,
        }
    }
}

impl From<ServerError> for i16 {
    fn from(code: ServerError) -> Self {
        code as i16
    }
}
