//! Configuration types for Quiver client

use crate::endpoint::Endpoint;
use crate::error::ClientError;
use crate::protocol::{MAX_BATCH_BYTES, MAX_STRING_LEN};
use config::{Config, Environment};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker service URL, `pulsar://host:port` or `pulsar+ssl://host:port`
    pub service_url: String,
    /// Inline bearer token
    pub auth_token: Option<String>,
    /// File holding the bearer token; re-read on every connect
    pub auth_token_file: Option<PathBuf>,
    /// PEM bundle of trust anchors used to verify the broker certificate
    pub tls_trust_certs_file_path: Option<PathBuf>,
    /// Connection timeout
    pub connection_timeout: Duration,
    /// Timeout for lookup and producer registration requests
    pub operation_timeout: Duration,
    /// Interval between keep-alive pings
    pub keep_alive_interval: Duration,
    /// Reconnection policy
    pub retry_config: RetryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            service_url: "pulsar://localhost:6650".to_string(),
            auth_token: None,
            auth_token_file: None,
            tls_trust_certs_file_path: None,
            connection_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(30),
            keep_alive_interval: Duration::from_secs(30),
            retry_config: RetryConfig::default(),
        }
    }
}

/// Environment overlay for `ClientConfig`, read from `QUIVER_*` variables
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    service_url: Option<String>,
    auth_token: Option<String>,
    auth_token_file: Option<String>,
    tls_trust_certs_file_path: Option<String>,
    connection_timeout_ms: Option<u64>,
    operation_timeout_ms: Option<u64>,
}

impl ClientConfig {
    /// Build a configuration from defaults overlaid with `QUIVER_*` environment variables
    pub fn from_env() -> Result<Self, ClientError> {
        let settings = Config::builder()
            .add_source(Environment::with_prefix("QUIVER"))
            .build()
            .map_err(|e| ClientError::invalid_config(e.to_string()))?;

        let overrides = settings
            .try_deserialize::<EnvOverrides>()
            .map_err(|e| ClientError::invalid_config(e.to_string()))?;

        let mut config = ClientConfig::default();
        if let Some(url) = overrides.service_url {
            config.service_url = url;
        }
        config.auth_token = overrides.auth_token.or(config.auth_token);
        config.auth_token_file = overrides
            .auth_token_file
            .map(PathBuf::from)
            .or(config.auth_token_file);
        config.tls_trust_certs_file_path = overrides
            .tls_trust_certs_file_path
            .map(PathBuf::from)
            .or(config.tls_trust_certs_file_path);
        if let Some(ms) = overrides.connection_timeout_ms {
            config.connection_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.operation_timeout_ms {
            config.operation_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the client cannot operate with
    pub fn validate(&self) -> Result<(), ClientError> {
        let endpoint = Endpoint::parse(&self.service_url)?;
        if endpoint.tls && self.tls_trust_certs_file_path.is_none() {
            return Err(ClientError::invalid_config(
                "TLS service URL requires tls_trust_certs_file_path",
            ));
        }
        if self.auth_token.is_some() && self.auth_token_file.is_some() {
            return Err(ClientError::invalid_config(
                "auth_token and auth_token_file are mutually exclusive",
            ));
        }
        if self.connection_timeout.is_zero() || self.operation_timeout.is_zero() {
            return Err(ClientError::invalid_config("timeouts must be non-zero"));
        }
        if self.keep_alive_interval.is_zero() {
            return Err(ClientError::invalid_config(
                "keep_alive_interval must be non-zero",
            ));
        }
        self.retry_config.validate()
    }
}

/// Producer-specific configuration
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Producer name; assigned by the broker when `None`
    pub producer_name: Option<String>,
    /// Group messages into batches
    pub batching_enabled: bool,
    /// Flush once this many messages are batched
    pub batching_max_messages: usize,
    /// Flush a non-empty batch at least this often
    pub batching_max_delay: Duration,
    /// Flush once the batched messages would encode to more than this many bytes
    pub batching_max_bytes: usize,
    /// Fail messages not acknowledged within this window; zero disables
    pub send_timeout: Duration,
    /// Upper bound on unacknowledged messages
    pub max_pending_messages: usize,
    /// Resend attempts per message after connection loss
    pub max_retries: u32,
    /// How long `close` waits for outstanding acknowledgments
    pub close_timeout: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            producer_name: None,
            batching_enabled: true,
            batching_max_messages: 1000,
            batching_max_delay: Duration::from_millis(10),
            batching_max_bytes: 128 * 1024,
            send_timeout: Duration::from_secs(30),
            max_pending_messages: 1000,
            max_retries: 3,
            close_timeout: Duration::from_secs(30),
        }
    }
}

impl ProducerConfig {
    /// Messages per wire batch after applying `batching_enabled`
    pub fn effective_batch_size(&self) -> usize {
        if self.batching_enabled {
            self.batching_max_messages
        } else {
            1
        }
    }

    /// Byte budget per wire batch, never above what one frame can carry.
    /// A single message larger than the budget still travels alone.
    pub fn effective_batch_bytes(&self) -> usize {
        self.batching_max_bytes.min(MAX_BATCH_BYTES)
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.batching_max_messages == 0 {
            return Err(ClientError::invalid_config(
                "batching_max_messages must be at least 1",
            ));
        }
        if self.batching_max_delay.is_zero() {
            return Err(ClientError::invalid_config(
                "batching_max_delay must be non-zero",
            ));
        }
        if self.max_pending_messages == 0 {
            return Err(ClientError::invalid_config(
                "max_pending_messages must be at least 1",
            ));
        }
        if let Some(name) = &self.producer_name {
            if name.trim().is_empty() {
                return Err(ClientError::invalid_config("producer_name is empty"));
            }
            if name.len() > MAX_STRING_LEN {
                return Err(ClientError::invalid_config(format!(
                    "producer_name is longer than {} bytes",
                    MAX_STRING_LEN
                )));
            }
        }
        if self.batching_max_bytes == 0 {
            return Err(ClientError::invalid_config(
                "batching_max_bytes must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: u32,
    /// Initial retry delay
    pub initial_delay: Duration,
    /// Maximum retry delay
    pub max_delay: Duration,
    /// Retry delay multiplier
    pub multiplier: f64,
    /// Jitter for retry delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ClientError> {
        if self.multiplier < 1.0 {
            return Err(ClientError::invalid_config(
                "retry multiplier must be >= 1.0",
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ClientError::invalid_config(
                "retry initial_delay exceeds max_delay",
            ));
        }
        Ok(())
    }
}

/// Builder for ClientConfig
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.service_url = url.into();
        self
    }

    pub fn auth_token<S: Into<String>>(mut self, token: S) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    pub fn auth_token_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.auth_token_file = Some(path.into());
        self
    }

    pub fn tls_trust_certs_file_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.config.tls_trust_certs_file_path = Some(path.into());
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.config.connection_timeout = timeout;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.config.keep_alive_interval = interval;
        self
    }

    pub fn retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.config.retry_config = retry_config;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Builder for ProducerConfig
#[derive(Debug, Default)]
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn producer_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.producer_name = Some(name.into());
        self
    }

    pub fn batching_enabled(mut self, enabled: bool) -> Self {
        self.config.batching_enabled = enabled;
        self
    }

    pub fn batching_max_messages(mut self, max: usize) -> Self {
        self.config.batching_max_messages = max;
        self
    }

    pub fn batching_max_delay(mut self, delay: Duration) -> Self {
        self.config.batching_max_delay = delay;
        self
    }

    pub fn batching_max_bytes(mut self, max: usize) -> Self {
        self.config.batching_max_bytes = max;
        self
    }

    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    pub fn max_pending_messages(mut self, max: usize) -> Self {
        self.config.max_pending_messages = max;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    pub fn build(self) -> ProducerConfig {
        self.config
    }
}
