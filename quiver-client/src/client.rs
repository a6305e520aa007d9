//! High-level client interface

use crate::auth::Credential;
use crate::config::{ClientConfig, ProducerConfig};
use crate::connection::ConnectionManager;
use crate::endpoint::Endpoint;
use crate::error::ClientError;
use crate::lookup::TopicLookup;
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::producer::{Producer, ProducerBuilder};
use crate::protocol::ProducerId;
use crate::topic::TopicName;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

pub(crate) type ProducerRegistry = DashMap<ProducerId, Producer>;

/// Resources shared by every producer of a client
#[derive(Debug)]
pub(crate) struct ClientShared {
    pub(crate) config: ClientConfig,
    pub(crate) manager: Arc<ConnectionManager>,
    pub(crate) lookup: TopicLookup,
    pub(crate) metrics: Arc<ClientMetrics>,
}

/// Main client: owns broker connections, the lookup cache and live producers
#[derive(Debug)]
pub struct Client {
    shared: Arc<ClientShared>,
    producers: Arc<ProducerRegistry>,
    next_producer_id: AtomicU64,
    closed: AtomicBool,
}

impl Client {
    /// Create a new client. No connection is opened until the first producer.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        config.validate()?;
        let service_endpoint = Endpoint::parse(&config.service_url)?;
        let credential = Credential::from_config(&config)?;
        let metrics = Arc::new(ClientMetrics::default());
        let manager = Arc::new(ConnectionManager::new(
            config.clone(),
            credential,
            metrics.clone(),
        ));
        let lookup = TopicLookup::new(manager.clone(), service_endpoint, metrics.clone());

        info!("Created client for {}", config.service_url);

        Ok(Self {
            shared: Arc::new(ClientShared {
                config,
                manager,
                lookup,
                metrics,
            }),
            producers: Arc::new(DashMap::new()),
            next_producer_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    /// Create a client with default settings for `service_url`
    pub fn from_url<S: Into<String>>(service_url: S) -> Result<Self, ClientError> {
        Self::new(ClientConfig {
            service_url: service_url.into(),
            ..Default::default()
        })
    }

    /// Create a client configured from `QUIVER_*` environment variables
    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Start building a producer for `topic`
    pub fn producer<S: Into<String>>(&self, topic: S) -> ProducerBuilder<'_> {
        ProducerBuilder::new(self, topic.into())
    }

    /// Look up the owning broker and register a producer for `topic`.
    ///
    /// Failures to establish the broker session are reported as
    /// `ClientError::Connect`; nothing is left registered on failure.
    pub async fn create_producer(
        &self,
        topic: &str,
        config: ProducerConfig,
    ) -> Result<Producer, ClientError> {
        self.ensure_open()?;
        let topic = TopicName::parse(topic)?;
        config.validate()?;

        let id = self.next_producer_id.fetch_add(1, Ordering::SeqCst);
        let producer = Producer::create(
            id,
            topic.clone(),
            config,
            self.shared.clone(),
            Arc::downgrade(&self.producers),
        )
        .await
        .map_err(|e| {
            warn!("Failed to create producer for {}: {}", topic, e);
            if e.is_connection_setup() {
                let endpoint = self
                    .shared
                    .lookup
                    .cached(&topic)
                    .map(|endpoint| endpoint.to_string())
                    .unwrap_or_else(|| self.shared.config.service_url.clone());
                ClientError::connect(endpoint, e)
            } else {
                e
            }
        })?;

        self.producers.insert(id, producer.clone());

        // close() may have drained the registry while we were connecting
        if self.is_closed() {
            producer.close().await?;
            return Err(ClientError::ClientClosed);
        }

        Ok(producer)
    }

    /// Close every producer, then every connection. Idempotent.
    pub async fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let producers: Vec<Producer> = self
            .producers
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!("Closing client with {} producers", producers.len());

        for producer in producers {
            if let Err(e) = producer.close().await {
                warn!("Failed to close producer {}: {}", producer.id(), e);
            }
        }
        self.producers.clear();
        self.shared.manager.close_all();

        info!("Client closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Producers created and not yet closed
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.manager.connection_count()
    }

    /// Get snapshot of current metrics
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            Err(ClientError::ClientClosed)
        } else {
            Ok(())
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // No await here: stop producers without draining
        for entry in self.producers.iter() {
            entry.value().abort();
        }
        self.producers.clear();
        self.shared.manager.close_all();
    }
}
