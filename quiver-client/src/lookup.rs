//! Topic ownership lookup with a per-client cache

use crate::connection::ConnectionManager;
use crate::endpoint::Endpoint;
use crate::error::ClientError;
use crate::metrics::ClientMetrics;
use crate::protocol::{Command, LookupOutcome};
use crate::topic::TopicName;
use dashmap::DashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Resolves which broker owns a topic.
///
/// Lookups go to the service endpoint. Answers are cached until a producer
/// reports that the cached broker no longer owns the topic.
#[derive(Debug)]
pub struct TopicLookup {
    manager: Arc<ConnectionManager>,
    service_endpoint: Endpoint,
    cache: DashMap<TopicName, Endpoint>,
    metrics: Arc<ClientMetrics>,
}

impl TopicLookup {
    pub fn new(
        manager: Arc<ConnectionManager>,
        service_endpoint: Endpoint,
        metrics: Arc<ClientMetrics>,
    ) -> Self {
        Self {
            manager,
            service_endpoint,
            cache: DashMap::new(),
            metrics,
        }
    }

    /// Owning broker for `topic`, served from cache when possible.
    /// A missing topic or an unanswered lookup is asked once more before
    /// the error reaches the caller.
    pub async fn resolve(&self, topic: &TopicName) -> Result<Endpoint, ClientError> {
        if let Some(endpoint) = self.cached(topic) {
            self.metrics.record_lookup_cache_hit();
            return Ok(endpoint);
        }

        let endpoint = match self.lookup(topic).await {
            Ok(endpoint) => endpoint,
            Err(e @ (ClientError::NotFound { .. } | ClientError::LookupTimeout { .. })) => {
                warn!("Lookup for {} failed: {}; retrying once", topic, e);
                self.invalidate(topic);
                self.lookup(topic).await?
            }
            Err(e) => return Err(e),
        };
        debug!("Topic {} is served by {}", topic, endpoint);
        self.cache.insert(topic.clone(), endpoint.clone());
        Ok(endpoint)
    }

    pub fn cached(&self, topic: &TopicName) -> Option<Endpoint> {
        self.cache.get(topic).map(|entry| entry.value().clone())
    }

    /// Drop the cached owner so the next `resolve` asks the broker again
    pub fn invalidate(&self, topic: &TopicName) {
        if let Some((_, endpoint)) = self.cache.remove(topic) {
            info!("Invalidated lookup for {} (was {})", topic, endpoint);
        }
    }

    pub fn cache_size(&self) -> usize {
        self.cache.len()
    }

    /// Lookup requests sent to brokers so far
    pub fn round_trips(&self) -> u64 {
        self.metrics.lookup_requests.load(Ordering::Relaxed)
    }

    async fn lookup(&self, topic: &TopicName) -> Result<Endpoint, ClientError> {
        let mut target = self.service_endpoint.clone();
        let mut redirected = false;

        loop {
            match self.lookup_at(&target, topic).await? {
                LookupOutcome::Connect { broker_url } => return Self::parse_broker(&broker_url),
                LookupOutcome::Redirect { broker_url } if !redirected => {
                    debug!("Lookup for {} redirected to {}", topic, broker_url);
                    target = Self::parse_broker(&broker_url)?;
                    redirected = true;
                }
                LookupOutcome::Redirect { broker_url } => {
                    warn!(
                        "Lookup for {} redirected again to {}; giving up",
                        topic, broker_url
                    );
                    return Err(ClientError::NotFound {
                        topic: topic.to_string(),
                    });
                }
                LookupOutcome::Failed { code, message } => {
                    return Err(code.to_client_error(&topic.to_string(), &message));
                }
            }
        }
    }

    async fn lookup_at(
        &self,
        target: &Endpoint,
        topic: &TopicName,
    ) -> Result<LookupOutcome, ClientError> {
        let connection = self.manager.get_connection(target).await?;
        self.metrics.record_lookup();

        let response = connection
            .send_request(Command::Lookup {
                request_id: 0,
                topic: topic.to_string(),
            })
            .await
            .map_err(|e| match e {
                ClientError::Timeout { timeout_ms } => ClientError::LookupTimeout {
                    topic: topic.to_string(),
                    timeout_ms,
                },
                other => other,
            })?;

        match response {
            Command::LookupResponse { outcome, .. } => Ok(outcome),
            Command::Error { code, message, .. } => {
                Err(code.to_client_error(&topic.to_string(), &message))
            }
            other => Err(ClientError::protocol(format!(
                "Unexpected lookup response: {:?}",
                other
            ))),
        }
    }

    fn parse_broker(broker_url: &str) -> Result<Endpoint, ClientError> {
        Endpoint::parse(broker_url).map_err(|e| {
            ClientError::protocol(format!("Broker returned unusable URL {}: {}", broker_url, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credential;
    use crate::config::ClientConfig;
    use crate::mock_broker::{MockBroker, MockBrokerConfig};
    use std::time::Duration;

    fn lookup_for(broker: &MockBroker) -> (TopicLookup, Arc<ClientMetrics>) {
        let config = ClientConfig {
            service_url: broker.service_url(),
            operation_timeout: Duration::from_millis(300),
            ..Default::default()
        };
        let metrics = Arc::new(ClientMetrics::default());
        let credential = Credential::from_config(&config).unwrap();
        let manager = Arc::new(ConnectionManager::new(config, credential, metrics.clone()));
        (
            TopicLookup::new(manager, broker.endpoint(), metrics.clone()),
            metrics,
        )
    }

    #[tokio::test]
    async fn test_resolve_is_cached() {
        let broker = MockBroker::start(MockBrokerConfig::default()).await;
        let (lookup, metrics) = lookup_for(&broker);
        let topic = TopicName::parse("orders").unwrap();

        let first = lookup.resolve(&topic).await.unwrap();
        let second = lookup.resolve(&topic).await.unwrap();

        assert_eq!(first, broker.endpoint());
        assert_eq!(first, second);
        assert_eq!(broker.lookup_count(), 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.lookup_requests, 1);
        assert_eq!(snapshot.lookup_cache_hits, 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_round_trip() {
        let broker = MockBroker::start(MockBrokerConfig::default()).await;
        let (lookup, _) = lookup_for(&broker);
        let topic = TopicName::parse("orders").unwrap();

        lookup.resolve(&topic).await.unwrap();
        lookup.invalidate(&topic);
        assert!(lookup.cached(&topic).is_none());
        lookup.resolve(&topic).await.unwrap();

        assert_eq!(broker.lookup_count(), 2);
        assert_eq!(lookup.round_trips(), 2);
        assert_eq!(lookup.cache_size(), 1);
    }

    #[tokio::test]
    async fn test_redirect_followed_once() {
        let broker = MockBroker::start(MockBrokerConfig {
            redirect_lookups: 1,
            ..Default::default()
        })
        .await;
        let (lookup, _) = lookup_for(&broker);
        let topic = TopicName::parse("orders").unwrap();

        assert_eq!(lookup.resolve(&topic).await.unwrap(), broker.endpoint());
        assert_eq!(broker.lookup_count(), 2);
    }

    #[tokio::test]
    async fn test_repeated_redirect_is_not_found() {
        let broker = MockBroker::start(MockBrokerConfig {
            redirect_lookups: 4,
            ..Default::default()
        })
        .await;
        let (lookup, _) = lookup_for(&broker);
        let topic = TopicName::parse("orders").unwrap();

        let err = lookup.resolve(&topic).await.unwrap_err();
        assert!(matches!(err, ClientError::NotFound { .. }), "{err:?}");
        assert!(lookup.cached(&topic).is_none());
        // Two attempts, each following one redirect
        assert_eq!(broker.lookup_count(), 4);
    }

    #[tokio::test]
    async fn test_second_attempt_recovers_from_redirect_loop() {
        let broker = MockBroker::start(MockBrokerConfig {
            redirect_lookups: 2,
            ..Default::default()
        })
        .await;
        let (lookup, _) = lookup_for(&broker);
        let topic = TopicName::parse("orders").unwrap();

        assert_eq!(lookup.resolve(&topic).await.unwrap(), broker.endpoint());
        assert_eq!(broker.lookup_count(), 3);
    }

    #[tokio::test]
    async fn test_unknown_topic() {
        let broker = MockBroker::start(MockBrokerConfig {
            unknown_topics: vec!["persistent://public/default/missing".to_string()],
            ..Default::default()
        })
        .await;
        let (lookup, _) = lookup_for(&broker);
        let topic = TopicName::parse("missing").unwrap();

        let err = lookup.resolve(&topic).await.unwrap_err();
        match err {
            ClientError::NotFound { topic } => {
                assert_eq!(topic, "persistent://public/default/missing")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(broker.lookup_count(), 2);
    }

    #[tokio::test]
    async fn test_silent_broker_is_lookup_timeout() {
        let broker = MockBroker::start(MockBrokerConfig {
            ignore_lookups: true,
            ..Default::default()
        })
        .await;
        let (lookup, _) = lookup_for(&broker);
        let topic = TopicName::parse("orders").unwrap();

        let err = lookup.resolve(&topic).await.unwrap_err();
        assert!(
            matches!(err, ClientError::LookupTimeout { timeout_ms: 300, .. }),
            "{err:?}"
        );
        assert_eq!(broker.lookup_count(), 2);
        assert_eq!(lookup.round_trips(), 2);
    }
}
