//! # Quiver Client Library
//!
//! An async Rust producer client for persistent-topic message brokers.
//!
//! ## Features
//!
//! - **Topic Lookup**: Resolves the owning broker per topic, cached per client
//! - **Batching**: Size- and time-bounded batches with strictly increasing sequence ids
//! - **Delivery Tracking**: Cumulative receipts complete every message exactly once
//! - **Reconnection**: Exponential backoff; unacknowledged messages are resent with their original ids
//! - **Security**: Token authentication and TLS with a configurable trust bundle
//! - **Observability**: Built-in metrics and tracing support
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use quiver_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::new(
//!         ClientConfigBuilder::new()
//!             .service_url("pulsar://localhost:6650")
//!             .auth_token("my-token")
//!             .build(),
//!     )?;
//!
//!     let producer = client.producer("my-topic").create().await?;
//!
//!     let pending: Vec<_> = (0..10)
//!         .map(|i| producer.send(format!("Hello World! {}", i)))
//!         .collect::<Result<_>>()?;
//!     for sent in pending {
//!         sent.await?;
//!     }
//!
//!     let id = producer.send_sync("last one").await?;
//!     println!("Persisted at {}:{}", id.ledger_id, id.entry_id);
//!
//!     producer.close().await?;
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod lookup;
pub mod metrics;
pub mod producer;
pub mod protocol;
pub mod tls;
pub mod topic;
pub mod tracker;

#[cfg(test)]
mod mock_broker;

pub use auth::{Authentication, Credential, NoAuthentication, TokenAuthentication};
pub use client::Client;
pub use config::*;
pub use error::*;
pub use metrics::MetricsSnapshot;
pub use producer::{Producer, ProducerBuilder, ProducerStatus, SendFuture};
pub use protocol::{Message, MessageId, SequenceId};
pub use tls::TlsError;
pub use topic::{TopicDomain, TopicName};

/// Client library result type
pub type Result<T> = std::result::Result<T, ClientError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
