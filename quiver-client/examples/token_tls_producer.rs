//! Publish ten messages over TLS with token authentication

use clap::Parser;
use quiver_client::*;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "token_tls_producer")]
#[command(about = "Send ten messages to a topic and wait for every acknowledgment")]
struct Args {
    #[arg(long, env = "QUIVER_SERVICE_URL", default_value = "pulsar+ssl://localhost:6651")]
    service_url: String,

    /// Bearer token
    #[arg(long, env = "QUIVER_AUTH_TOKEN")]
    token: Option<String>,

    /// File holding the bearer token
    #[arg(long, env = "QUIVER_AUTH_TOKEN_FILE", conflicts_with = "token")]
    token_file: Option<PathBuf>,

    /// PEM bundle used to verify the broker certificate
    #[arg(long, env = "QUIVER_TLS_TRUST_CERTS_FILE_PATH")]
    trust_certs: Option<PathBuf>,

    #[arg(short, long, default_value = "persistent://public/default/my-topic")]
    topic: String,

    #[arg(short, long, default_value = "10")]
    count: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = ClientConfigBuilder::new()
        .service_url(&args.service_url)
        .operation_timeout(Duration::from_secs(10));
    if let Some(token) = args.token {
        config = config.auth_token(token);
    }
    if let Some(path) = args.token_file {
        config = config.auth_token_file(path);
    }
    if let Some(path) = args.trust_certs {
        config = config.tls_trust_certs_file_path(path);
    }

    let client = Client::new(config.build())?;
    let producer = client
        .producer(&args.topic)
        .producer_name("token-tls-example")
        .create()
        .await?;
    info!("Producer {:?} ready on {}", producer.producer_name(), producer.topic());

    let mut pending = Vec::with_capacity(args.count);
    for i in 0..args.count {
        let message = Message::new(format!("Hello World! {}", i)).with_property("index", i.to_string());
        pending.push(producer.send(message)?);
    }

    for sent in pending {
        let sequence_id = sent.sequence_id();
        match sent.await {
            Ok(id) => info!(
                "Message {} persisted at {}:{}",
                sequence_id, id.ledger_id, id.entry_id
            ),
            Err(e) => error!("Message {} failed: {}", sequence_id, e),
        }
    }

    producer.close().await?;
    client.close().await?;

    let metrics = client.metrics();
    info!(
        "Sent {} messages in {} batches, average ack latency {:.0}us",
        metrics.messages_acknowledged, metrics.batches_flushed, metrics.average_ack_latency_us
    );
    Ok(())
}
