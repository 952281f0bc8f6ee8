//! Publishes a few messages through a selector.
//!
//! With `NSQ_LOOKUPD` set to a comma-separated list of discovery endpoints,
//! the example talks to a real cluster. Without it, it starts a mock lookupd
//! and two mock nsqd nodes, kills the first one halfway, and shows the
//! failover in the logs.
//!
//! ```text
//! RUST_LOG=nsq_proxy=debug cargo run --example publish
//! NSQ_LOOKUPD=10.0.0.10:4161,10.0.0.11:4161 cargo run --example publish
//! ```

use nsq_proxy::{
    LogConfig, LogLevel, Selector, SelectorConfig,
    mock::{MockLookupd, MockNsqd},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const TOPIC: &str = "example";

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(env_filter).with(fmt::layer()).init();
}

#[tokio::main]
async fn main() -> nsq_proxy::Result<()> {
    init_logging();

    match std::env::var("NSQ_LOOKUPD") {
        Ok(endpoints) => run_against(endpoints.split(',').map(str::trim)).await,
        Err(_) => run_demo().await,
    }
}

async fn run_against<'a>(endpoints: impl Iterator<Item = &'a str>) -> nsq_proxy::Result<()> {
    let config = SelectorConfig::builder()
        .with_endpoints(endpoints)
        .with_log_config(LogConfig::new(LogLevel::Info).with_label("example"))
        .build()?;

    let selector = Selector::connect(config).await?;
    for i in 0..3 {
        selector.publish(TOPIC, format!("message {i}").as_bytes()).await?;
    }
    selector.stop().await;

    Ok(())
}

async fn run_demo() -> nsq_proxy::Result<()> {
    let first = MockNsqd::start().await?;
    let second = MockNsqd::start().await?;
    let lookupd = MockLookupd::start().await?;
    lookupd.set_nodes(vec![first.broker_node([TOPIC]), second.broker_node([TOPIC])]);

    let config = SelectorConfig::builder()
        .with_endpoint(lookupd.endpoint())
        .with_log_config(LogConfig::new(LogLevel::Debug).with_label("demo"))
        .build()?;
    let selector = Selector::connect(config).await?;

    selector.publish(TOPIC, b"first").await?;
    tracing::info!(address = %first.address(), "stopping first broker");
    first.shutdown().await;
    selector.publish(TOPIC, b"second").await?;

    if let Some(node) = selector.current_node().await {
        tracing::info!(address = %node.address(), "publishing through");
    }
    tracing::info!(delivered = second.messages().len(), "second broker received messages");

    selector.stop().await;
    lookupd.shutdown().await;
    Ok(())
}
