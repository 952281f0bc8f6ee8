//! Self-healing NSQ producer.
//!
//! Given a set of discovery (nsqlookupd) endpoints, a [`Selector`] finds the
//! broker (nsqd) nodes they advertise, connects to exactly one of them, and
//! publishes through it. When that node stops answering, the selector
//! releases it, picks the next healthy node, and rediscovers when the pool
//! runs dry.
//!
//! # Quick Start
//!
//! ```no_run
//! use nsq_proxy::{Selector, SelectorConfig};
//!
//! #[tokio::main]
//! async fn main() -> nsq_proxy::Result<()> {
//!     let config = SelectorConfig::builder()
//!         .with_endpoints(["10.0.0.10:4161", "10.0.0.11:4161"])
//!         .with_retry_cycles(2)
//!         .build()?;
//!
//!     let selector = Selector::connect(config).await?;
//!     selector.publish("orders", b"{\"id\":42}").await?;
//!     selector.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Selector (Publisher)                       │
//! │  .publish() │ .multi_publish() │ .stop() │ .set_logger()    │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  ConnectionManager                          │
//! │  acquire │ release │ retry_acquire │ refresh │ stop         │
//! ├──────────────────────────────┬──────────────────────────────┤
//! │  Discovery (HttpDiscovery)   │  Connector (TcpConnector)    │
//! │  GET /nodes → NodePool       │  NsqConnection: PUB / MPUB   │
//! └──────────────────────────────┴──────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod connection;
mod discovery;
mod error;
mod logging;
pub mod mock;
mod pool;
mod selector;
mod transport;

#[cfg(test)]
mod testing;

// Public API exports
pub use config::{ProducerConfig, SelectorConfig, SelectorConfigBuilder};
pub use connection::{ConnectionManager, ConnectionState};
pub use discovery::{Discovery, HttpDiscovery, fetch_from_any};
pub use error::{ProxyError, Result};
pub use logging::{LogConfig, LogLevel};
pub use pool::{BrokerNode, NodePool};
pub use selector::{Publisher, Selector, is_valid_topic_name};
pub use transport::{BrokerConnection, Connector, NsqConnection, TcpConnector};
