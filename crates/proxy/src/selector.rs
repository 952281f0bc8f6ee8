//! Publish façade over the connection manager.
//!
//! [`Selector`] is what applications hold. Every call takes the manager lock
//! for its whole duration, so concurrent publishers queue up behind each
//! other and all see the same "current" connection.
//!
//! A publish makes at most two sends:
//!
//! 1. Acquire a live connection (rediscovering if the pool is exhausted).
//! 2. Send. On success, done.
//! 3. On failure, release the connection, acquire again, and send once more.
//!    The outcome of this second send is final.

use std::{future::Future, sync::Arc};

use parking_lot::RwLock;
use snafu::{ResultExt, ensure};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    config::SelectorConfig,
    connection::{ConnectionManager, ConnectionState},
    discovery::{Discovery, HttpDiscovery},
    error::{ConfigSnafu, InvalidTopicSnafu, PublishSnafu, Result},
    logging::LogConfig,
    pool::BrokerNode,
    transport::{BrokerConnection, Connector, TcpConnector},
};

/// Longest topic name nsqd accepts.
const MAX_TOPIC_LEN: usize = 64;

/// Suffix marking a topic as ephemeral.
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

/// Capability to publish messages to some broker.
///
/// Implemented by [`Selector`]. Code that only publishes can depend on this
/// trait and be handed a test double instead.
pub trait Publisher: Send + Sync {
    /// Publishes one message to `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is invalid, no broker is reachable, or
    /// the message could not be delivered.
    fn publish(&self, topic: &str, body: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Closes the live connection and forgets discovered nodes.
    fn stop(&self) -> impl Future<Output = ()> + Send;

    /// Replaces the logger settings handed to connections built from now on.
    fn set_logger(&self, log: LogConfig);
}

/// Returns whether `name` is a valid NSQ topic name.
///
/// Valid names are 1 to 64 characters of `[.a-zA-Z0-9_-]`, optionally
/// followed by `#ephemeral` (which counts toward the length).
///
/// ```
/// use nsq_proxy::is_valid_topic_name;
///
/// assert!(is_valid_topic_name("orders.v2"));
/// assert!(is_valid_topic_name("scratch#ephemeral"));
/// assert!(!is_valid_topic_name("bad topic"));
/// assert!(!is_valid_topic_name("#ephemeral"));
/// ```
#[must_use]
pub fn is_valid_topic_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_TOPIC_LEN {
        return false;
    }

    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    !base.is_empty()
        && base.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

fn validate_topic(topic: &str) -> Result<()> {
    ensure!(is_valid_topic_name(topic), InvalidTopicSnafu { topic });
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum Message<'a> {
    Single(&'a [u8]),
    Multi(&'a [Vec<u8>]),
}

impl Message<'_> {
    async fn send<B: BrokerConnection>(self, conn: &mut B, topic: &str) -> Result<()> {
        match self {
            Self::Single(body) => conn.publish(topic, body).await,
            Self::Multi(bodies) => conn.multi_publish(topic, bodies).await,
        }
    }
}

/// Self-healing producer holding at most one broker connection.
///
/// # Example
///
/// ```no_run
/// use nsq_proxy::{Selector, SelectorConfig};
///
/// # async fn example() -> nsq_proxy::Result<()> {
/// let config = SelectorConfig::builder()
///     .with_endpoints(["10.0.0.10:4161", "10.0.0.11:4161"])
///     .build()?;
///
/// let selector = Selector::connect(config).await?;
/// selector.publish("orders", b"{\"id\":42}").await?;
/// selector.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Selector<D: Discovery = HttpDiscovery, C: Connector = TcpConnector> {
    manager: Mutex<ConnectionManager<D, C>>,
    log: Arc<RwLock<LogConfig>>,
}

impl<D: Discovery, C: Connector> std::fmt::Debug for Selector<D, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector").field("log", &*self.log.read()).finish_non_exhaustive()
    }
}

impl Selector {
    /// Discovers brokers over HTTP and connects to the first healthy one.
    ///
    /// # Errors
    ///
    /// Returns an error if the discovery client cannot be built, no discovery
    /// endpoint answers, or no discovered node accepts a connection. No
    /// rediscovery is attempted here.
    pub async fn connect(config: SelectorConfig) -> Result<Self> {
        let discovery = HttpDiscovery::from_config(&config)?;
        Self::with_components(config, discovery, TcpConnector).await
    }
}

impl<D: Discovery, C: Connector> Selector<D, C> {
    /// Connects using the given discovery client and connector.
    ///
    /// # Errors
    ///
    /// Same as [`Selector::connect`].
    pub async fn with_components(
        config: SelectorConfig,
        discovery: D,
        connector: C,
    ) -> Result<Self> {
        let log = Arc::new(RwLock::new(config.log().clone()));
        let mut manager = ConnectionManager::new(&config, discovery, connector, Arc::clone(&log));

        manager.refresh().await?;
        let address = manager.acquire().await?.address().to_owned();
        info!(address = %address, retry_cycles = manager.retry_cycles(), "selector connected");

        Ok(Self { manager: Mutex::new(manager), log })
    }

    /// Publishes one message to `topic`.
    ///
    /// # Errors
    ///
    /// - [`InvalidTopic`](crate::ProxyError::InvalidTopic) if the topic name is
    ///   malformed. Nothing is sent.
    /// - Any acquire error if no broker can be reached.
    /// - [`Publish`](crate::ProxyError::Publish) if the retried send fails.
    pub async fn publish(&self, topic: &str, body: &[u8]) -> Result<()> {
        self.send(topic, Message::Single(body)).await
    }

    /// Publishes several messages to `topic` in one `MPUB` command.
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish), plus
    /// [`Config`](crate::ProxyError::Config) for an empty batch.
    pub async fn multi_publish(&self, topic: &str, bodies: &[Vec<u8>]) -> Result<()> {
        ensure!(
            !bodies.is_empty(),
            ConfigSnafu { message: "multi_publish requires at least one message" }
        );
        self.send(topic, Message::Multi(bodies)).await
    }

    /// Closes the live connection and forgets discovered nodes.
    ///
    /// The selector stays usable: the next publish rediscovers.
    pub async fn stop(&self) {
        self.manager.lock().await.stop();
        info!("selector stopped");
    }

    /// Replaces the logger settings handed to connections built from now on.
    ///
    /// The live connection, if any, keeps its current settings.
    pub fn set_logger(&self, log: LogConfig) {
        *self.log.write() = log;
    }

    /// Returns the node backing the live connection.
    pub async fn current_node(&self) -> Option<BrokerNode> {
        self.manager.lock().await.current_node().cloned()
    }

    /// Returns whether a connection is held.
    pub async fn state(&self) -> ConnectionState {
        self.manager.lock().await.state()
    }

    async fn send(&self, topic: &str, message: Message<'_>) -> Result<()> {
        validate_topic(topic)?;

        let mut manager = self.manager.lock().await;

        let first = message.send(manager.retry_acquire().await?, topic).await;
        let Err(e) = first else {
            return Ok(());
        };

        let address = manager.current_node().map(BrokerNode::address);
        warn!(topic, address = ?address, error = %e, "publish failed, reselecting broker");
        manager.release();

        let conn = manager.retry_acquire().await?;
        message.send(conn, topic).await.context(PublishSnafu { topic })
    }
}

impl<D: Discovery, C: Connector> Publisher for Selector<D, C> {
    fn publish(&self, topic: &str, body: &[u8]) -> impl Future<Output = Result<()>> + Send {
        Selector::publish(self, topic, body)
    }

    fn stop(&self) -> impl Future<Output = ()> + Send {
        Selector::stop(self)
    }

    fn set_logger(&self, log: LogConfig) {
        Selector::set_logger(self, log);
    }
}
