//! Connection manager: the node-selection state machine.
//!
//! The manager owns the node pool and at most one live broker connection.
//!
//! ```text
//!            acquire: first node that builds and answers a probe
//!   ┌───────┐ ───────────────────────────────────────────▶ ┌──────┐
//!   │ Empty │                                              │ Live │ ◀─┐ acquire: probe ok,
//!   └───────┘ ◀─────────────────────────────────────────── └──────┘ ──┘ connection reused
//!        ▲      release / stop / failed probe
//!        │
//!        └── retry_acquire: stop, then up to `retry_cycles` rounds of
//!            discovery, pool replace, acquire
//! ```
//!
//! Per-node failures never escape a selection pass: the node is marked
//! unusable and the next one is tried. Callers see an error only when the
//! pool runs out of usable nodes.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{
    config::{ProducerConfig, SelectorConfig},
    discovery::{Discovery, fetch_from_any},
    error::{NoHealthyNodeSnafu, Result},
    logging::LogConfig,
    pool::{BrokerNode, NodePool},
    transport::{BrokerConnection, Connector},
};

/// Observable state of a [`ConnectionManager`].
///
/// Probing happens inside [`ConnectionManager::acquire`] while the manager is
/// exclusively borrowed, so it is never observed from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection is held.
    Empty,
    /// A probed connection to the in-use node is held.
    Live,
}

/// Owns the node pool and the single live broker connection.
pub struct ConnectionManager<D: Discovery, C: Connector> {
    endpoints: Vec<String>,
    retry_cycles: u32,
    discovery: D,
    connector: C,
    producer: ProducerConfig,
    log: Arc<RwLock<LogConfig>>,
    pool: NodePool,
    current: Option<C::Connection>,
}

impl<D: Discovery, C: Connector> std::fmt::Debug for ConnectionManager<D, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoints", &self.endpoints)
            .field("retry_cycles", &self.retry_cycles)
            .field("pool", &self.pool)
            .field("current", &self.current.as_ref().map(BrokerConnection::address))
            .finish_non_exhaustive()
    }
}

impl<D: Discovery, C: Connector> ConnectionManager<D, C> {
    /// Creates a manager with an empty pool and no connection.
    ///
    /// `log` is shared with the owner; connections built later read the
    /// value it holds at build time.
    #[must_use]
    pub fn new(
        config: &SelectorConfig,
        discovery: D,
        connector: C,
        log: Arc<RwLock<LogConfig>>,
    ) -> Self {
        Self {
            endpoints: config.endpoints().to_vec(),
            retry_cycles: config.retry_cycles(),
            discovery,
            connector,
            producer: config.producer().clone(),
            log,
            pool: NodePool::default(),
            current: None,
        }
    }

    /// Returns whether a connection is held.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        if self.current.is_some() { ConnectionState::Live } else { ConnectionState::Empty }
    }

    /// Returns the current node pool.
    #[must_use]
    pub fn pool(&self) -> &NodePool {
        &self.pool
    }

    /// Returns the node backing the live connection.
    #[must_use]
    pub fn current_node(&self) -> Option<&BrokerNode> {
        self.current.as_ref().and(self.pool.in_use_node())
    }

    /// Returns the number of discovery-and-reselect cycles.
    #[must_use]
    pub fn retry_cycles(&self) -> u32 {
        self.retry_cycles
    }

    /// Replaces the pool with one fresh discovery result.
    ///
    /// Any live connection is released first, since its node is not part of
    /// the new snapshot. On discovery failure the manager is left untouched.
    ///
    /// Returns the number of nodes discovered.
    ///
    /// # Errors
    ///
    /// Returns the discovery error from [`fetch_from_any`].
    pub async fn refresh(&mut self) -> Result<usize> {
        let nodes = fetch_from_any(&self.discovery, &self.endpoints).await?;

        self.release();
        self.pool.replace(nodes);
        info!(nodes = self.pool.len(), "node pool refreshed");

        Ok(self.pool.len())
    }

    /// Returns a live connection, selecting a node if needed.
    ///
    /// A held connection is probed and reused if it answers. Otherwise it is
    /// released and the pool is scanned in order; the first node whose
    /// connection builds and answers a probe becomes the in-use node. This
    /// never queries discovery.
    ///
    /// # Errors
    ///
    /// Returns [`NoHealthyNode`](crate::ProxyError::NoHealthyNode) if no usable node
    /// is left.
    pub async fn acquire(&mut self) -> Result<&mut C::Connection> {
        self.ensure_live().await?;
        self.live_connection()
    }

    /// Like [`acquire`](Self::acquire), but falls back to rediscovery.
    ///
    /// When acquiring from the current pool fails, the manager is reset and
    /// up to `retry_cycles` rounds of discovery, pool replacement, and
    /// selection run. The first round that yields a live connection wins.
    ///
    /// # Errors
    ///
    /// Returns the error of the last failed round, or of the initial acquire
    /// when `retry_cycles` is zero.
    pub async fn retry_acquire(&mut self) -> Result<&mut C::Connection> {
        self.ensure_live_with_retry().await?;
        self.live_connection()
    }

    /// Closes the live connection and clears the in-use node.
    ///
    /// The pool is kept, and the released node stays usable.
    pub fn release(&mut self) {
        if let Some(mut conn) = self.current.take() {
            conn.close();
            debug!(address = conn.address(), "released broker connection");
        }
        self.pool.mark_idle();
    }

    /// Closes the live connection and discards the pool. Idempotent.
    pub fn stop(&mut self) {
        self.release();
        self.pool.clear();
    }

    fn live_connection(&mut self) -> Result<&mut C::Connection> {
        let candidates = self.pool.len();
        self.current.as_mut().ok_or_else(|| NoHealthyNodeSnafu { candidates }.build())
    }

    async fn ensure_live(&mut self) -> Result<()> {
        if let Some(conn) = self.current.as_mut() {
            let probe = conn.ping().await;
            match probe {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(address = conn.address(), error = %e, "live connection failed probe");
                    self.release();
                },
            }
        }

        self.select_node().await
    }

    async fn ensure_live_with_retry(&mut self) -> Result<()> {
        let mut last_error = match self.ensure_live().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if self.retry_cycles > 0 {
            warn!(error = %last_error, "no usable node in pool, rediscovering");
        }
        self.stop();

        for cycle in 1..=self.retry_cycles {
            last_error = match self.rediscover(cycle).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
        }

        Err(last_error)
    }

    async fn rediscover(&mut self, cycle: u32) -> Result<()> {
        let nodes = fetch_from_any(&self.discovery, &self.endpoints).await.inspect_err(|e| {
            warn!(cycle, error = %e, "rediscovery failed");
        })?;

        self.pool.replace(nodes);
        info!(cycle, nodes = self.pool.len(), "node pool refreshed");

        self.select_node().await
    }

    /// Scans the pool for the first node that builds and answers a probe.
    async fn select_node(&mut self) -> Result<()> {
        let log = self.log.read().clone();

        while let Some(idx) = self.pool.pick_usable() {
            let Some(address) = self.pool.get(idx).map(BrokerNode::address) else {
                break;
            };

            match try_connect(&self.connector, &self.producer, &address, &log).await {
                Ok(conn) => {
                    self.pool.mark_in_use(idx);
                    self.current = Some(conn);
                    info!(address = %address, "selected broker node");
                    return Ok(());
                },
                Err(e) => {
                    debug!(address = %address, error = %e, "broker node unusable");
                    self.pool.mark_unusable(idx);
                },
            }
        }

        NoHealthyNodeSnafu { candidates: self.pool.len() }.fail()
    }
}

/// Builds a connection and probes it, closing it again if the probe fails.
async fn try_connect<C: Connector>(
    connector: &C,
    producer: &ProducerConfig,
    address: &str,
    log: &LogConfig,
) -> Result<C::Connection> {
    let mut conn = connector.build(address, producer, log)?;

    if let Err(e) = conn.ping().await {
        conn.close();
        return Err(e);
    }

    Ok(conn)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::{
        error::ProxyError,
        logging::LogLevel,
        testing::{ScriptedConnector, ScriptedDiscovery},
    };

    const LOOKUPD: &str = "lookupd:4161";
    const A: &str = "10.0.0.1:4150";
    const B: &str = "10.0.0.2:4150";
    const C: &str = "10.0.0.3:4150";

    fn node(addr: &str) -> BrokerNode {
        let (host, port) = addr.split_once(':').unwrap();
        BrokerNode::new(host, port.parse().unwrap(), ["events"])
    }

    struct Harness {
        discovery: ScriptedDiscovery,
        connector: ScriptedConnector,
        log: Arc<RwLock<LogConfig>>,
        manager: ConnectionManager<ScriptedDiscovery, ScriptedConnector>,
    }

    fn harness(retry_cycles: u32, nodes: &[&str]) -> Harness {
        let config = SelectorConfig::builder()
            .with_endpoint(LOOKUPD)
            .with_retry_cycles(retry_cycles)
            .build()
            .unwrap();

        let discovery = ScriptedDiscovery::default();
        discovery.answer(LOOKUPD, nodes.iter().map(|n| node(n)).collect());
        let connector = ScriptedConnector::default();
        let log = Arc::new(RwLock::new(LogConfig::disabled()));

        let manager =
            ConnectionManager::new(&config, discovery.clone(), connector.clone(), Arc::clone(&log));

        Harness { discovery, connector, log, manager }
    }

    #[tokio::test]
    async fn starts_empty() {
        let h = harness(1, &[A]);
        assert_eq!(h.manager.state(), ConnectionState::Empty);
        assert!(h.manager.pool().is_empty());
        assert!(h.manager.current_node().is_none());
    }

    #[tokio::test]
    async fn acquire_picks_first_healthy_node() {
        let mut h = harness(1, &[A, B, C]);
        h.connector.set_reachable(A, false);
        h.manager.refresh().await.unwrap();

        let conn = h.manager.acquire().await.unwrap();
        assert_eq!(conn.address(), B);

        assert_eq!(h.manager.state(), ConnectionState::Live);
        assert_eq!(h.manager.current_node().unwrap().address(), B);
        assert_eq!(h.manager.pool().in_use(), Some(1));
        assert!(!h.manager.pool().get(0).unwrap().is_usable());
        assert!(h.manager.pool().get(2).unwrap().is_usable());
        // The failed candidate's half-built connection was closed.
        assert_eq!(h.connector.closes(A), 1);
        assert_eq!(h.connector.connections(C), 0);
    }

    #[tokio::test]
    async fn acquire_skips_nodes_that_fail_to_build() {
        let mut h = harness(1, &[A, B]);
        h.connector.reject_builds(A);
        h.manager.refresh().await.unwrap();

        assert_eq!(h.manager.acquire().await.unwrap().address(), B);
        assert!(!h.manager.pool().get(0).unwrap().is_usable());
    }

    #[tokio::test]
    async fn acquire_reuses_live_connection() {
        let mut h = harness(1, &[A, B]);
        h.manager.refresh().await.unwrap();

        h.manager.acquire().await.unwrap();
        h.manager.acquire().await.unwrap();

        assert_eq!(h.connector.connections(A), 1);
        assert_eq!(h.connector.pings(A), 2);
        assert_eq!(h.discovery.calls().len(), 1);
    }

    #[tokio::test]
    async fn acquire_fails_when_no_node_answers() {
        let mut h = harness(1, &[A, B]);
        h.connector.set_reachable(A, false);
        h.connector.set_reachable(B, false);
        h.manager.refresh().await.unwrap();

        let err = h.manager.acquire().await.unwrap_err();

        assert!(matches!(err, ProxyError::NoHealthyNode { candidates: 2 }));
        assert_eq!(h.manager.state(), ConnectionState::Empty);
        assert_eq!(h.manager.pool().usable_count(), 0);
    }

    #[tokio::test]
    async fn acquire_on_empty_pool_fails_without_discovery() {
        let mut h = harness(1, &[A]);

        let err = h.manager.acquire().await.unwrap_err();

        assert!(matches!(err, ProxyError::NoHealthyNode { candidates: 0 }));
        assert!(h.discovery.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_probe_reselects_from_pool() {
        let mut h = harness(1, &[A, B]);
        h.manager.refresh().await.unwrap();
        h.manager.acquire().await.unwrap();

        h.connector.set_reachable(A, false);
        let conn = h.manager.acquire().await.unwrap();

        assert_eq!(conn.address(), B);
        assert_eq!(h.connector.closes(A), 2);
        assert_eq!(h.manager.pool().in_use(), Some(1));
        assert_eq!(h.discovery.calls().len(), 1);
    }

    #[tokio::test]
    async fn release_keeps_pool_and_node_usable() {
        let mut h = harness(1, &[A, B]);
        h.manager.refresh().await.unwrap();
        h.manager.acquire().await.unwrap();

        h.manager.release();

        assert_eq!(h.manager.state(), ConnectionState::Empty);
        assert_eq!(h.manager.pool().len(), 2);
        assert_eq!(h.manager.pool().in_use(), None);
        assert!(h.manager.pool().get(0).unwrap().is_usable());
        assert_eq!(h.connector.closes(A), 1);

        // The released node is picked again.
        assert_eq!(h.manager.acquire().await.unwrap().address(), A);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut h = harness(1, &[A]);
        h.manager.refresh().await.unwrap();
        h.manager.acquire().await.unwrap();

        h.manager.stop();
        h.manager.stop();

        assert_eq!(h.manager.state(), ConnectionState::Empty);
        assert!(h.manager.pool().is_empty());
        assert_eq!(h.connector.closes(A), 1);
    }

    #[tokio::test]
    async fn refresh_releases_live_connection() {
        let mut h = harness(1, &[A]);
        h.manager.refresh().await.unwrap();
        h.manager.acquire().await.unwrap();

        h.discovery.answer(LOOKUPD, vec![node(B)]);
        let discovered = h.manager.refresh().await.unwrap();

        assert_eq!(discovered, 1);
        assert_eq!(h.manager.state(), ConnectionState::Empty);
        assert_eq!(h.manager.pool().get(0).unwrap().address(), B);
        assert_eq!(h.connector.closes(A), 1);
    }

    #[tokio::test]
    async fn failed_refresh_leaves_state_untouched() {
        let mut h = harness(1, &[A]);
        h.manager.refresh().await.unwrap();
        h.manager.acquire().await.unwrap();

        h.discovery.fail(LOOKUPD);
        let err = h.manager.refresh().await.unwrap_err();

        assert!(matches!(err, ProxyError::NoEndpointAvailable { attempted: 1, .. }));
        assert_eq!(h.manager.state(), ConnectionState::Live);
        assert_eq!(h.manager.current_node().unwrap().address(), A);
    }

    #[tokio::test]
    async fn retry_acquire_rediscovers_after_pool_exhausted() {
        let mut h = harness(1, &[A]);
        h.manager.refresh().await.unwrap();
        h.manager.acquire().await.unwrap();

        h.connector.set_reachable(A, false);
        h.discovery.answer(LOOKUPD, vec![node(A), node(B)]);

        let conn = h.manager.retry_acquire().await.unwrap();

        assert_eq!(conn.address(), B);
        assert_eq!(h.discovery.calls().len(), 2);
        assert_eq!(h.manager.pool().len(), 2);
        assert_eq!(h.manager.pool().in_use(), Some(1));
    }

    #[tokio::test]
    async fn retry_acquire_does_not_rediscover_when_live() {
        let mut h = harness(3, &[A]);
        h.manager.refresh().await.unwrap();

        h.manager.retry_acquire().await.unwrap();
        h.manager.retry_acquire().await.unwrap();

        assert_eq!(h.discovery.calls().len(), 1);
    }

    #[tokio::test]
    async fn retry_acquire_with_zero_cycles_never_rediscovers() {
        let mut h = harness(0, &[A]);

        let err = h.manager.retry_acquire().await.unwrap_err();

        assert!(matches!(err, ProxyError::NoHealthyNode { candidates: 0 }));
        assert!(h.discovery.calls().is_empty());
    }

    #[tokio::test]
    async fn retry_acquire_runs_every_cycle_before_giving_up() {
        let mut h = harness(3, &[A]);
        h.connector.set_reachable(A, false);

        let err = h.manager.retry_acquire().await.unwrap_err();

        assert!(matches!(err, ProxyError::NoHealthyNode { candidates: 1 }));
        assert_eq!(h.discovery.calls().len(), 3);
        assert_eq!(h.manager.state(), ConnectionState::Empty);
    }

    #[tokio::test]
    async fn retry_acquire_surfaces_last_discovery_error() {
        let mut h = harness(2, &[]);
        h.discovery.fail(LOOKUPD);

        let err = h.manager.retry_acquire().await.unwrap_err();

        assert!(matches!(err, ProxyError::NoEndpointAvailable { attempted: 1, .. }));
        assert_eq!(h.discovery.calls().len(), 2);
    }

    #[tokio::test]
    async fn retry_acquire_recovers_once_discovery_answers() {
        let mut h = harness(2, &[A]);
        h.discovery.fail(LOOKUPD);

        let first = h.manager.retry_acquire().await.unwrap_err();
        assert!(first.is_discovery());

        h.discovery.answer(LOOKUPD, vec![node(A)]);
        assert_eq!(h.manager.retry_acquire().await.unwrap().address(), A);
    }

    #[tokio::test]
    async fn empty_discovery_answer_yields_no_healthy_node() {
        let mut h = harness(1, &[]);

        let err = h.manager.retry_acquire().await.unwrap_err();

        assert!(matches!(err, ProxyError::NoHealthyNode { candidates: 0 }));
        assert_eq!(h.discovery.calls(), vec![LOOKUPD.to_owned()]);
    }

    #[tokio::test]
    async fn new_connections_use_current_log_config() {
        let mut h = harness(1, &[A, B]);
        h.manager.refresh().await.unwrap();
        h.manager.acquire().await.unwrap();

        let updated = LogConfig::new(LogLevel::Warning).with_label("orders");
        *h.log.write() = updated.clone();

        // The live connection keeps the settings it was built with.
        assert_eq!(h.manager.acquire().await.unwrap().log(), &LogConfig::disabled());

        h.manager.release();
        assert_eq!(h.manager.acquire().await.unwrap().log(), &updated);
        assert_eq!(h.connector.built_logs(), vec![LogConfig::disabled(), updated]);
    }
}
