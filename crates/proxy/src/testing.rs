//! In-memory discovery and broker doubles for unit tests.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use snafu::IntoError;

use crate::{
    config::ProducerConfig,
    discovery::Discovery,
    error::{
        ConnectSnafu, DiscoveryHttpStatusSnafu, IoSnafu, NotConnectedSnafu, ProtocolSnafu, Result,
    },
    logging::LogConfig,
    pool::BrokerNode,
    transport::{BrokerConnection, Connector},
};

#[derive(Debug, Default)]
struct DiscoveryScript {
    answers: HashMap<String, Option<Vec<BrokerNode>>>,
    calls: Vec<String>,
}

/// Discovery whose per-endpoint answers are set by the test.
///
/// Endpoints without an answer fail with HTTP 503.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedDiscovery {
    script: Arc<Mutex<DiscoveryScript>>,
}

impl ScriptedDiscovery {
    pub(crate) fn answer(&self, endpoint: &str, nodes: Vec<BrokerNode>) {
        self.script.lock().answers.insert(endpoint.to_owned(), Some(nodes));
    }

    pub(crate) fn fail(&self, endpoint: &str) {
        self.script.lock().answers.insert(endpoint.to_owned(), None);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.script.lock().calls.clone()
    }
}

impl Discovery for ScriptedDiscovery {
    async fn fetch_nodes(&self, endpoint: &str) -> Result<Vec<BrokerNode>> {
        let mut script = self.script.lock();
        script.calls.push(endpoint.to_owned());

        match script.answers.get(endpoint) {
            Some(Some(nodes)) => Ok(nodes.clone()),
            _ => DiscoveryHttpStatusSnafu { endpoint, status: 503u16 }.fail(),
        }
    }
}

#[derive(Debug)]
struct FakeBroker {
    reachable: bool,
    reject_builds: bool,
    publish_failures: usize,
    published: Vec<(String, Vec<u8>)>,
    connections: usize,
    closes: usize,
    pings: usize,
}

impl Default for FakeBroker {
    fn default() -> Self {
        Self {
            reachable: true,
            reject_builds: false,
            publish_failures: 0,
            published: Vec::new(),
            connections: 0,
            closes: 0,
            pings: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Cluster {
    brokers: HashMap<String, FakeBroker>,
    built_logs: Vec<LogConfig>,
}

/// Connector over a scripted set of brokers keyed by address.
///
/// Unknown addresses behave as reachable, healthy brokers.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedConnector {
    cluster: Arc<Mutex<Cluster>>,
}

impl ScriptedConnector {
    pub(crate) fn set_reachable(&self, address: &str, reachable: bool) {
        self.cluster.lock().brokers.entry(address.to_owned()).or_default().reachable = reachable;
    }

    pub(crate) fn reject_builds(&self, address: &str) {
        self.cluster.lock().brokers.entry(address.to_owned()).or_default().reject_builds = true;
    }

    pub(crate) fn fail_publishes(&self, address: &str, count: usize) {
        self.cluster.lock().brokers.entry(address.to_owned()).or_default().publish_failures = count;
    }

    pub(crate) fn published(&self, address: &str) -> Vec<(String, Vec<u8>)> {
        self.cluster.lock().brokers.get(address).map(|b| b.published.clone()).unwrap_or_default()
    }

    pub(crate) fn connections(&self, address: &str) -> usize {
        self.cluster.lock().brokers.get(address).map_or(0, |b| b.connections)
    }

    pub(crate) fn closes(&self, address: &str) -> usize {
        self.cluster.lock().brokers.get(address).map_or(0, |b| b.closes)
    }

    pub(crate) fn pings(&self, address: &str) -> usize {
        self.cluster.lock().brokers.get(address).map_or(0, |b| b.pings)
    }

    pub(crate) fn built_logs(&self) -> Vec<LogConfig> {
        self.cluster.lock().built_logs.clone()
    }
}

impl Connector for ScriptedConnector {
    type Connection = FakeConnection;

    fn build(
        &self,
        address: &str,
        _config: &ProducerConfig,
        log: &LogConfig,
    ) -> Result<FakeConnection> {
        let mut cluster = self.cluster.lock();
        cluster.built_logs.push(log.clone());

        let broker = cluster.brokers.entry(address.to_owned()).or_default();
        if broker.reject_builds {
            return ProtocolSnafu { address, message: "rejected by connector" }.fail();
        }
        broker.connections += 1;

        Ok(FakeConnection {
            address: address.to_owned(),
            cluster: Arc::clone(&self.cluster),
            log: log.clone(),
            closed: false,
        })
    }
}

/// Connection to a scripted broker.
#[derive(Debug)]
pub(crate) struct FakeConnection {
    address: String,
    cluster: Arc<Mutex<Cluster>>,
    log: LogConfig,
    closed: bool,
}

impl FakeConnection {
    pub(crate) fn log(&self) -> &LogConfig {
        &self.log
    }

    fn refused() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "broker unreachable")
    }

    fn record(&self, topic: &str, bodies: &[&[u8]]) -> Result<()> {
        let address = self.address.as_str();
        if self.closed {
            return NotConnectedSnafu { address }.fail();
        }

        let mut cluster = self.cluster.lock();
        let broker = cluster.brokers.entry(self.address.clone()).or_default();
        if !broker.reachable {
            return Err(IoSnafu { address }.into_error(Self::refused()));
        }
        if broker.publish_failures > 0 {
            broker.publish_failures -= 1;
            return ProtocolSnafu { address, message: "E_PUB_FAILED" }.fail();
        }

        broker.published.extend(bodies.iter().map(|body| (topic.to_owned(), body.to_vec())));
        Ok(())
    }
}

impl BrokerConnection for FakeConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn ping(&mut self) -> Result<()> {
        let address = self.address.as_str();
        if self.closed {
            return NotConnectedSnafu { address }.fail();
        }

        let mut cluster = self.cluster.lock();
        let broker = cluster.brokers.entry(self.address.clone()).or_default();
        if !broker.reachable {
            return Err(ConnectSnafu { address }.into_error(Self::refused()));
        }
        broker.pings += 1;
        Ok(())
    }

    async fn publish(&mut self, topic: &str, body: &[u8]) -> Result<()> {
        self.record(topic, &[body])
    }

    async fn multi_publish(&mut self, topic: &str, bodies: &[Vec<u8>]) -> Result<()> {
        let bodies: Vec<&[u8]> = bodies.iter().map(Vec::as_slice).collect();
        self.record(topic, &bodies)
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.cluster.lock().brokers.entry(self.address.clone()).or_default().closes += 1;
        }
    }

    fn set_logger(&mut self, log: LogConfig) {
        self.log = log;
    }
}
