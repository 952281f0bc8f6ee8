//! Selector configuration with builder pattern.
//!
//! Provides type-safe configuration for the selector including:
//! - Discovery endpoints and request settings
//! - The number of discovery-and-reselect cycles after a failed acquire
//! - Per-connection broker settings ([`ProducerConfig`])
//! - Logger settings handed to every new connection

use std::time::Duration;

use snafu::ensure;

use crate::{
    error::{ConfigSnafu, InvalidUrlSnafu, Result},
    logging::LogConfig,
};

/// Default number of discovery-and-reselect cycles.
const DEFAULT_RETRY_CYCLES: u32 = 1;

/// Default discovery request timeout (5 seconds).
const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default broker dial timeout (1 second).
const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Default broker read timeout (60 seconds).
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

/// Default broker write timeout (1 second).
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Configuration for a [`Selector`](crate::Selector).
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Discovery endpoints, tried in order.
    pub(crate) endpoints: Vec<String>,

    /// Discovery-and-reselect cycles run after a failed acquire.
    pub(crate) retry_cycles: u32,

    /// Timeout for a single discovery HTTP request.
    pub(crate) discovery_timeout: Duration,

    /// Extra query arguments appended to every discovery request.
    pub(crate) discovery_query: Vec<(String, String)>,

    /// Settings passed to every broker connection.
    pub(crate) producer: ProducerConfig,

    /// Initial logger settings for broker connections.
    pub(crate) log: LogConfig,
}

impl SelectorConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> SelectorConfigBuilder {
        SelectorConfigBuilder::default()
    }

    /// Returns the configured discovery endpoints.
    #[must_use]
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Returns the number of discovery-and-reselect cycles.
    #[must_use]
    pub fn retry_cycles(&self) -> u32 {
        self.retry_cycles
    }

    /// Returns the discovery request timeout.
    #[must_use]
    pub fn discovery_timeout(&self) -> Duration {
        self.discovery_timeout
    }

    /// Returns the extra discovery query arguments.
    #[must_use]
    pub fn discovery_query(&self) -> &[(String, String)] {
        &self.discovery_query
    }

    /// Returns the broker connection settings.
    #[must_use]
    pub fn producer(&self) -> &ProducerConfig {
        &self.producer
    }

    /// Returns the initial logger settings.
    #[must_use]
    pub fn log(&self) -> &LogConfig {
        &self.log
    }
}

/// Builder for [`SelectorConfig`].
#[derive(Debug, Default)]
pub struct SelectorConfigBuilder {
    endpoints: Vec<String>,
    retry_cycles: Option<u32>,
    discovery_timeout: Option<Duration>,
    discovery_query: Vec<(String, String)>,
    producer: Option<ProducerConfig>,
    log: Option<LogConfig>,
}

impl SelectorConfigBuilder {
    /// Sets the discovery endpoints.
    ///
    /// Endpoints are `host:port` pairs or `http(s)://` URLs. At least one is
    /// required.
    #[must_use]
    pub fn with_endpoints<I, S>(mut self, endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.endpoints = endpoints.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a single discovery endpoint.
    #[must_use]
    pub fn with_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.endpoints.push(endpoint.into());
        self
    }

    /// Sets how many discovery-and-reselect cycles run after a failed acquire.
    ///
    /// Zero disables rediscovery; the selector then only ever uses the pool
    /// it has. Default: 1.
    #[must_use]
    pub fn with_retry_cycles(mut self, cycles: u32) -> Self {
        self.retry_cycles = Some(cycles);
        self
    }

    /// Sets the timeout for a single discovery request.
    ///
    /// Default: 5 seconds.
    #[must_use]
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = Some(timeout);
        self
    }

    /// Appends a query argument to every discovery request.
    #[must_use]
    pub fn with_discovery_query<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.discovery_query.push((key.into(), value.into()));
        self
    }

    /// Sets the broker connection settings.
    ///
    /// Default: [`ProducerConfig::default()`].
    #[must_use]
    pub fn with_producer_config(mut self, producer: ProducerConfig) -> Self {
        self.producer = Some(producer);
        self
    }

    /// Sets the initial logger settings for broker connections.
    ///
    /// Default: [`LogConfig::default()`].
    #[must_use]
    pub fn with_log_config(mut self, log: LogConfig) -> Self {
        self.log = Some(log);
        self
    }

    /// Builds the configuration, validating all settings.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - No endpoints provided
    /// - Any endpoint is malformed
    /// - The discovery timeout is zero
    /// - Any broker timeout is zero
    pub fn build(self) -> Result<SelectorConfig> {
        ensure!(
            !self.endpoints.is_empty(),
            ConfigSnafu { message: "at least one discovery endpoint is required" }
        );

        for endpoint in &self.endpoints {
            endpoint_base_url(endpoint)?;
        }

        let discovery_timeout = self.discovery_timeout.unwrap_or(DEFAULT_DISCOVERY_TIMEOUT);
        ensure!(
            !discovery_timeout.is_zero(),
            ConfigSnafu { message: "discovery_timeout cannot be zero" }
        );

        let producer = self.producer.unwrap_or_default();
        producer.validate()?;

        Ok(SelectorConfig {
            endpoints: self.endpoints,
            retry_cycles: self.retry_cycles.unwrap_or(DEFAULT_RETRY_CYCLES),
            discovery_timeout,
            discovery_query: self.discovery_query,
            producer,
            log: self.log.unwrap_or_default(),
        })
    }
}

/// Settings shared by every broker connection the selector builds.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use nsq_proxy::ProducerConfig;
///
/// let config = ProducerConfig::builder()
///     .dial_timeout(Duration::from_millis(500))
///     .client_id("billing-worker")
///     .build();
/// assert_eq!(config.client_id(), Some("billing-worker"));
/// ```
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Timeout for establishing the TCP connection.
    dial_timeout: Duration,

    /// Timeout for reading a response frame.
    read_timeout: Duration,

    /// Timeout for writing a command.
    write_timeout: Duration,

    /// Client identifier sent in `IDENTIFY`.
    client_id: Option<String>,

    /// Hostname sent in `IDENTIFY`.
    hostname: Option<String>,

    /// User agent sent in `IDENTIFY`.
    user_agent: String,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[bon::bon]
impl ProducerConfig {
    /// Creates a new broker connection configuration.
    #[builder]
    #[must_use]
    pub fn new(
        #[builder(default = DEFAULT_DIAL_TIMEOUT)] dial_timeout: Duration,
        #[builder(default = DEFAULT_READ_TIMEOUT)] read_timeout: Duration,
        #[builder(default = DEFAULT_WRITE_TIMEOUT)] write_timeout: Duration,
        #[builder(into)] client_id: Option<String>,
        #[builder(into)] hostname: Option<String>,
        #[builder(into, default = concat!("nsq-proxy/", env!("CARGO_PKG_VERSION")).to_owned())]
        user_agent: String,
    ) -> Self {
        Self { dial_timeout, read_timeout, write_timeout, client_id, hostname, user_agent }
    }

    /// Returns the dial timeout.
    #[must_use]
    pub fn dial_timeout(&self) -> Duration {
        self.dial_timeout
    }

    /// Returns the read timeout.
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Returns the write timeout.
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// Returns the client identifier, if set.
    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    /// Returns the hostname, if set.
    #[must_use]
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Returns the user agent.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    fn validate(&self) -> Result<()> {
        ensure!(!self.dial_timeout.is_zero(), ConfigSnafu { message: "dial_timeout cannot be zero" });
        ensure!(!self.read_timeout.is_zero(), ConfigSnafu { message: "read_timeout cannot be zero" });
        ensure!(
            !self.write_timeout.is_zero(),
            ConfigSnafu { message: "write_timeout cannot be zero" }
        );
        Ok(())
    }
}

/// Turns a discovery endpoint into a base URL without a trailing slash.
///
/// Bare `host:port` endpoints are treated as plain HTTP.
pub(crate) fn endpoint_base_url(endpoint: &str) -> Result<String> {
    if endpoint.is_empty() {
        return InvalidUrlSnafu { url: endpoint, message: "endpoint cannot be empty" }.fail();
    }

    if endpoint.contains(char::is_whitespace) {
        return InvalidUrlSnafu { url: endpoint, message: "endpoint cannot contain whitespace" }
            .fail();
    }

    let (scheme, rest) = endpoint.split_once("://").unwrap_or(("http", endpoint));

    if scheme != "http" && scheme != "https" {
        return InvalidUrlSnafu { url: endpoint, message: format!("unsupported scheme '{scheme}'") }
            .fail();
    }

    let host = rest.trim_end_matches('/');
    if host.is_empty() {
        return InvalidUrlSnafu { url: endpoint, message: "endpoint must have a host" }.fail();
    }

    Ok(format!("{scheme}://{host}"))
}
