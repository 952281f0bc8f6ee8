//! Broker discovery over the lookup HTTP API.
//!
//! A discovery endpoint answers `GET /nodes` with an envelope listing the
//! broker nodes it knows about:
//!
//! ```text
//! { "status_code": 200, "status_text": "OK",
//!   "data": { "producers": [ { "broadcast_address": "10.0.0.1",
//!                              "tcp_port": 4150, "topics": ["t"] } ] } }
//! ```
//!
//! [`fetch_from_any`] walks the configured endpoints in order and returns the
//! first answer. It does not merge answers from several endpoints.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use nsq_proxy::{HttpDiscovery, fetch_from_any};
//!
//! # async fn example() -> nsq_proxy::Result<()> {
//! let discovery = HttpDiscovery::new(Duration::from_secs(2), Vec::new())?;
//! let endpoints = vec!["10.0.0.10:4161".to_owned(), "10.0.0.11:4161".to_owned()];
//! let nodes = fetch_from_any(&discovery, &endpoints).await?;
//! # Ok(())
//! # }
//! ```

use std::{future::Future, time::Duration};

use reqwest::StatusCode;
use serde::Deserialize;
use snafu::{ResultExt, ensure};
use tracing::debug;

use crate::{
    config::{SelectorConfig, endpoint_base_url},
    error::{
        ConfigSnafu, DiscoveryDecodeSnafu, DiscoveryHttpStatusSnafu, DiscoveryRequestSnafu,
        DiscoveryStatusSnafu, NoEndpointAvailableSnafu, Result,
    },
    pool::BrokerNode,
};

/// Application-level status code that marks a successful discovery answer.
const STATUS_OK: i64 = 200;

/// Path of the node listing on a discovery endpoint.
const NODES_PATH: &str = "/nodes";

/// Source of broker node listings.
///
/// [`HttpDiscovery`] is the production implementation. Tests substitute
/// their own to script endpoint behaviour.
pub trait Discovery: Send + Sync + 'static {
    /// Fetches the current broker nodes from a single endpoint.
    ///
    /// # Errors
    ///
    /// Returns a discovery error if the endpoint cannot be reached or its
    /// answer is not a successful node listing.
    fn fetch_nodes(&self, endpoint: &str) -> impl Future<Output = Result<Vec<BrokerNode>>> + Send;
}

#[derive(Debug, Deserialize)]
struct NodesResponse {
    status_code: i64,
    #[serde(default)]
    status_text: String,
    #[serde(default)]
    data: Option<NodesData>,
}

#[derive(Debug, Deserialize)]
struct NodesData {
    #[serde(default)]
    producers: Option<Vec<BrokerNode>>,
}

/// Discovery client for the lookup HTTP API.
#[derive(Debug, Clone)]
pub struct HttpDiscovery {
    client: reqwest::Client,
    query: Vec<(String, String)>,
}

impl HttpDiscovery {
    /// Creates a client with a per-request timeout and extra query arguments.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn new(timeout: Duration, query: Vec<(String, String)>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build().map_err(|e| {
            ConfigSnafu { message: format!("failed to build discovery HTTP client: {e}") }.build()
        })?;

        Ok(Self { client, query })
    }

    /// Creates a client from the selector's discovery settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the HTTP client cannot be built.
    pub fn from_config(config: &SelectorConfig) -> Result<Self> {
        Self::new(config.discovery_timeout(), config.discovery_query().to_vec())
    }
}

impl Discovery for HttpDiscovery {
    async fn fetch_nodes(&self, endpoint: &str) -> Result<Vec<BrokerNode>> {
        let url = format!("{}{NODES_PATH}", endpoint_base_url(endpoint)?);

        let mut request = self.client.get(&url);
        if !self.query.is_empty() {
            request = request.query(&self.query);
        }

        let response = request.send().await.context(DiscoveryRequestSnafu { endpoint })?;

        let status = response.status();
        ensure!(
            status == StatusCode::OK,
            DiscoveryHttpStatusSnafu { endpoint, status: status.as_u16() }
        );

        let body = response.bytes().await.context(DiscoveryRequestSnafu { endpoint })?;
        parse_nodes(endpoint, &body)
    }
}

/// Decodes a discovery envelope and returns its node list.
pub(crate) fn parse_nodes(endpoint: &str, body: &[u8]) -> Result<Vec<BrokerNode>> {
    let response: NodesResponse =
        serde_json::from_slice(body).context(DiscoveryDecodeSnafu { endpoint })?;

    ensure!(
        response.status_code == STATUS_OK,
        DiscoveryStatusSnafu {
            endpoint,
            status_code: response.status_code,
            status_text: response.status_text,
        }
    );

    Ok(response.data.and_then(|data| data.producers).unwrap_or_default())
}

/// Queries `endpoints` in order and returns the first successful listing.
///
/// An empty listing is a successful answer and is returned as-is. Errors
/// from individual endpoints are logged and skipped.
///
/// # Errors
///
/// - [`Config`](crate::ProxyError::Config) if `endpoints` is empty.
/// - [`NoEndpointAvailable`](crate::ProxyError::NoEndpointAvailable) if every endpoint failed.
pub async fn fetch_from_any<D: Discovery>(
    discovery: &D,
    endpoints: &[String],
) -> Result<Vec<BrokerNode>> {
    ensure!(!endpoints.is_empty(), ConfigSnafu { message: "discovery endpoint list is empty" });

    let mut last_error = String::new();

    for endpoint in endpoints {
        match discovery.fetch_nodes(endpoint).await {
            Ok(nodes) => {
                debug!(endpoint = %endpoint, nodes = nodes.len(), "discovery succeeded");
                return Ok(nodes);
            },
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "discovery endpoint failed, trying next");
                last_error = e.to_string();
            },
        }
    }

    NoEndpointAvailableSnafu { attempted: endpoints.len(), last_error }.fail()
}
