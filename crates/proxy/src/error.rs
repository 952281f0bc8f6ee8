//! Proxy error types with recovery context.
//!
//! Errors fall into three tiers:
//! - **Configuration**: invalid endpoints, timeouts, or topic names
//! - **Discovery**: a lookup endpoint could not be queried or answered badly
//! - **Broker**: a node could not be dialed, probed, or published to
//!
//! Per-node broker errors are normally absorbed by the connection manager,
//! which marks the node unusable and moves on. Callers see them only once
//! every node and every retry cycle has been exhausted.

use snafu::{Location, Snafu};

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Proxy error types with context-rich error messages.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProxyError {
    /// Configuration validation error.
    #[snafu(display("Configuration error: {message}"))]
    Config {
        /// Error description.
        message: String,
    },

    /// Endpoint address could not be turned into a URL.
    #[snafu(display("Invalid URL '{url}': {message}"))]
    InvalidUrl {
        /// The invalid URL.
        url: String,
        /// Parse error description.
        message: String,
    },

    /// Topic name does not follow the NSQ naming rules.
    #[snafu(display("Invalid topic name '{topic}'"))]
    InvalidTopic {
        /// The rejected topic.
        topic: String,
    },

    /// HTTP request to a discovery endpoint failed.
    #[snafu(display("Discovery request to {endpoint} failed at {location}: {source}"))]
    DiscoveryRequest {
        /// Discovery endpoint that was queried.
        endpoint: String,
        /// Underlying HTTP client error.
        source: reqwest::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Discovery endpoint answered with a non-200 HTTP status.
    #[snafu(display("Discovery endpoint {endpoint} returned HTTP {status}"))]
    DiscoveryHttpStatus {
        /// Discovery endpoint that was queried.
        endpoint: String,
        /// HTTP status code.
        status: u16,
    },

    /// Discovery response body did not match the expected envelope.
    #[snafu(display(
        "Discovery response from {endpoint} could not be decoded at {location}: {source}"
    ))]
    DiscoveryDecode {
        /// Discovery endpoint that was queried.
        endpoint: String,
        /// Underlying JSON error.
        source: serde_json::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Discovery envelope carried a non-success application status.
    #[snafu(display(
        "Discovery endpoint {endpoint} reported status {status_code}: {status_text}"
    ))]
    DiscoveryStatus {
        /// Discovery endpoint that was queried.
        endpoint: String,
        /// Application-level status code from the envelope.
        status_code: i64,
        /// Application-level status text from the envelope.
        status_text: String,
    },

    /// Every discovery endpoint failed.
    #[snafu(display("No discovery endpoint available after {attempted} attempts: {last_error}"))]
    NoEndpointAvailable {
        /// Number of endpoints tried.
        attempted: usize,
        /// Last error message before giving up.
        last_error: String,
    },

    /// Discovery succeeded but no node passed construction and probing.
    #[snafu(display("No healthy node among {candidates} candidates"))]
    NoHealthyNode {
        /// Number of nodes in the pool when selection gave up.
        candidates: usize,
    },

    /// Dialing a broker node failed.
    #[snafu(display("Failed to connect to {address} at {location}: {source}"))]
    Connect {
        /// Broker address.
        address: String,
        /// Underlying I/O error.
        source: std::io::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// Reading from or writing to an established broker connection failed.
    #[snafu(display("I/O error on {address} at {location}: {source}"))]
    Io {
        /// Broker address.
        address: String,
        /// Underlying I/O error.
        source: std::io::Error,
        /// Source location.
        #[snafu(implicit)]
        location: Location,
    },

    /// A broker operation did not complete in time.
    #[snafu(display("{operation} on {address} timed out after {duration_ms}ms"))]
    Timeout {
        /// Broker address.
        address: String,
        /// Operation that timed out.
        operation: &'static str,
        /// Timeout duration in milliseconds.
        duration_ms: u64,
    },

    /// Broker rejected a command or sent an unexpected frame.
    #[snafu(display("Protocol error from {address}: {message}"))]
    Protocol {
        /// Broker address.
        address: String,
        /// Error description, usually the broker's error frame.
        message: String,
    },

    /// Connection was used after it was closed.
    #[snafu(display("Connection to {address} is closed"))]
    NotConnected {
        /// Broker address.
        address: String,
    },

    /// Publishing failed on the final attempt.
    #[snafu(display("Publish to topic '{topic}' failed: {source}"))]
    Publish {
        /// Topic the message was destined for.
        topic: String,
        /// Underlying broker error.
        #[snafu(source(from(ProxyError, Box::new)))]
        source: Box<ProxyError>,
    },
}

impl ProxyError {
    /// Returns true if the error came from querying a discovery endpoint.
    #[must_use]
    pub fn is_discovery(&self) -> bool {
        matches!(
            self,
            Self::DiscoveryRequest { .. }
                | Self::DiscoveryHttpStatus { .. }
                | Self::DiscoveryDecode { .. }
                | Self::DiscoveryStatus { .. }
                | Self::NoEndpointAvailable { .. }
        )
    }

    /// Returns true if the failure is transient and another node or another
    /// attempt may succeed.
    ///
    /// Configuration and topic errors are never retryable; retrying would
    /// fail the same way.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { .. }
            | Self::Io { .. }
            | Self::Timeout { .. }
            | Self::Protocol { .. }
            | Self::NotConnected { .. }
            | Self::NoHealthyNode { .. }
            | Self::DiscoveryRequest { .. }
            | Self::DiscoveryHttpStatus { .. }
            | Self::DiscoveryDecode { .. }
            | Self::DiscoveryStatus { .. }
            | Self::NoEndpointAvailable { .. } => true,
            Self::Publish { source, .. } => source.is_retryable(),
            Self::Config { .. } | Self::InvalidUrl { .. } | Self::InvalidTopic { .. } => false,
        }
    }

    /// Returns a short, stable label for the error kind, for log fields.
    #[must_use]
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Config { .. } => "config",
            Self::InvalidUrl { .. } => "invalid_url",
            Self::InvalidTopic { .. } => "invalid_topic",
            Self::DiscoveryRequest { .. } => "discovery_request",
            Self::DiscoveryHttpStatus { .. } => "discovery_http_status",
            Self::DiscoveryDecode { .. } => "discovery_decode",
            Self::DiscoveryStatus { .. } => "discovery_status",
            Self::NoEndpointAvailable { .. } => "no_endpoint_available",
            Self::NoHealthyNode { .. } => "no_healthy_node",
            Self::Connect { .. } => "connect",
            Self::Io { .. } => "io",
            Self::Timeout { .. } => "timeout",
            Self::Protocol { .. } => "protocol",
            Self::NotConnected { .. } => "not_connected",
            Self::Publish { .. } => "publish",
        }
    }
}
