//! Broker connections.
//!
//! [`BrokerConnection`] is the capability the connection manager needs from
//! a broker link: probe it, publish through it, close it, and swap its logger.
//! [`Connector`] builds connections for a node address.
//!
//! [`NsqConnection`] implements the producer half of the nsqd TCP protocol:
//!
//! ```text
//! client                                   nsqd
//!   │── "  V2" ─────────────────────────────▶│
//!   │── IDENTIFY\n <len> <json> ────────────▶│
//!   │◀──────────────────── [size][0]["OK"] ──│
//!   │── PUB <topic>\n <len> <body> ─────────▶│
//!   │◀──────────── [size][0]["_heartbeat_"] ──│   (answered with NOP)
//!   │◀──────────────────── [size][0]["OK"] ──│
//! ```
//!
//! Dialing is lazy: building a connection does no I/O, the first probe or
//! publish dials. Any I/O failure drops the socket, and the next call dials
//! again. So does a command whose reply was never read because the caller
//! dropped the future: the reply would otherwise be taken for the next one.
//!
//! `IDENTIFY` opts out of broker heartbeats, so an idle producer is not
//! disconnected. A probe still checks the idle socket for a hangup before
//! trusting it.

use std::{future::Future, task::Poll, time::Duration};

use serde::Serialize;
use snafu::{ResultExt, ensure};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, ReadBuf},
    net::TcpStream,
};

use crate::{
    config::ProducerConfig,
    error::{
        ConfigSnafu, ConnectSnafu, InvalidUrlSnafu, IoSnafu, NotConnectedSnafu, ProtocolSnafu,
        Result, TimeoutSnafu,
    },
    logging::{LogConfig, conn_log},
};

/// Protocol magic sent once after dialing.
pub(crate) const MAGIC_V2: &[u8; 4] = b"  V2";

/// Response body nsqd sends to acknowledge a command.
pub(crate) const OK_RESPONSE: &[u8] = b"OK";

/// Response body nsqd sends as a keepalive.
pub(crate) const HEARTBEAT: &[u8] = b"_heartbeat_";

/// Frame type of a response frame.
pub(crate) const FRAME_TYPE_RESPONSE: u32 = 0;

/// Frame type of an error frame.
pub(crate) const FRAME_TYPE_ERROR: u32 = 1;

/// Frame type of a message frame.
pub(crate) const FRAME_TYPE_MESSAGE: u32 = 2;

/// Largest response frame accepted from a broker.
const MAX_FRAME_SIZE: u32 = 1 << 20;

/// `heartbeat_interval` value that disables heartbeats and the broker's idle
/// read deadline.
const HEARTBEATS_DISABLED: i64 = -1;

/// A live link to one broker node.
pub trait BrokerConnection: Send + 'static {
    /// Returns the `host:port` this connection targets.
    fn address(&self) -> &str;

    /// Checks that the broker is reachable, dialing first if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker cannot be dialed or written to, or if
    /// it closed an idle connection.
    fn ping(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Publishes one message and waits for the broker's acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails, the broker rejects the message,
    /// or no acknowledgement arrives within the read timeout.
    fn publish(&mut self, topic: &str, body: &[u8]) -> impl Future<Output = Result<()>> + Send;

    /// Publishes several messages atomically and waits for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Same as [`publish`](Self::publish).
    fn multi_publish(
        &mut self,
        topic: &str,
        bodies: &[Vec<u8>],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Closes the link. Further calls fail until it is dialed again.
    fn close(&mut self);

    /// Replaces the logger settings for this connection.
    fn set_logger(&mut self, log: LogConfig);
}

/// Builds broker connections.
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced by this connector.
    type Connection: BrokerConnection;

    /// Constructs a connection to `address` without performing I/O.
    ///
    /// # Errors
    ///
    /// Returns an error if `address` or `config` cannot be used to build a
    /// connection.
    fn build(
        &self,
        address: &str,
        config: &ProducerConfig,
        log: &LogConfig,
    ) -> Result<Self::Connection>;
}

/// Connector producing [`NsqConnection`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Connection = NsqConnection;

    fn build(
        &self,
        address: &str,
        config: &ProducerConfig,
        log: &LogConfig,
    ) -> Result<NsqConnection> {
        NsqConnection::new(address, config.clone(), log.clone())
    }
}

#[derive(Debug, Serialize)]
struct Identify<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    client_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<&'a str>,
    user_agent: &'a str,
    feature_negotiation: bool,
    heartbeat_interval: i64,
}

/// A decoded broker frame.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Response(Vec<u8>),
    Error(Vec<u8>),
    Message,
}

/// Producer connection speaking the nsqd TCP protocol.
#[derive(Debug)]
pub struct NsqConnection {
    address: String,
    config: ProducerConfig,
    log: LogConfig,
    stream: Option<TcpStream>,
    /// Set while a command is written but its reply not yet read.
    in_flight: bool,
}

impl NsqConnection {
    /// Creates an undialed connection to `address`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidUrl`](crate::ProxyError::InvalidUrl) if `address` is
    /// not a `host:port` pair.
    pub fn new(address: impl Into<String>, config: ProducerConfig, log: LogConfig) -> Result<Self> {
        let address = address.into();
        validate_address(&address)?;
        Ok(Self { address, config, log, stream: None, in_flight: false })
    }

    /// Returns whether a socket is currently open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Returns the logger settings this connection was built or updated with.
    #[must_use]
    pub fn log_config(&self) -> &LogConfig {
        &self.log
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.in_flight {
            self.in_flight = false;
            if self.stream.take().is_some() {
                conn_log!(
                    self.log,
                    Warning,
                    address = %self.address,
                    "previous command was abandoned before its reply, redialing"
                );
            }
        }

        if self.stream.is_some() {
            return Ok(());
        }

        conn_log!(self.log, Debug, address = %self.address, "dialing broker");
        match self.dial().await {
            Ok(stream) => {
                conn_log!(self.log, Info, address = %self.address, "connected to broker");
                self.stream = Some(stream);
                Ok(())
            },
            Err(e) => {
                conn_log!(self.log, Warning, address = %self.address, error = %e, "dial failed");
                Err(e)
            },
        }
    }

    async fn dial(&self) -> Result<TcpStream> {
        let address = self.address.as_str();
        let dial_timeout = self.config.dial_timeout();

        let mut stream = match tokio::time::timeout(dial_timeout, TcpStream::connect(address)).await
        {
            Ok(result) => result.context(ConnectSnafu { address })?,
            Err(_) => {
                return TimeoutSnafu { address, operation: "dial", duration_ms: millis(dial_timeout) }
                    .fail();
            },
        };
        stream.set_nodelay(true).context(ConnectSnafu { address })?;

        let identify = encode_identify(address, &self.config)?;
        write_all(&mut stream, address, MAGIC_V2, self.config.write_timeout()).await?;
        write_all(&mut stream, address, &identify, self.config.write_timeout()).await?;
        read_ack(&mut stream, address, &self.config, &self.log).await?;

        Ok(stream)
    }

    /// Sends `command` and, if `acknowledged`, waits for `OK`.
    ///
    /// Drops the socket on any failure.
    async fn send(&mut self, command: &[u8], acknowledged: bool) -> Result<()> {
        self.ensure_connected().await?;

        self.in_flight = true;
        let result = match self.stream.as_mut() {
            Some(stream) => {
                let address = self.address.as_str();
                match write_all(stream, address, command, self.config.write_timeout()).await {
                    Ok(()) if acknowledged => read_ack(stream, address, &self.config, &self.log).await,
                    other => other,
                }
            },
            None => NotConnectedSnafu { address: self.address.as_str() }.fail(),
        };
        self.in_flight = false;

        if let Err(e) = &result {
            conn_log!(self.log, Error, address = %self.address, error = %e, "dropping connection");
            self.stream = None;
        }

        result
    }

    /// Fails if the broker hung up on the idle socket, answering any
    /// heartbeat that arrived meanwhile.
    ///
    /// Drops the socket on failure. An abandoned command is left for
    /// [`send`](Self::send) to clean up.
    async fn check_idle(&mut self) -> Result<()> {
        if self.in_flight {
            return Ok(());
        }
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        self.in_flight = true;
        let result = drain_unsolicited(stream, &self.address, &self.config, &self.log).await;
        self.in_flight = false;

        if let Err(e) = &result {
            conn_log!(
                self.log,
                Warning,
                address = %self.address,
                error = %e,
                "idle connection is gone"
            );
            self.stream = None;
        }

        result
    }
}

impl BrokerConnection for NsqConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn ping(&mut self) -> Result<()> {
        self.check_idle().await?;
        self.send(b"NOP\n", false).await
    }

    async fn publish(&mut self, topic: &str, body: &[u8]) -> Result<()> {
        let command = encode_pub(topic, body);
        conn_log!(self.log, Debug, address = %self.address, topic, bytes = body.len(), "PUB");
        self.send(&command, true).await
    }

    async fn multi_publish(&mut self, topic: &str, bodies: &[Vec<u8>]) -> Result<()> {
        let command = encode_mpub(topic, bodies)?;
        conn_log!(self.log, Debug, address = %self.address, topic, count = bodies.len(), "MPUB");
        self.send(&command, true).await
    }

    fn close(&mut self) {
        self.in_flight = false;
        if self.stream.take().is_some() {
            conn_log!(self.log, Info, address = %self.address, "closed broker connection");
        }
    }

    fn set_logger(&mut self, log: LogConfig) {
        self.log = log;
    }
}

fn validate_address(address: &str) -> Result<()> {
    let Some((host, port)) = address.rsplit_once(':') else {
        return InvalidUrlSnafu { url: address, message: "expected host:port" }.fail();
    };

    ensure!(!host.is_empty(), InvalidUrlSnafu { url: address, message: "missing host" });
    ensure!(
        port.parse::<u16>().is_ok_and(|p| p != 0),
        InvalidUrlSnafu { url: address, message: "invalid port" }
    );

    Ok(())
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Appends a size-prefixed body to `buf`.
fn put_sized(buf: &mut Vec<u8>, body: &[u8]) {
    let len = u32::try_from(body.len()).unwrap_or(u32::MAX);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(body);
}

fn encode_identify(address: &str, config: &ProducerConfig) -> Result<Vec<u8>> {
    let identify = Identify {
        client_id: config.client_id(),
        hostname: config.hostname(),
        user_agent: config.user_agent(),
        feature_negotiation: false,
        heartbeat_interval: HEARTBEATS_DISABLED,
    };
    let body = serde_json::to_vec(&identify)
        .map_err(|e| ProtocolSnafu { address, message: format!("encode IDENTIFY: {e}") }.build())?;

    let mut command = b"IDENTIFY\n".to_vec();
    put_sized(&mut command, &body);
    Ok(command)
}

/// Encodes `PUB <topic>\n<size><body>`.
pub(crate) fn encode_pub(topic: &str, body: &[u8]) -> Vec<u8> {
    let mut command = Vec::with_capacity(topic.len() + body.len() + 9);
    command.extend_from_slice(b"PUB ");
    command.extend_from_slice(topic.as_bytes());
    command.push(b'\n');
    put_sized(&mut command, body);
    command
}

/// Encodes `MPUB <topic>\n<size><count>(<size><body>)*`.
pub(crate) fn encode_mpub(topic: &str, bodies: &[Vec<u8>]) -> Result<Vec<u8>> {
    ensure!(!bodies.is_empty(), ConfigSnafu { message: "MPUB requires at least one message" });

    let count = u32::try_from(bodies.len())
        .map_err(|_| ConfigSnafu { message: "too many messages for MPUB" }.build())?;

    let mut payload = count.to_be_bytes().to_vec();
    for body in bodies {
        put_sized(&mut payload, body);
    }

    let mut command = Vec::with_capacity(topic.len() + payload.len() + 10);
    command.extend_from_slice(b"MPUB ");
    command.extend_from_slice(topic.as_bytes());
    command.push(b'\n');
    put_sized(&mut command, &payload);
    Ok(command)
}

async fn write_all(
    stream: &mut TcpStream,
    address: &str,
    bytes: &[u8],
    timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(timeout, stream.write_all(bytes)).await {
        Ok(result) => result.context(IoSnafu { address }),
        Err(_) => TimeoutSnafu { address, operation: "write", duration_ms: millis(timeout) }.fail(),
    }
}

async fn read_frame(stream: &mut TcpStream, address: &str) -> Result<Frame> {
    let size = stream.read_u32().await.context(IoSnafu { address })?;
    ensure!(
        (4..=MAX_FRAME_SIZE).contains(&size),
        ProtocolSnafu { address, message: format!("invalid frame size {size}") }
    );

    let frame_type = stream.read_u32().await.context(IoSnafu { address })?;
    let mut data = vec![0u8; (size - 4) as usize];
    stream.read_exact(&mut data).await.context(IoSnafu { address })?;

    match frame_type {
        FRAME_TYPE_RESPONSE => Ok(Frame::Response(data)),
        FRAME_TYPE_ERROR => Ok(Frame::Error(data)),
        FRAME_TYPE_MESSAGE => Ok(Frame::Message),
        other => ProtocolSnafu { address, message: format!("unknown frame type {other}") }.fail(),
    }
}

async fn read_frame_within(
    stream: &mut TcpStream,
    address: &str,
    read_timeout: Duration,
) -> Result<Frame> {
    match tokio::time::timeout(read_timeout, read_frame(stream, address)).await {
        Ok(frame) => frame,
        Err(_) => {
            TimeoutSnafu { address, operation: "read", duration_ms: millis(read_timeout) }.fail()
        },
    }
}

/// Peeks at the socket without waiting.
///
/// `None` means nothing is buffered, `Some(Ok(0))` means the peer hung up.
async fn peek_ready(stream: &TcpStream) -> Option<std::io::Result<usize>> {
    let mut byte = [0u8; 1];
    std::future::poll_fn(|cx| {
        let mut buf = ReadBuf::new(&mut byte);
        match stream.poll_peek(cx, &mut buf) {
            Poll::Ready(result) => Poll::Ready(Some(result)),
            Poll::Pending => Poll::Ready(None),
        }
    })
    .await
}

/// Consumes frames the broker sent while no command was outstanding.
///
/// Heartbeats are answered with `NOP`. A hangup, a read error, or any other
/// unsolicited frame is an error.
async fn drain_unsolicited(
    stream: &mut TcpStream,
    address: &str,
    config: &ProducerConfig,
    log: &LogConfig,
) -> Result<()> {
    loop {
        match peek_ready(stream).await {
            None => return Ok(()),
            Some(Ok(0)) => {
                let eof = std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "broker closed the connection",
                );
                return Err(eof).context(IoSnafu { address });
            },
            Some(Ok(_)) => {},
            Some(Err(e)) => return Err(e).context(IoSnafu { address }),
        }

        match read_frame_within(stream, address, config.read_timeout()).await? {
            Frame::Response(data) if data == HEARTBEAT => {
                conn_log!(log, Debug, address, "heartbeat while idle");
                write_all(stream, address, b"NOP\n", config.write_timeout()).await?;
            },
            Frame::Response(data) | Frame::Error(data) => {
                return ProtocolSnafu {
                    address,
                    message: format!("unsolicited frame {}", String::from_utf8_lossy(&data)),
                }
                .fail();
            },
            Frame::Message => {
                return ProtocolSnafu { address, message: "unexpected message frame" }.fail();
            },
        }
    }
}

/// Reads frames until an acknowledgement, answering heartbeats on the way.
async fn read_ack(
    stream: &mut TcpStream,
    address: &str,
    config: &ProducerConfig,
    log: &LogConfig,
) -> Result<()> {
    loop {
        match read_frame_within(stream, address, config.read_timeout()).await? {
            Frame::Response(data) if data == HEARTBEAT => {
                conn_log!(log, Debug, address, "heartbeat");
                write_all(stream, address, b"NOP\n", config.write_timeout()).await?;
            },
            Frame::Response(data) if data == OK_RESPONSE => return Ok(()),
            Frame::Response(data) => {
                return ProtocolSnafu {
                    address,
                    message: format!("unexpected response {}", String::from_utf8_lossy(&data)),
                }
                .fail();
            },
            Frame::Error(data) => {
                return ProtocolSnafu { address, message: String::from_utf8_lossy(&data) }.fail();
            },
            Frame::Message => {
                return ProtocolSnafu { address, message: "unexpected message frame" }.fail();
            },
        }
    }
}
