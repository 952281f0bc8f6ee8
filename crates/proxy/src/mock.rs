//! Mock discovery and broker servers for integration testing.
//!
//! [`MockLookupd`] serves the discovery HTTP API and [`MockNsqd`] speaks the
//! producer side of the nsqd TCP protocol. Both bind an ephemeral port on
//! localhost and expose knobs for failure injection.
//!
//! # Features
//!
//! - **Scripted discovery**: set the advertised nodes or the envelope status
//! - **Failure injection**: HTTP 500 from discovery, error frames from nsqd
//! - **Slow or impatient brokers**: delayed acknowledgements, idle disconnects
//! - **Recording**: every published message and every `IDENTIFY` is kept
//! - **Request counting**: verify how often discovery was queried
//!
//! # Example
//!
//! ```no_run
//! use nsq_proxy::mock::{MockLookupd, MockNsqd};
//! use nsq_proxy::{Selector, SelectorConfig};
//!
//! # async fn example() -> nsq_proxy::Result<()> {
//! let nsqd = MockNsqd::start().await?;
//! let lookupd = MockLookupd::start().await?;
//! lookupd.set_nodes(vec![nsqd.broker_node(["orders"])]);
//!
//! let config = SelectorConfig::builder().with_endpoint(lookupd.endpoint()).build()?;
//! let selector = Selector::connect(config).await?;
//! selector.publish("orders", b"hello").await?;
//!
//! assert_eq!(nsqd.messages(), vec![("orders".to_owned(), b"hello".to_vec())]);
//! # Ok(())
//! # }
//! ```

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use parking_lot::RwLock;
use serde_json::json;
use snafu::ResultExt;
use tokio::{
    io::{
        AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
    },
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::{JoinHandle, JoinSet},
};

use crate::{
    error::{ConnectSnafu, Result},
    pool::BrokerNode,
    transport::{FRAME_TYPE_ERROR, FRAME_TYPE_RESPONSE, HEARTBEAT, MAGIC_V2, OK_RESPONSE},
};

/// Largest command body the mock broker reads.
const MAX_BODY_SIZE: u32 = 4 << 20;

async fn bind(port: u16) -> Result<(TcpListener, SocketAddr)> {
    let address = format!("127.0.0.1:{port}");
    let listener = TcpListener::bind(&address).await.context(ConnectSnafu { address: &address })?;
    let local_addr = listener.local_addr().context(ConnectSnafu { address })?;
    Ok((listener, local_addr))
}

// =============================================================================
// MockLookupd
// =============================================================================

#[derive(Debug)]
struct LookupdState {
    nodes: RwLock<Vec<BrokerNode>>,

    /// Application-level status carried in the envelope.
    status: RwLock<(i64, String)>,

    /// Answer HTTP 500 instead of an envelope.
    fail_http: AtomicBool,

    request_count: AtomicUsize,

    last_query: RwLock<HashMap<String, String>>,
}

impl Default for LookupdState {
    fn default() -> Self {
        Self {
            nodes: RwLock::new(Vec::new()),
            status: RwLock::new((200, "OK".to_owned())),
            fail_http: AtomicBool::new(false),
            request_count: AtomicUsize::new(0),
            last_query: RwLock::new(HashMap::new()),
        }
    }
}

/// Mock discovery server answering `GET /nodes`.
pub struct MockLookupd {
    state: Arc<LookupdState>,
    address: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MockLookupd {
    /// Starts a mock discovery server on an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns [`Connect`](crate::ProxyError::Connect) if binding fails.
    pub async fn start() -> Result<Self> {
        Self::start_on_port(0).await
    }

    /// Starts a mock discovery server on `port`. Port 0 picks an ephemeral one.
    ///
    /// # Errors
    ///
    /// Returns [`Connect`](crate::ProxyError::Connect) if binding fails.
    pub async fn start_on_port(port: u16) -> Result<Self> {
        let (listener, address) = bind(port).await?;
        let state = Arc::new(LookupdState::default());

        let router =
            Router::new().route("/nodes", get(nodes_handler)).with_state(Arc::clone(&state));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!("Mock lookupd error: {}", e);
            }
        });

        Ok(Self { state, address, shutdown_tx: Some(shutdown_tx), task: Some(task) })
    }

    /// Returns the `host:port` endpoint to configure a selector with.
    #[must_use]
    pub fn endpoint(&self) -> String {
        self.address.to_string()
    }

    /// Replaces the advertised broker nodes.
    pub fn set_nodes(&self, nodes: Vec<BrokerNode>) {
        *self.state.nodes.write() = nodes;
    }

    /// Sets the envelope status. Anything but 200 is a discovery failure.
    pub fn set_status(&self, code: i64, text: &str) {
        *self.state.status.write() = (code, text.to_owned());
    }

    /// Toggles answering every request with HTTP 500.
    pub fn fail_http(&self, fail: bool) {
        self.state.fail_http.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of requests received.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.state.request_count.load(Ordering::SeqCst)
    }

    /// Returns the query arguments of the most recent request.
    #[must_use]
    pub fn last_query(&self) -> HashMap<String, String> {
        self.state.last_query.read().clone()
    }

    /// Stops the server and waits until the port is closed.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MockLookupd {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn nodes_handler(
    State(state): State<Arc<LookupdState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    state.request_count.fetch_add(1, Ordering::SeqCst);
    *state.last_query.write() = query;

    if state.fail_http.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "injected failure").into_response();
    }

    let (status_code, status_text) = state.status.read().clone();
    if status_code != 200 {
        return Json(json!({ "status_code": status_code, "status_text": status_text, "data": null }))
            .into_response();
    }

    let producers: Vec<_> = state
        .nodes
        .read()
        .iter()
        .map(|node| {
            json!({
                "broadcast_address": node.broadcast_address(),
                "tcp_port": node.tcp_port(),
                "topics": node.topics(),
            })
        })
        .collect();

    Json(json!({
        "status_code": status_code,
        "status_text": status_text,
        "data": { "producers": producers },
    }))
    .into_response()
}

// =============================================================================
// MockNsqd
// =============================================================================

#[derive(Debug, Default)]
struct NsqdState {
    messages: RwLock<Vec<(String, Vec<u8>)>>,

    /// `client_id` of every `IDENTIFY`, empty if none was sent.
    identified: RwLock<Vec<String>>,

    connections: AtomicUsize,

    open_connections: AtomicUsize,

    /// Number of error frames to answer the next publishes with.
    publish_failures: AtomicUsize,

    /// Send a heartbeat before every publish acknowledgement.
    heartbeat: AtomicBool,

    /// Delay before answering a publish, in milliseconds.
    ack_delay_ms: AtomicU64,

    /// Close connections that send nothing for this long, in milliseconds.
    /// Zero keeps them open.
    idle_timeout_ms: AtomicU64,
}

impl NsqdState {
    fn take_publish_failure(&self) -> bool {
        self.publish_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn ack_delay(&self) -> Duration {
        Duration::from_millis(self.ack_delay_ms.load(Ordering::SeqCst))
    }

    fn idle_timeout(&self) -> Option<Duration> {
        match self.idle_timeout_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

/// Counts a connection as open until dropped, including on abort.
struct OpenGuard(Arc<NsqdState>);

impl OpenGuard {
    fn new(state: Arc<NsqdState>) -> Self {
        state.open_connections.fetch_add(1, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.open_connections.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Mock broker accepting producer connections.
pub struct MockNsqd {
    state: Arc<NsqdState>,
    address: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl MockNsqd {
    /// Starts a mock broker on an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns [`Connect`](crate::ProxyError::Connect) if binding fails.
    pub async fn start() -> Result<Self> {
        Self::start_on_port(0).await
    }

    /// Starts a mock broker on `port`. Port 0 picks an ephemeral one.
    ///
    /// # Errors
    ///
    /// Returns [`Connect`](crate::ProxyError::Connect) if binding fails.
    pub async fn start_on_port(port: u16) -> Result<Self> {
        let (listener, address) = bind(port).await?;
        let state = Arc::new(NsqdState::default());

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let accept_state = Arc::clone(&state);
        let task = tokio::spawn(async move {
            // Dropping the set on shutdown aborts every open connection.
            let mut connections = JoinSet::new();
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            accept_state.connections.fetch_add(1, Ordering::SeqCst);
                            connections.spawn(serve_connection(stream, Arc::clone(&accept_state)));
                        },
                        Err(e) => {
                            tracing::error!("Mock nsqd accept error: {}", e);
                            break;
                        },
                    },
                }
            }
        });

        Ok(Self { state, address, shutdown_tx: Some(shutdown_tx), task: Some(task) })
    }

    /// Returns the `host:port` the broker listens on.
    #[must_use]
    pub fn address(&self) -> String {
        self.address.to_string()
    }

    /// Returns a discovery entry pointing at this broker.
    #[must_use]
    pub fn broker_node<I, S>(&self, topics: I) -> BrokerNode
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        BrokerNode::new(self.address.ip().to_string(), self.address.port(), topics)
    }

    /// Returns every acknowledged message as `(topic, body)`, in order.
    #[must_use]
    pub fn messages(&self) -> Vec<(String, Vec<u8>)> {
        self.state.messages.read().clone()
    }

    /// Returns the `client_id` of every connection that identified itself.
    #[must_use]
    pub fn identified_clients(&self) -> Vec<String> {
        self.state.identified.read().clone()
    }

    /// Returns the number of accepted TCP connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Returns the number of connections the broker still holds open.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    /// Answers the next `count` publishes with an `E_PUB_FAILED` error frame.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.publish_failures.store(count, Ordering::SeqCst);
    }

    /// Toggles sending a heartbeat before each publish acknowledgement.
    pub fn heartbeat_before_ack(&self, enabled: bool) {
        self.state.heartbeat.store(enabled, Ordering::SeqCst);
    }

    /// Waits `delay` before answering each publish. The outcome is decided
    /// when the command arrives.
    pub fn delay_acks(&self, delay: Duration) {
        self.state.ack_delay_ms.store(millis(delay), Ordering::SeqCst);
    }

    /// Closes connections that stay silent for `timeout`, like nsqd does once
    /// a client misses its heartbeats. `None` keeps idle connections open.
    pub fn close_idle_after(&self, timeout: Option<Duration>) {
        let ms = timeout.map_or(0, |timeout| millis(timeout).max(1));
        self.state.idle_timeout_ms.store(ms, Ordering::SeqCst);
    }

    /// Stops the broker, closing the listener and every open connection.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MockNsqd {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn serve_connection(stream: TcpStream, state: Arc<NsqdState>) {
    let _open = OpenGuard::new(Arc::clone(&state));
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    if let Err(e) = handle_commands(&mut reader, &mut writer, &state).await {
        tracing::debug!("Mock nsqd connection closed: {}", e);
    }
}

async fn handle_commands<R, W>(
    reader: &mut R,
    writer: &mut W,
    state: &NsqdState,
) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic).await?;
    if &magic != MAGIC_V2 {
        return write_frame(writer, FRAME_TYPE_ERROR, b"E_BAD_PROTOCOL").await;
    }

    let mut line = Vec::new();
    loop {
        line.clear();
        let next_line = reader.read_until(b'\n', &mut line);
        let read = match state.idle_timeout() {
            Some(timeout) => match tokio::time::timeout(timeout, next_line).await {
                Ok(read) => read?,
                Err(_) => {
                    tracing::debug!("Mock nsqd closing idle connection");
                    return Ok(());
                },
            },
            None => next_line.await?,
        };
        if read == 0 {
            return Ok(());
        }

        let command = String::from_utf8_lossy(&line);
        let mut parts = command.trim_end().split(' ');

        match (parts.next(), parts.next()) {
            (Some("NOP"), _) => {},
            (Some("IDENTIFY"), _) => {
                let body = read_sized(reader).await?;
                let client_id = serde_json::from_slice::<serde_json::Value>(&body)
                    .ok()
                    .and_then(|v| v.get("client_id").and_then(|c| c.as_str()).map(str::to_owned))
                    .unwrap_or_default();
                state.identified.write().push(client_id);
                write_frame(writer, FRAME_TYPE_RESPONSE, OK_RESPONSE).await?;
            },
            (Some("PUB"), Some(topic)) => {
                let body = read_sized(reader).await?;
                acknowledge(writer, state, topic, vec![body]).await?;
            },
            (Some("MPUB"), Some(topic)) => {
                let payload = read_sized(reader).await?;
                match split_mpub(&payload) {
                    Some(bodies) => acknowledge(writer, state, topic, bodies).await?,
                    None => write_frame(writer, FRAME_TYPE_ERROR, b"E_BAD_BODY").await?,
                }
            },
            _ => {
                return write_frame(writer, FRAME_TYPE_ERROR, b"E_INVALID").await;
            },
        }
    }
}

async fn acknowledge<W>(
    writer: &mut W,
    state: &NsqdState,
    topic: &str,
    bodies: Vec<Vec<u8>>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let rejected = state.take_publish_failure();
    if !rejected {
        state.messages.write().extend(bodies.into_iter().map(|body| (topic.to_owned(), body)));
    }

    let delay = state.ack_delay();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    if state.heartbeat.load(Ordering::SeqCst) {
        write_frame(writer, FRAME_TYPE_RESPONSE, HEARTBEAT).await?;
    }

    if rejected {
        return write_frame(writer, FRAME_TYPE_ERROR, b"E_PUB_FAILED").await;
    }
    write_frame(writer, FRAME_TYPE_RESPONSE, OK_RESPONSE).await
}

async fn read_sized<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let len = reader.read_u32().await?;
    if len > MAX_BODY_SIZE {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "body too large"));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Splits an `MPUB` payload into message bodies.
fn split_mpub(payload: &[u8]) -> Option<Vec<Vec<u8>>> {
    let (count, mut rest) = split_u32(payload)?;
    let mut bodies = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let (len, tail) = split_u32(rest)?;
        let len = len as usize;
        if tail.len() < len {
            return None;
        }
        bodies.push(tail[..len].to_vec());
        rest = &tail[len..];
    }

    rest.is_empty().then_some(bodies)
}

fn split_u32(bytes: &[u8]) -> Option<(u32, &[u8])> {
    let (head, tail) = bytes.split_first_chunk::<4>()?;
    Some((u32::from_be_bytes(*head), tail))
}

async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame_type: u32,
    data: &[u8],
) -> std::io::Result<()> {
    let size = u32::try_from(data.len() + 4).unwrap_or(u32::MAX);
    let mut frame = Vec::with_capacity(data.len() + 8);
    frame.extend_from_slice(&size.to_be_bytes());
    frame.extend_from_slice(&frame_type.to_be_bytes());
    frame.extend_from_slice(data);
    writer.write_all(&frame).await?;
    writer.flush().await
}
