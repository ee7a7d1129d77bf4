//! NSQ transport (`nsqd` TCP protocol V2).
//!
//! # Wire format
//!
//! After the 4-byte magic `"  V2"` the client sends newline-terminated
//! commands, some followed by a `[u32 size][bytes]` body. The server answers
//! with frames:
//!
//! ```text
//! [u32 size][i32 frame type][data; size - 4]
//!
//! frame type 0 = response  ("OK", "_heartbeat_", "CLOSE_WAIT")
//! frame type 1 = error     ("E_BAD_TOPIC ...")
//! frame type 2 = message   [i64 timestamp][u16 attempts][16-byte id][body]
//! ```
//!
//! Consumers run with `RDY 1`, so each subscription holds at most one
//! unfinished message.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use sentinel_core::metrics::increment;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tracing::{debug, info, warn};

use super::{Broker, Delivery, MessageId, Subscription};
use crate::error::{Error, Result};

const MAGIC_V2: &[u8] = b"  V2";

const FRAME_TYPE_RESPONSE: i32 = 0;
const FRAME_TYPE_ERROR: i32 = 1;
const FRAME_TYPE_MESSAGE: i32 = 2;

const RESPONSE_OK: &[u8] = b"OK";
const RESPONSE_HEARTBEAT: &[u8] = b"_heartbeat_";
const RESPONSE_CLOSE_WAIT: &[u8] = b"CLOSE_WAIT";

/// Largest frame accepted from the server.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Timestamp + attempts + id.
const MESSAGE_HEADER_SIZE: usize = 8 + 2 + 16;

// ═══════════════════════════════════════════════════════════════════════════
// Codec
// ═══════════════════════════════════════════════════════════════════════════

/// Frame received from `nsqd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(Delivery),
}

/// Command sent to `nsqd`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Client metadata, JSON encoded.
    Identify(Bytes),
    Sub { topic: String, channel: String },
    Rdy(u32),
    Fin(MessageId),
    /// Answer to a heartbeat.
    Nop,
    Pub { topic: String, body: Bytes },
    /// Ask the server to stop sending messages.
    Cls,
}

/// Check a topic or channel name against the broker's naming rules.
pub fn validate_name(name: &str) -> Result<()> {
    let base = name.strip_suffix("#ephemeral").unwrap_or(name);
    let valid = !base.is_empty()
        && name.len() <= 64
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if valid {
        Ok(())
    } else {
        Err(Error::Protocol(format!(
            "invalid topic or channel name {name:?}"
        )))
    }
}

/// Length-prefixed frame codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct NsqCodec;

impl Decoder for NsqCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut size_bytes = [0u8; 4];
        size_bytes.copy_from_slice(&src[..4]);
        let size = u32::from_be_bytes(size_bytes) as usize;

        if !(4..=MAX_FRAME_SIZE).contains(&size) {
            return Err(Error::Protocol(format!("invalid frame size {size}")));
        }

        if src.len() < 4 + size {
            src.reserve(4 + size - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = src.get_i32();
        let mut data = src.split_to(size - 4).freeze();

        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Some(Frame::Response(data))),
            FRAME_TYPE_ERROR => Ok(Some(Frame::Error(data))),
            FRAME_TYPE_MESSAGE => {
                if data.len() < MESSAGE_HEADER_SIZE {
                    return Err(Error::Protocol(format!(
                        "message frame too short ({} bytes)",
                        data.len()
                    )));
                }
                let timestamp = data.get_i64();
                let attempts = data.get_u16();
                let mut id = [0u8; 16];
                data.copy_to_slice(&mut id);
                Ok(Some(Frame::Message(Delivery {
                    id,
                    attempts,
                    timestamp,
                    body: data,
                })))
            }
            other => Err(Error::Protocol(format!("unknown frame type {other}"))),
        }
    }
}

impl Encoder<Command> for NsqCodec {
    type Error = Error;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<()> {
        match command {
            Command::Identify(body) => {
                dst.extend_from_slice(b"IDENTIFY\n");
                put_sized(dst, &body)?;
            }
            Command::Sub { topic, channel } => {
                validate_name(&topic)?;
                validate_name(&channel)?;
                dst.extend_from_slice(format!("SUB {topic} {channel}\n").as_bytes());
            }
            Command::Rdy(count) => dst.extend_from_slice(format!("RDY {count}\n").as_bytes()),
            Command::Fin(id) => {
                dst.extend_from_slice(b"FIN ");
                dst.extend_from_slice(&id);
                dst.put_u8(b'\n');
            }
            Command::Nop => dst.extend_from_slice(b"NOP\n"),
            Command::Pub { topic, body } => {
                validate_name(&topic)?;
                dst.extend_from_slice(format!("PUB {topic}\n").as_bytes());
                put_sized(dst, &body)?;
            }
            Command::Cls => dst.extend_from_slice(b"CLS\n"),
        }
        Ok(())
    }
}

fn put_sized(dst: &mut BytesMut, body: &[u8]) -> Result<()> {
    let size = u32::try_from(body.len())
        .map_err(|_| Error::Protocol(format!("body of {} bytes is too large", body.len())))?;
    dst.put_u32(size);
    dst.extend_from_slice(body);
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Connection
// ═══════════════════════════════════════════════════════════════════════════

/// Connection settings.
#[derive(Debug, Clone)]
pub struct NsqConfig {
    /// `nsqd` TCP address (`host:port`).
    pub nsqd_addr: String,

    /// Reported to `nsqd` in `IDENTIFY`.
    pub client_id: String,

    /// Heartbeat interval requested from `nsqd`.
    pub heartbeat_interval: Duration,

    /// How long to wait for `OK` after `IDENTIFY`, `SUB` or `PUB`.
    pub response_timeout: Duration,

    /// First delay before a consumer reconnects.
    pub reconnect_backoff: Duration,

    /// Cap for the doubling reconnect delay.
    pub max_reconnect_backoff: Duration,
}

impl Default for NsqConfig {
    fn default() -> Self {
        Self {
            nsqd_addr: "127.0.0.1:4150".to_string(),
            client_id: "sentinel-relay".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            response_timeout: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(1),
            max_reconnect_backoff: Duration::from_secs(60),
        }
    }
}

impl NsqConfig {
    /// Settings for `host`, using the default port when none is given.
    pub fn for_host(host: &str) -> Self {
        let nsqd_addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:4150")
        };
        Self {
            nsqd_addr,
            ..Self::default()
        }
    }
}

#[derive(Serialize)]
struct IdentifyBody<'a> {
    client_id: &'a str,
    hostname: &'a str,
    user_agent: &'a str,
    feature_negotiation: bool,
    heartbeat_interval: u64,
}

type Connection = Framed<TcpStream, NsqCodec>;

async fn connect(config: &NsqConfig) -> Result<Connection> {
    let mut stream = TcpStream::connect(&config.nsqd_addr).await?;
    stream.set_nodelay(true)?;
    stream.write_all(MAGIC_V2).await?;

    let mut conn = Framed::new(stream, NsqCodec);
    let identify = serde_json::to_vec(&IdentifyBody {
        client_id: &config.client_id,
        hostname: &config.client_id,
        user_agent: concat!("sentinel-relay/", env!("CARGO_PKG_VERSION")),
        feature_negotiation: false,
        heartbeat_interval: config.heartbeat_interval.as_millis() as u64,
    })?;
    conn.send(Command::Identify(Bytes::from(identify))).await?;
    await_ok(&mut conn, config.response_timeout, "IDENTIFY").await?;

    debug!(addr = %config.nsqd_addr, "connected to nsqd");
    Ok(conn)
}

async fn await_ok(conn: &mut Connection, timeout: Duration, what: &'static str) -> Result<()> {
    tokio::time::timeout(timeout, read_ok(conn, what))
        .await
        .map_err(|_| Error::Timeout(what))?
}

async fn read_ok(conn: &mut Connection, what: &'static str) -> Result<()> {
    loop {
        match conn.next().await {
            Some(Ok(Frame::Response(data))) if &data[..] == RESPONSE_HEARTBEAT => {
                conn.send(Command::Nop).await?;
            }
            Some(Ok(Frame::Response(data))) if &data[..] == RESPONSE_OK => return Ok(()),
            Some(Ok(Frame::Response(data))) => {
                return Err(Error::Protocol(format!(
                    "unexpected response to {what}: {}",
                    String::from_utf8_lossy(&data)
                )));
            }
            Some(Ok(Frame::Error(data))) => {
                return Err(Error::Broker(String::from_utf8_lossy(&data).into_owned()));
            }
            Some(Ok(Frame::Message(_))) => {
                return Err(Error::Protocol(format!(
                    "message received while waiting for {what}"
                )));
            }
            Some(Err(e)) => return Err(e),
            None => return Err(Error::Closed),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Broker
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct ProducerState {
    conn: Option<Connection>,
    last_used: Option<Instant>,
    failed: bool,
}

/// `nsqd` client.
///
/// Publishes share one lazily opened producer connection. Each subscription
/// opens its own consumer connection.
pub struct NsqBroker {
    config: Arc<NsqConfig>,
    producer: Mutex<ProducerState>,
}

impl NsqBroker {
    pub fn new(config: NsqConfig) -> Self {
        Self {
            config: Arc::new(config),
            producer: Mutex::new(ProducerState::default()),
        }
    }

    async fn publish_on(&self, state: &mut ProducerState, topic: &str, body: Bytes) -> Result<()> {
        // nsqd drops clients that miss heartbeats, and an idle producer never
        // reads them.
        let idle = state
            .last_used
            .is_some_and(|used| used.elapsed() >= self.config.heartbeat_interval);
        if idle {
            state.conn = None;
        }

        if state.conn.is_none() {
            let conn = connect(&self.config).await?;
            if state.failed {
                increment("broker_reconnects_total", 1);
                info!(addr = %self.config.nsqd_addr, "producer reconnected");
            }
            state.failed = false;
            state.conn = Some(conn);
        }

        let conn = state.conn.as_mut().ok_or(Error::Closed)?;
        conn.send(Command::Pub {
            topic: topic.to_string(),
            body,
        })
        .await?;
        await_ok(conn, self.config.response_timeout, "PUB").await?;
        state.last_used = Some(Instant::now());
        Ok(())
    }
}

#[async_trait]
impl Broker for NsqBroker {
    async fn subscribe(&self, topic: &str, channel: &str) -> Result<Box<dyn Subscription>> {
        let subscription = NsqSubscription::open(Arc::clone(&self.config), topic, channel).await?;
        Ok(Box::new(subscription))
    }

    async fn publish(&self, topic: &str, body: Bytes) -> Result<()> {
        validate_name(topic)?;
        let mut state = self.producer.lock().await;
        let result = self.publish_on(&mut state, topic, body).await;
        if result.is_err() {
            state.conn = None;
            state.failed = true;
        }
        result
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Subscription
// ═══════════════════════════════════════════════════════════════════════════

/// Consumer connection for one topic/channel pair.
///
/// Lost connections are re-established with exponential backoff inside
/// [`Subscription::next`].
pub struct NsqSubscription {
    config: Arc<NsqConfig>,
    topic: String,
    channel: String,
    conn: Option<Connection>,
    closed: bool,
}

impl NsqSubscription {
    /// Connect, subscribe and signal readiness for one message.
    pub async fn open(config: Arc<NsqConfig>, topic: &str, channel: &str) -> Result<Self> {
        validate_name(topic)?;
        validate_name(channel)?;

        let mut subscription = Self {
            config,
            topic: topic.to_string(),
            channel: channel.to_string(),
            conn: None,
            closed: false,
        };
        subscription.conn = Some(subscription.establish().await?);

        info!(
            topic = %subscription.topic,
            channel = %subscription.channel,
            addr = %subscription.config.nsqd_addr,
            "subscribed"
        );
        Ok(subscription)
    }

    async fn establish(&self) -> Result<Connection> {
        let mut conn = connect(&self.config).await?;
        conn.send(Command::Sub {
            topic: self.topic.clone(),
            channel: self.channel.clone(),
        })
        .await?;
        await_ok(&mut conn, self.config.response_timeout, "SUB").await?;
        conn.send(Command::Rdy(1)).await?;
        Ok(conn)
    }

    async fn reconnect(&mut self) {
        let mut delay = self.config.reconnect_backoff;
        loop {
            tokio::time::sleep(delay).await;
            match self.establish().await {
                Ok(conn) => {
                    increment("broker_reconnects_total", 1);
                    info!(topic = %self.topic, channel = %self.channel, "consumer reconnected");
                    self.conn = Some(conn);
                    return;
                }
                Err(e) => {
                    delay = (delay * 2).min(self.config.max_reconnect_backoff);
                    warn!(
                        topic = %self.topic,
                        error = %e,
                        retry_in = ?delay,
                        "consumer reconnect failed"
                    );
                }
            }
        }
    }

    fn drop_connection(&mut self, reason: &str) {
        warn!(topic = %self.topic, channel = %self.channel, reason, "consumer connection lost");
        self.conn = None;
    }

    async fn send(&mut self, command: Command) -> Result<()> {
        let conn = self.conn.as_mut().ok_or(Error::Closed)?;
        conn.send(command).await
    }
}

#[async_trait]
impl Subscription for NsqSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if self.closed {
                return None;
            }

            let frame = match self.conn.as_mut() {
                Some(conn) => conn.next().await,
                None => {
                    self.reconnect().await;
                    continue;
                }
            };

            match frame {
                Some(Ok(Frame::Message(delivery))) => return Some(delivery),
                Some(Ok(Frame::Response(data))) if &data[..] == RESPONSE_HEARTBEAT => {
                    if let Err(e) = self.send(Command::Nop).await {
                        self.drop_connection(&e.to_string());
                    }
                }
                Some(Ok(Frame::Response(data))) => {
                    debug!(
                        topic = %self.topic,
                        response = %String::from_utf8_lossy(&data),
                        "ignoring response"
                    );
                }
                Some(Ok(Frame::Error(data))) => {
                    warn!(
                        topic = %self.topic,
                        error = %String::from_utf8_lossy(&data),
                        "nsqd reported an error"
                    );
                }
                Some(Err(e)) => self.drop_connection(&e.to_string()),
                None => self.drop_connection("closed by nsqd"),
            }
        }
    }

    async fn finish(&mut self, delivery: &Delivery) -> Result<()> {
        self.send(Command::Fin(delivery.id)).await
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        conn.send(Command::Cls).await?;

        let drained = tokio::time::timeout(self.config.response_timeout, async {
            while let Some(frame) = conn.next().await {
                match frame {
                    Ok(Frame::Response(data)) if &data[..] == RESPONSE_CLOSE_WAIT => return,
                    Ok(_) => continue,
                    Err(_) => return,
                }
            }
        })
        .await;
        if drained.is_err() {
            debug!(topic = %self.topic, "no CLOSE_WAIT before timeout");
        }

        info!(topic = %self.topic, channel = %self.channel, "unsubscribed");
        Ok(())
    }
}
