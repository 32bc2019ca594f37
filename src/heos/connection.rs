//! Connection manager
//!
//! Owns the single TCP link to the device. Each link gets a reader task that
//! decodes lines and routes them (responses to the correlator, events to the
//! dispatcher) and a writer task fed by a bounded channel. Lifecycle state is
//! published through a `watch` channel.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::bus::EventDispatcher;
use crate::error::{HeosError, Result};
use crate::heos::codec::{decode, Message};
use crate::heos::correlator::{Correlator, Transport};

/// Default TCP connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Outgoing lines buffered per link
const WRITE_QUEUE_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(s)
    }
}

/// One live socket and its tasks
struct Link {
    id: u64,
    writer: mpsc::Sender<String>,
    shutdown: CancellationToken,
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    link: Mutex<Option<Link>>,
    next_link_id: AtomicU64,
    correlator: Arc<Correlator>,
    dispatcher: EventDispatcher,
}

impl Shared {
    /// Tear down the current link (if any) and fail its pending requests.
    /// Returns whether a link was live.
    fn teardown(&self, error: HeosError) -> bool {
        let link = self.link.lock().take();
        let had_link = match link {
            Some(link) => {
                link.shutdown.cancel();
                true
            }
            None => false,
        };
        self.correlator.fail_all(error);
        had_link
    }

    /// Called by a link's own tasks when its socket fails
    fn link_lost(&self, id: u64, reason: &str) {
        let link = {
            let mut current = self.link.lock();
            match current.as_ref() {
                Some(link) if link.id == id => current.take(),
                _ => None,
            }
        };
        // Stale link or disconnect already in progress
        let Some(link) = link else {
            return;
        };

        tracing::warn!("HEOS link lost: {}", reason);
        link.shutdown.cancel();
        self.correlator.fail_all(HeosError::ConnectionLost);
        self.state.send_replace(ConnectionState::Reconnecting);
    }

    fn handle_line(&self, line: &str) {
        match decode(line) {
            Message::Response(response) => {
                tracing::debug!("RX: {}", line.trim_end());
                self.dispatcher.state().update_from_response(&response);
                self.correlator.resolve(response);
            }
            Message::Event(event) => self.dispatcher.dispatch(event),
            Message::Malformed { line, reason } => {
                tracing::warn!("Discarding malformed line ({}): {}", reason, line);
            }
        }
    }
}

/// Handle to the device link. Cloning shares the same link.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn new(correlator: Arc<Correlator>, dispatcher: EventDispatcher) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                state,
                link: Mutex::new(None),
                next_link_id: AtomicU64::new(1),
                correlator,
                dispatcher,
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn set_state(&self, state: ConnectionState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            tracing::debug!("Connection state: {} -> {}", previous, state);
        }
    }

    pub fn has_link(&self) -> bool {
        self.shared.link.lock().is_some()
    }

    /// Move to Connected if the link opened by `open` is still up. Returns
    /// false when the reader already lost it.
    pub fn mark_connected(&self) -> bool {
        let link = self.shared.link.lock();
        if link.is_none() {
            return false;
        }
        self.set_state(ConnectionState::Connected);
        true
    }

    /// Open a socket to `host:port` and start its reader and writer tasks.
    ///
    /// Any previous link is torn down first. The lifecycle state is left to
    /// the caller, which still has to run the handshake.
    pub async fn open(&self, host: &str, port: u16, connect_timeout: Duration) -> Result<()> {
        self.shared.teardown(HeosError::ConnectionLost);

        tracing::info!("Connecting to HEOS device at {}:{}", host, port);
        let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| HeosError::Connection(format!("connect to {}:{} timed out", host, port)))?
            .map_err(|e| HeosError::Connection(format!("connect to {}:{} failed: {}", host, port, e)))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("set_nodelay failed: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let shutdown = CancellationToken::new();
        let id = self.shared.next_link_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut link = self.shared.link.lock();
            *link = Some(Link {
                id,
                writer: tx,
                shutdown: shutdown.clone(),
            });
        }

        tokio::spawn(read_loop(
            self.shared.clone(),
            id,
            BufReader::new(read_half),
            shutdown.clone(),
        ));
        tokio::spawn(write_loop(self.shared.clone(), id, write_half, rx, shutdown));

        Ok(())
    }

    /// Caller-requested close: pending requests resolve with `Cancelled` and the
    /// state becomes `Disconnected`. Idempotent.
    pub fn disconnect(&self) {
        if self.shared.teardown(HeosError::Cancelled) {
            tracing::info!("HEOS link closed");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Close the link without touching the lifecycle state
    pub fn close_link(&self, error: HeosError) {
        self.shared.teardown(error);
    }

    /// The link is considered dead (e.g. heartbeat failure): fail pending
    /// requests with `ConnectionLost` and move to `Reconnecting`.
    pub fn mark_lost(&self) {
        self.shared.teardown(HeosError::ConnectionLost);
        self.set_state(ConnectionState::Reconnecting);
    }
}

#[async_trait]
impl Transport for Connection {
    async fn send_line(&self, line: String) -> Result<()> {
        let writer = self
            .shared
            .link
            .lock()
            .as_ref()
            .map(|link| link.writer.clone())
            .ok_or(HeosError::NotConnected)?;
        writer
            .send(line)
            .await
            .map_err(|_| HeosError::ConnectionLost)
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    id: u64,
    reader: BufReader<OwnedReadHalf>,
    shutdown: CancellationToken,
) {
    let mut lines = reader.lines();
    let reason = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!("Reader {} cancelled", id);
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => shared.handle_line(&line),
                Ok(None) => break "connection closed by device".to_string(),
                Err(e) => break format!("read error: {}", e),
            }
        }
    };
    shared.link_lost(id, &reason);
}

async fn write_loop(
    shared: Arc<Shared>,
    id: u64,
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<String>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            line = rx.recv() => {
                let Some(line) = line else { break };
                let mut bytes = line.into_bytes();
                bytes.extend_from_slice(b"\r\n");
                if let Err(e) = writer.write_all(&bytes).await {
                    shared.link_lost(id, &format!("write error: {}", e));
                    break;
                }
            }
        }
    }
    if let Err(e) = writer.shutdown().await {
        tracing::debug!("HEOS writer shutdown: {}", e);
    }
}
