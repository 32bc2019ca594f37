//! HEOS control session
//!
//! [`HeosSession`] owns one device link and everything around it: the
//! correlator, the state cache, the event bus and the health monitor. Player
//! operations live in `commands.rs`.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{create_bus, EventDispatcher, SessionEvent, Subscription};
use crate::error::{HeosError, Result};
use crate::heos::codec::{Command, EventCategory, Response};
use crate::heos::connection::{Connection, ConnectionState, DEFAULT_CONNECT_TIMEOUT};
use crate::heos::correlator::{Correlator, DEFAULT_REQUEST_TIMEOUT};
use crate::heos::health::{HealthConfig, HealthMonitor, HealthTarget};
use crate::heos::state::{StateCache, StateSnapshot};
use crate::heos::types::DEFAULT_PORT;

/// Runtime settings for a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub host: Option<String>,
    pub port: u16,
    /// Preferred player for `connect_and_discover(None)`
    pub player_id: Option<i64>,
    pub player_name: Option<String>,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub health: HealthConfig,
    /// Volume changes are clamped to this level
    pub volume_limit: Option<u8>,
    /// Event bus capacity per subscriber
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: DEFAULT_PORT,
            player_id: None,
            player_name: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            health: HealthConfig::default(),
            volume_limit: None,
            event_buffer: crate::bus::DEFAULT_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoint {
    host: String,
    port: u16,
}

struct MonitorHandle {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub(crate) struct SessionInner {
    pub(crate) config: SessionConfig,
    endpoint: RwLock<Option<Endpoint>>,
    pub(crate) connection: Connection,
    pub(crate) correlator: Arc<Correlator>,
    pub(crate) dispatcher: EventDispatcher,
    monitor: Mutex<Option<MonitorHandle>>,
    /// Serializes connect/disconnect/set_host
    lifecycle: tokio::sync::Mutex<()>,
}

impl SessionInner {
    fn endpoint(&self) -> Option<Endpoint> {
        self.endpoint.read().clone()
    }

    pub(crate) fn state(&self) -> &Arc<StateCache> {
        self.dispatcher.state()
    }

    /// Open the socket and register for change events
    async fn establish(&self) -> Result<()> {
        let Endpoint { host, port } = self
            .endpoint()
            .ok_or_else(|| HeosError::Validation("no HEOS host set".to_string()))?;

        self.connection
            .open(&host, port, self.config.connect_timeout)
            .await?;

        let handshake = Command::new("system", "register_for_change_events").param("enable", "on");
        if let Err(e) = self.correlator.submit(&handshake, &self.connection).await {
            self.connection.close_link(HeosError::Cancelled);
            return Err(HeosError::Connection(format!(
                "handshake with {}:{} failed: {}",
                host, port, e
            )));
        }

        if !self.connection.mark_connected() {
            return Err(HeosError::Connection(format!(
                "{}:{} closed the connection after the handshake",
                host, port
            )));
        }
        tracing::info!("Connected to HEOS device at {}:{}", host, port);
        self.dispatcher
            .lifecycle(SessionEvent::Connected { host, port });
        Ok(())
    }

    fn start_monitor(self: &Arc<Self>) {
        let shutdown = CancellationToken::new();
        let monitor = HealthMonitor::new(
            self.clone(),
            self.dispatcher.clone(),
            self.config.health.clone(),
            shutdown.clone(),
        );
        let task = tokio::spawn(monitor.run());
        let previous = self
            .monitor
            .lock()
            .replace(MonitorHandle { shutdown, task });
        if let Some(previous) = previous {
            previous.shutdown.cancel();
        }
    }

    async fn stop_monitor(&self) {
        let handle = self.monitor.lock().take();
        if let Some(handle) = handle {
            handle.shutdown.cancel();
            if let Err(e) = handle.task.await {
                tracing::warn!("Health monitor task failed: {}", e);
            }
        }
    }
}

#[async_trait]
impl HealthTarget for SessionInner {
    async fn probe(&self) -> Result<()> {
        let heartbeat = Command::new("system", "heart_beat");
        self.correlator
            .submit(&heartbeat, &self.connection)
            .await
            .map(|_| ())
    }

    async fn reconnect(&self) -> Result<()> {
        self.establish().await?;
        // Active player is kept; refresh the known set around it
        let players = Command::new("player", "get_players");
        if let Err(e) = self.correlator.submit(&players, &self.connection).await {
            tracing::warn!("Player refresh after reconnect failed: {}", e);
        }
        Ok(())
    }

    fn link_failed(&self) {
        self.connection.mark_lost();
    }

    fn give_up(&self) {
        self.connection.close_link(HeosError::ConnectionLost);
        self.connection.set_state(ConnectionState::Disconnected);
    }

    fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch()
    }
}

/// A control session with one HEOS device.
///
/// Dropping the session closes the link and cancels everything pending.
pub struct HeosSession {
    pub(crate) inner: Arc<SessionInner>,
}

impl HeosSession {
    pub fn new(config: SessionConfig) -> Self {
        let correlator = Arc::new(Correlator::new(config.request_timeout));
        let dispatcher = EventDispatcher::new(
            create_bus(config.event_buffer),
            Arc::new(StateCache::new()),
        );
        let connection = Connection::new(correlator.clone(), dispatcher.clone());
        let endpoint = config
            .host
            .clone()
            .filter(|h| !h.trim().is_empty())
            .map(|host| Endpoint {
                host,
                port: config.port,
            });

        Self {
            inner: Arc::new(SessionInner {
                config,
                endpoint: RwLock::new(endpoint),
                connection,
                correlator,
                dispatcher,
                monitor: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    // =========================================================================
    // Host and connection
    // =========================================================================

    /// Set the device host (configured port). Disconnects first if the host
    /// changes while a link is up.
    pub async fn set_host(&self, host: &str) -> Result<()> {
        self.set_endpoint(host, self.inner.config.port).await
    }

    pub async fn set_endpoint(&self, host: &str, port: u16) -> Result<()> {
        let host = host.trim();
        if host.is_empty() {
            return Err(HeosError::Validation("host must not be empty".to_string()));
        }
        if port == 0 {
            return Err(HeosError::Validation("port must not be 0".to_string()));
        }

        let endpoint = Endpoint {
            host: host.to_string(),
            port,
        };
        if self.inner.endpoint().as_ref() == Some(&endpoint) {
            return Ok(());
        }

        if self.connection_state() != ConnectionState::Disconnected {
            tracing::info!("Host changing to {}:{}, disconnecting", host, port);
            self.disconnect().await;
        }
        *self.inner.endpoint.write() = Some(endpoint);
        Ok(())
    }

    pub fn host(&self) -> Option<String> {
        self.inner.endpoint().map(|e| e.host)
    }

    pub fn port(&self) -> Option<u16> {
        self.inner.endpoint().map(|e| e.port)
    }

    /// Connect and register for change events. No-op when already connected.
    pub async fn connect(&self) -> Result<()> {
        let lifecycle_guard = self.inner.lifecycle.lock().await;
        if self.connection_state() == ConnectionState::Connected {
            return Ok(());
        }
        if self.inner.endpoint().is_none() {
            return Err(HeosError::Validation("no HEOS host set".to_string()));
        }

        self.inner.stop_monitor().await;
        self.inner.connection.set_state(ConnectionState::Connecting);

        let result = self.inner.establish().await;
        match &result {
            Ok(()) => self.inner.start_monitor(),
            Err(e) => {
                tracing::warn!("Connect failed: {}", e);
                self.inner.connection.close_link(HeosError::Cancelled);
                self.inner
                    .connection
                    .set_state(ConnectionState::Disconnected);
            }
        }
        drop(lifecycle_guard);
        result
    }

    /// Close the link. Pending requests resolve with `Cancelled`. Idempotent.
    pub async fn disconnect(&self) {
        let lifecycle_guard = self.inner.lifecycle.lock().await;
        let was = self.connection_state();
        self.inner.stop_monitor().await;
        self.inner.connection.disconnect();
        if was != ConnectionState::Disconnected {
            self.inner.dispatcher.lifecycle(SessionEvent::Disconnected);
        }
        drop(lifecycle_guard);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.watch()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Send `system/heart_beat`
    pub async fn heartbeat(&self) -> Result<()> {
        self.request(Command::new("system", "heart_beat"))
            .await
            .map(|_| ())
    }

    /// Whether the link is up and the device answers a heartbeat
    pub async fn check_connection(&self) -> bool {
        if !self.is_connected() {
            return false;
        }
        match self.heartbeat().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Connection check failed: {}", e);
                false
            }
        }
    }

    // =========================================================================
    // State and events
    // =========================================================================

    /// Last-known state. May be stale unless `connection_state()` is Connected.
    pub fn state(&self) -> StateSnapshot {
        self.inner.state().snapshot()
    }

    pub fn subscribe(&self, categories: &[EventCategory]) -> Subscription {
        self.inner.dispatcher.subscribe(categories)
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(&EventCategory::ALL)
    }

    /// Requests currently waiting for a response
    pub fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    /// Send a command and wait for its response. Requires a Connected session.
    pub async fn request(&self, command: Command) -> Result<Response> {
        if !self.is_connected() {
            return Err(HeosError::NotConnected);
        }
        self.inner
            .correlator
            .submit(&command, &self.inner.connection)
            .await
    }
}

impl Default for HeosSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Drop for HeosSession {
    fn drop(&mut self) {
        let monitor = self.inner.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.shutdown.cancel();
        }
        self.inner.connection.disconnect();
    }
}
