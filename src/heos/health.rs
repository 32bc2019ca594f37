//! Heartbeat and reconnection
//!
//! While the link is up the monitor probes it on a fixed interval. A failed
//! probe (or a reader noticing the socket died) moves the connection to
//! `Reconnecting`, after which the monitor retries with exponential backoff.
//! When the retry budget runs out the session goes `Disconnected` and a single
//! `ConnectionLost` event is published.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::{EventDispatcher, SessionEvent};
use crate::error::Result;
use crate::heos::connection::ConnectionState;

/// Retry configuration for reconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay before the first attempt
    pub initial_delay: Duration,
    /// Maximum delay (backoff caps at this value)
    pub max_delay: Duration,
    /// Attempts before giving up
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_retries: 5,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt` (1-based): initial × 2^(attempt-1), capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthConfig {
    pub heartbeat_interval: Duration,
    /// Consecutive failed probes before the link is declared dead
    pub max_failures: u32,
    pub retry: RetryConfig,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            max_failures: 1,
            retry: RetryConfig::default(),
        }
    }
}

/// What the monitor watches over
#[async_trait]
pub trait HealthTarget: Send + Sync + 'static {
    /// One heartbeat round trip
    async fn probe(&self) -> Result<()>;

    /// Re-establish the link. On success the connection is `Connected`.
    async fn reconnect(&self) -> Result<()>;

    /// Drop the current link after failed probes (state becomes `Reconnecting`)
    fn link_failed(&self);

    /// Retry budget exhausted (state becomes `Disconnected`)
    fn give_up(&self);

    fn watch_state(&self) -> watch::Receiver<ConnectionState>;
}

enum Recovery {
    Reconnected,
    Exhausted,
    Cancelled,
}

pub struct HealthMonitor<T: HealthTarget> {
    target: Arc<T>,
    dispatcher: EventDispatcher,
    config: HealthConfig,
    shutdown: CancellationToken,
}

impl<T: HealthTarget> HealthMonitor<T> {
    pub fn new(
        target: Arc<T>,
        dispatcher: EventDispatcher,
        config: HealthConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            target,
            dispatcher,
            config,
            shutdown,
        }
    }

    /// Run until cancelled or until reconnection is exhausted
    pub async fn run(self) {
        let mut state = self.target.watch_state();
        let period = self.config.heartbeat_interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Reconnecting => match self.recover().await {
                    Recovery::Reconnected => {
                        failures = 0;
                        ticker.reset();
                        continue;
                    }
                    Recovery::Exhausted | Recovery::Cancelled => break,
                },
                ConnectionState::Disconnected => break,
                ConnectionState::Connecting | ConnectionState::Connected => {}
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if current != ConnectionState::Connected {
                        continue;
                    }
                    let probe = tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        probe = self.target.probe() => probe,
                    };
                    match probe {
                        Ok(()) => failures = 0,
                        Err(e) => {
                            failures += 1;
                            warn!(
                                "Heartbeat failed ({}/{}): {}",
                                failures, self.config.max_failures, e
                            );
                            let still_connected =
                                *state.borrow() == ConnectionState::Connected;
                            if failures >= self.config.max_failures.max(1) && still_connected {
                                self.target.link_failed();
                            }
                        }
                    }
                }
            }
        }

        info!("Health monitor stopped");
    }

    async fn recover(&self) -> Recovery {
        let retry = &self.config.retry;
        let mut last_error = String::from("link lost");

        for attempt in 1..=retry.max_retries {
            let delay = retry.delay_for(attempt);
            self.dispatcher
                .lifecycle(SessionEvent::Reconnecting { attempt });
            warn!(
                "Reconnecting (attempt {}/{}) in {:?}",
                attempt, retry.max_retries, delay
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => return Recovery::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = self.shutdown.cancelled() => return Recovery::Cancelled,
                result = self.target.reconnect() => result,
            };
            match result {
                Ok(()) => {
                    info!("Reconnected after {} attempt(s)", attempt);
                    return Recovery::Reconnected;
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                }
            }
        }

        error!(
            "Giving up after {} reconnect attempts: {}",
            retry.max_retries, last_error
        );
        self.target.give_up();
        self.dispatcher.lifecycle(SessionEvent::ConnectionLost {
            reason: format!(
                "reconnect failed after {} attempts: {}",
                retry.max_retries, last_error
            ),
        });
        Recovery::Exhausted
    }
}
