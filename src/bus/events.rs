//! Events published on the session bus.
//!
//! Device events are wrapped as-is; connection lifecycle transitions are
//! published alongside them under [`EventCategory::Connection`].

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::heos::codec::{EventCategory, HeosEvent};

/// Everything a subscriber can receive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SessionEvent {
    /// Unsolicited change event from the device
    Device(HeosEvent),

    /// Handshake completed (initial connect or successful reconnect)
    Connected { host: String, port: u16 },

    /// Link dropped or heartbeat failed; `attempt` counts from 1
    Reconnecting { attempt: u32 },

    /// Caller-requested disconnect
    Disconnected,

    /// Reconnect budget exhausted. Published exactly once per loss.
    ConnectionLost { reason: String },
}

impl SessionEvent {
    pub fn categories(&self) -> &'static [EventCategory] {
        match self {
            SessionEvent::Device(event) => event.categories(),
            _ => &[EventCategory::Connection],
        }
    }

    pub fn matches(&self, filter: &[EventCategory]) -> bool {
        self.categories().iter().any(|c| filter.contains(c))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::ConnectionLost { .. })
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Device(event) => match event {
                HeosEvent::PlayerStateChanged { pid, state } => {
                    write!(f, "player {} state {}", pid, state)
                }
                HeosEvent::NowPlayingChanged { pid } => write!(f, "player {} now playing changed", pid),
                HeosEvent::NowPlayingProgress {
                    pid,
                    cur_pos,
                    duration,
                } => write!(f, "player {} progress {}/{} ms", pid, cur_pos, duration),
                HeosEvent::VolumeChanged { pid, level, mute } => {
                    write!(f, "player {} volume {} mute {}", pid, level, mute)
                }
                HeosEvent::QueueChanged { pid } => write!(f, "player {} queue changed", pid),
                HeosEvent::RepeatModeChanged { pid, repeat } => {
                    write!(f, "player {} repeat {}", pid, repeat)
                }
                HeosEvent::ShuffleModeChanged { pid, shuffle } => {
                    write!(f, "player {} shuffle {}", pid, shuffle)
                }
                HeosEvent::PlayersChanged => write!(f, "players changed"),
                HeosEvent::GroupsChanged => write!(f, "groups changed"),
                HeosEvent::SourcesChanged => write!(f, "sources changed"),
                HeosEvent::PlaybackError { pid, error } => {
                    write!(f, "player {} playback error: {}", pid, error)
                }
                HeosEvent::Other { command, message } => write!(f, "{} {}", command, message),
            },
            SessionEvent::Connected { host, port } => write!(f, "connected to {}:{}", host, port),
            SessionEvent::Reconnecting { attempt } => write!(f, "reconnecting (attempt {})", attempt),
            SessionEvent::Disconnected => write!(f, "disconnected"),
            SessionEvent::ConnectionLost { reason } => write!(f, "connection lost: {}", reason),
        }
    }
}
