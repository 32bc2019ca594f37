//! HEOS wire codec
//!
//! Commands go out as single lines:
//! `heos://<group>/<command>?<key>=<value>&<key>=<value>\r\n`
//!
//! Everything coming back is one JSON object per line. Responses echo the command
//! and carry a `result` plus an `&`-separated `message`; change events carry an
//! `event/...` command and no result:
//!
//! ```text
//! {"heos": {"command": "player/get_volume", "result": "success", "message": "pid=1&level=40"}}
//! {"heos": {"command": "event/player_volume_changed", "message": "pid=1&level=30&mute=off"}}
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{HeosError, Result};
use crate::heos::types::{parse_on_off, PlayState, RepeatMode, ShuffleMode};

const SCHEME: &str = "heos://";

/// Interim acknowledgement sent before slow responses (e.g. `get_players`)
const UNDER_PROCESS: &str = "command under process";

// =============================================================================
// Commands
// =============================================================================

/// An outgoing HEOS command.
///
/// Equality ignores parameter order: `a=1&b=2` and `b=2&a=1` are the same command.
#[derive(Debug, Clone, Eq)]
pub struct Command {
    group: String,
    name: String,
    params: Vec<(String, String)>,
}

impl Command {
    pub fn new(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Append a parameter
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Command kind used for correlation, e.g. `player/get_volume`
    pub fn kind(&self) -> String {
        format!("{}/{}", self.group, self.name)
    }

    /// Serialize to a wire line (without the trailing CRLF)
    pub fn encode(&self) -> String {
        let mut line = format!("{}{}/{}", SCHEME, self.group, self.name);
        if !self.params.is_empty() {
            line.push('?');
            line.push_str(&encode_pairs(&self.params));
        }
        line
    }

    /// Parse a command line as a device would
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        let rest = line
            .strip_prefix(SCHEME)
            .ok_or_else(|| HeosError::Protocol(format!("missing heos:// scheme: {}", line)))?;

        let (path, query) = match rest.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (rest, None),
        };

        let (group, name) = path
            .split_once('/')
            .filter(|(g, n)| !g.is_empty() && !n.is_empty() && !n.contains('/'))
            .ok_or_else(|| HeosError::Protocol(format!("invalid command path: {}", path)))?;

        let params = query
            .map(|q| MessageParams::parse(q).into_pairs())
            .unwrap_or_default();

        Ok(Self {
            group: group.to_string(),
            name: name.to_string(),
            params,
        })
    }

    fn sorted_params(&self) -> Vec<&(String, String)> {
        let mut params: Vec<_> = self.params.iter().collect();
        params.sort();
        params
    }
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group
            && self.name == other.name
            && self.sorted_params() == other.sorted_params()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Escape the characters HEOS reserves inside parameter values
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            _ => out.push(c),
        }
    }
    out
}

fn encode_pairs(pairs: &[(String, String)]) -> String {
    pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, escape_value(v)))
        .collect::<Vec<_>>()
        .join("&")
}

// =============================================================================
// Message parameters
// =============================================================================

/// Decoded `key=value&key=value` message string.
///
/// Order is preserved. Bare tokens without `=` (e.g. `command under process`)
/// are kept as keys with an empty value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageParams(Vec<(String, String)>);

impl MessageParams {
    pub fn parse(message: &str) -> Self {
        let pairs = message
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((key, value)) => (key.to_string(), percent_decode(value)),
                None => (pair.to_string(), String::new()),
            })
            .collect();
        Self(pairs)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    /// Value parsed into `T`, `None` if missing or unparseable
    pub fn parse_value<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }

    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MessageParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .0
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{}={}", k, escape_value(v))
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        f.write_str(&rendered)
    }
}

fn percent_decode(value: &str) -> String {
    urlencoding::decode(value)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

// =============================================================================
// Responses
// =============================================================================

/// Response result flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Fail,
}

/// A decoded command response
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Echoed command kind, e.g. `player/get_volume`
    pub command: String,
    pub result: ResultStatus,
    pub message: MessageParams,
    pub payload: Option<Value>,
    pub options: Option<Value>,
    /// Unknown header/envelope fields, kept for forward compatibility
    pub extra: Map<String, Value>,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.result == ResultStatus::Success
    }

    /// Interim "command under process" acknowledgement
    pub fn is_under_process(&self) -> bool {
        self.message.contains(UNDER_PROCESS)
    }

    /// Player id echoed in the message, if any
    pub fn pid(&self) -> Option<i64> {
        self.message.parse_value("pid")
    }

    /// Error carried by a `result=fail` response
    pub fn error(&self) -> Option<HeosError> {
        if self.is_success() {
            return None;
        }
        let eid = self.message.parse_value("eid").unwrap_or(-1);
        let text = self
            .message
            .get("text")
            .map(str::to_string)
            .unwrap_or_else(|| "Unknown error".to_string());
        Some(HeosError::Command { eid, text })
    }

    /// Required message parameter; missing is a protocol error
    pub fn require(&self, key: &str) -> Result<&str> {
        self.message.get(key).ok_or_else(|| {
            HeosError::Protocol(format!("{} response has no '{}'", self.command, key))
        })
    }

    /// Deserialize the payload into `T`
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| HeosError::Protocol(format!("{} response has no payload", self.command)))?;
        serde_json::from_value(payload)
            .map_err(|e| HeosError::Protocol(format!("{} payload: {}", self.command, e)))
    }
}

// =============================================================================
// Events
// =============================================================================

/// Event categories subscribers can filter on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    PlayerState,
    Volume,
    Mute,
    NowPlaying,
    NowPlayingProgress,
    Queue,
    PlayMode,
    Players,
    Groups,
    Sources,
    PlaybackError,
    /// Session lifecycle (connected, reconnecting, disconnected, lost)
    Connection,
    /// Events this crate doesn't model
    Other,
}

impl EventCategory {
    pub const ALL: [EventCategory; 13] = [
        EventCategory::PlayerState,
        EventCategory::Volume,
        EventCategory::Mute,
        EventCategory::NowPlaying,
        EventCategory::NowPlayingProgress,
        EventCategory::Queue,
        EventCategory::PlayMode,
        EventCategory::Players,
        EventCategory::Groups,
        EventCategory::Sources,
        EventCategory::PlaybackError,
        EventCategory::Connection,
        EventCategory::Other,
    ];
}

/// Unsolicited change event from the device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeosEvent {
    PlayerStateChanged { pid: i64, state: PlayState },
    NowPlayingChanged { pid: i64 },
    NowPlayingProgress { pid: i64, cur_pos: i64, duration: i64 },
    VolumeChanged { pid: i64, level: u8, mute: bool },
    QueueChanged { pid: i64 },
    RepeatModeChanged { pid: i64, repeat: RepeatMode },
    ShuffleModeChanged { pid: i64, shuffle: ShuffleMode },
    PlayersChanged,
    GroupsChanged,
    SourcesChanged,
    PlaybackError { pid: i64, error: String },
    /// Unknown event, or a known one whose parameters didn't parse
    Other { command: String, message: MessageParams },
}

impl HeosEvent {
    /// Categories this event is delivered under.
    ///
    /// Volume events carry the mute flag too, so they reach both `Volume` and
    /// `Mute` subscribers.
    pub fn categories(&self) -> &'static [EventCategory] {
        match self {
            HeosEvent::PlayerStateChanged { .. } => &[EventCategory::PlayerState],
            HeosEvent::NowPlayingChanged { .. } => &[EventCategory::NowPlaying],
            HeosEvent::NowPlayingProgress { .. } => &[EventCategory::NowPlayingProgress],
            HeosEvent::VolumeChanged { .. } => &[EventCategory::Volume, EventCategory::Mute],
            HeosEvent::QueueChanged { .. } => &[EventCategory::Queue],
            HeosEvent::RepeatModeChanged { .. } | HeosEvent::ShuffleModeChanged { .. } => {
                &[EventCategory::PlayMode]
            }
            HeosEvent::PlayersChanged => &[EventCategory::Players],
            HeosEvent::GroupsChanged => &[EventCategory::Groups],
            HeosEvent::SourcesChanged => &[EventCategory::Sources],
            HeosEvent::PlaybackError { .. } => &[EventCategory::PlaybackError],
            HeosEvent::Other { .. } => &[EventCategory::Other],
        }
    }

    /// Player the event refers to, if any
    pub fn pid(&self) -> Option<i64> {
        match self {
            HeosEvent::PlayerStateChanged { pid, .. }
            | HeosEvent::NowPlayingChanged { pid }
            | HeosEvent::NowPlayingProgress { pid, .. }
            | HeosEvent::VolumeChanged { pid, .. }
            | HeosEvent::QueueChanged { pid }
            | HeosEvent::RepeatModeChanged { pid, .. }
            | HeosEvent::ShuffleModeChanged { pid, .. }
            | HeosEvent::PlaybackError { pid, .. } => Some(*pid),
            _ => None,
        }
    }

    fn from_wire(command: &str, message: MessageParams) -> Self {
        let name = command.strip_prefix("event/").unwrap_or(command);
        let pid = message.parse_value::<i64>("pid");

        let parsed = match name {
            "player_state_changed" => pid.zip(
                message
                    .get("state")
                    .and_then(|s| s.parse::<PlayState>().ok()),
            )
            .map(|(pid, state)| HeosEvent::PlayerStateChanged { pid, state }),
            "player_now_playing_changed" => pid.map(|pid| HeosEvent::NowPlayingChanged { pid }),
            "player_now_playing_progress" => pid.map(|pid| HeosEvent::NowPlayingProgress {
                pid,
                cur_pos: message.parse_value("cur_pos").unwrap_or(0),
                duration: message.parse_value("duration").unwrap_or(0),
            }),
            "player_volume_changed" => {
                let level = message.parse_value::<u8>("level").filter(|l| *l <= 100);
                let mute = message.get("mute").and_then(parse_on_off);
                match (pid, level, mute) {
                    (Some(pid), Some(level), Some(mute)) => {
                        Some(HeosEvent::VolumeChanged { pid, level, mute })
                    }
                    _ => None,
                }
            }
            "player_queue_changed" => pid.map(|pid| HeosEvent::QueueChanged { pid }),
            "repeat_mode_changed" => pid
                .zip(message.get("repeat").and_then(|r| r.parse().ok()))
                .map(|(pid, repeat)| HeosEvent::RepeatModeChanged { pid, repeat }),
            "shuffle_mode_changed" => pid
                .zip(message.get("shuffle").and_then(|s| s.parse().ok()))
                .map(|(pid, shuffle)| HeosEvent::ShuffleModeChanged { pid, shuffle }),
            "players_changed" => Some(HeosEvent::PlayersChanged),
            "groups_changed" => Some(HeosEvent::GroupsChanged),
            "sources_changed" => Some(HeosEvent::SourcesChanged),
            "player_playback_error" => pid.map(|pid| HeosEvent::PlaybackError {
                pid,
                error: message.get("error").unwrap_or_default().to_string(),
            }),
            _ => None,
        };

        parsed.unwrap_or_else(|| HeosEvent::Other {
            command: command.to_string(),
            message,
        })
    }
}

// =============================================================================
// Decoding
// =============================================================================

/// One decoded line from the device
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Response(Response),
    Event(HeosEvent),
    /// The line didn't fit the grammar; log and discard
    Malformed { line: String, reason: String },
}

#[derive(Deserialize)]
struct Envelope {
    heos: Header,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    options: Option<Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Deserialize)]
struct Header {
    command: String,
    #[serde(default)]
    result: Option<ResultStatus>,
    #[serde(default)]
    message: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Decode a single line received from the device
pub fn decode(line: &str) -> Message {
    let trimmed = line.trim();
    let malformed = |reason: String| Message::Malformed {
        line: trimmed.to_string(),
        reason,
    };

    if trimmed.is_empty() {
        return malformed("empty line".to_string());
    }

    let envelope: Envelope = match serde_json::from_str(trimmed) {
        Ok(envelope) => envelope,
        Err(e) => return malformed(e.to_string()),
    };

    let Envelope {
        heos,
        payload,
        options,
        mut extra,
    } = envelope;

    if heos.command.is_empty() {
        return malformed("empty command".to_string());
    }

    let message = MessageParams::parse(heos.message.as_deref().unwrap_or(""));

    if heos.command.starts_with("event/") {
        return Message::Event(HeosEvent::from_wire(&heos.command, message));
    }

    let Some(result) = heos.result else {
        return malformed(format!("{} response has no result", heos.command));
    };

    for (key, value) in heos.extra {
        extra.insert(format!("heos.{}", key), value);
    }

    Message::Response(Response {
        command: heos.command,
        result,
        message,
        payload,
        options,
        extra,
    })
}
