//! HEOS type definitions
//!
//! Players, playback enums, now-playing media, music sources and physical inputs.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Default HEOS CLI port
pub const DEFAULT_PORT: u16 = 1255;

// ============================================================================
// Player Types
// ============================================================================

/// Player information returned by `player/get_players`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    pub pid: i64,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub gid: Option<i64>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, deserialize_with = "non_empty_string")]
    pub ip: Option<String>,
    #[serde(default, deserialize_with = "non_empty_string")]
    pub network: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub lineout: Option<i64>,
    #[serde(default, deserialize_with = "non_empty_string")]
    pub serial: Option<String>,
    /// Fields this crate doesn't know about yet
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Play state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayState {
    Play,
    Pause,
    Stop,
}

impl PlayState {
    /// State reached by a play/pause toggle from this state
    pub fn toggled(self) -> Self {
        match self {
            PlayState::Play => PlayState::Pause,
            PlayState::Pause | PlayState::Stop => PlayState::Play,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlayState::Play => "play",
            PlayState::Pause => "pause",
            PlayState::Stop => "stop",
        }
    }
}

impl fmt::Display for PlayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlayState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "play" => Ok(PlayState::Play),
            "pause" => Ok(PlayState::Pause),
            "stop" => Ok(PlayState::Stop),
            _ => Err(format!("Unknown play state: {}", s)),
        }
    }
}

/// Parse the device's `on`/`off` mute flag
pub fn parse_on_off(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "on" => Some(true),
        "off" => Some(false),
        _ => None,
    }
}

pub fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

/// Repeat mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepeatMode {
    Off,
    One,
    All,
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepeatMode::Off => write!(f, "off"),
            RepeatMode::One => write!(f, "on_one"),
            RepeatMode::All => write!(f, "on_all"),
        }
    }
}

impl FromStr for RepeatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(RepeatMode::Off),
            "on_one" => Ok(RepeatMode::One),
            "on_all" => Ok(RepeatMode::All),
            _ => Err(format!("Unknown repeat mode: {}", s)),
        }
    }
}

/// Shuffle mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShuffleMode {
    On,
    Off,
}

impl fmt::Display for ShuffleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShuffleMode::On => write!(f, "on"),
            ShuffleMode::Off => write!(f, "off"),
        }
    }
}

impl FromStr for ShuffleMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_on_off(s) {
            Some(true) => Ok(ShuffleMode::On),
            Some(false) => Ok(ShuffleMode::Off),
            None => Err(format!("Unknown shuffle mode: {}", s)),
        }
    }
}

// ============================================================================
// Now Playing Types
// ============================================================================

/// Now playing media information.
///
/// Every field is optional: a missing field means "not applicable to this media
/// type" (stations have no album, AUX inputs have almost nothing).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NowPlayingMedia {
    #[serde(rename = "type", default, deserialize_with = "non_empty_string")]
    pub media_type: Option<String>,
    #[serde(default, deserialize_with = "non_empty_string")]
    pub song: Option<String>,
    #[serde(default, deserialize_with = "non_empty_string")]
    pub album: Option<String>,
    #[serde(default, deserialize_with = "non_empty_string")]
    pub artist: Option<String>,
    #[serde(default, deserialize_with = "non_empty_string")]
    pub image_url: Option<String>,
    #[serde(default, deserialize_with = "non_empty_string")]
    pub mid: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub qid: Option<i64>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub sid: Option<i64>,
    #[serde(default, deserialize_with = "non_empty_string")]
    pub station: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// ============================================================================
// Browse/Source Types
// ============================================================================

/// Music source information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MusicSource {
    pub name: String,
    #[serde(default, deserialize_with = "non_empty_string")]
    pub image_url: Option<String>,
    #[serde(rename = "type", default)]
    pub source_type: String,
    pub sid: i64,
    #[serde(default, deserialize_with = "non_empty_string")]
    pub available: Option<String>,
    #[serde(default, deserialize_with = "non_empty_string")]
    pub service_username: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MusicSource {
    /// Sources without an `available` flag are assumed usable
    pub fn is_available(&self) -> bool {
        self.available.as_deref().map_or(true, |a| a == "true")
    }
}

/// Known source IDs
pub mod source_ids {
    pub const PANDORA: i64 = 1;
    pub const RHAPSODY: i64 = 2;
    pub const TUNEIN: i64 = 3;
    pub const SPOTIFY: i64 = 4;
    pub const DEEZER: i64 = 5;
    pub const NAPSTER: i64 = 6;
    pub const IHEARTRADIO: i64 = 7;
    pub const SIRIUS_XM: i64 = 8;
    pub const SOUNDCLOUD: i64 = 9;
    pub const TIDAL: i64 = 10;
    pub const AMAZON_MUSIC: i64 = 13;
    pub const LOCAL_MUSIC: i64 = 1024;
    pub const PLAYLISTS: i64 = 1025;
    pub const HISTORY: i64 = 1026;
    pub const AUX_INPUT: i64 = 1027;
    pub const FAVORITES: i64 = 1028;
}

/// Physical inputs accepted by `browse/play_input`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Input {
    AuxIn1,
    AuxIn2,
    AuxIn3,
    AuxIn4,
    OpticalIn1,
    OpticalIn2,
    CoaxIn1,
    CoaxIn2,
    HdmiIn1,
    HdmiIn2,
    HdmiIn3,
    HdmiIn4,
    HdmiArc1,
    CableSat,
    Dvd,
    Bluray,
    Game,
    MediaPlayer,
    Cd,
    Tuner,
    TvAudio,
    Phono,
}

impl Input {
    pub const ALL: [Input; 22] = [
        Input::AuxIn1,
        Input::AuxIn2,
        Input::AuxIn3,
        Input::AuxIn4,
        Input::OpticalIn1,
        Input::OpticalIn2,
        Input::CoaxIn1,
        Input::CoaxIn2,
        Input::HdmiIn1,
        Input::HdmiIn2,
        Input::HdmiIn3,
        Input::HdmiIn4,
        Input::HdmiArc1,
        Input::CableSat,
        Input::Dvd,
        Input::Bluray,
        Input::Game,
        Input::MediaPlayer,
        Input::Cd,
        Input::Tuner,
        Input::TvAudio,
        Input::Phono,
    ];

    /// Wire name, e.g. `inputs/optical_in_1`
    pub fn as_str(&self) -> &'static str {
        match self {
            Input::AuxIn1 => "inputs/aux_in_1",
            Input::AuxIn2 => "inputs/aux_in_2",
            Input::AuxIn3 => "inputs/aux_in_3",
            Input::AuxIn4 => "inputs/aux_in_4",
            Input::OpticalIn1 => "inputs/optical_in_1",
            Input::OpticalIn2 => "inputs/optical_in_2",
            Input::CoaxIn1 => "inputs/coax_in_1",
            Input::CoaxIn2 => "inputs/coax_in_2",
            Input::HdmiIn1 => "inputs/hdmi_in_1",
            Input::HdmiIn2 => "inputs/hdmi_in_2",
            Input::HdmiIn3 => "inputs/hdmi_in_3",
            Input::HdmiIn4 => "inputs/hdmi_in_4",
            Input::HdmiArc1 => "inputs/hdmi_arc_1",
            Input::CableSat => "inputs/cable_sat",
            Input::Dvd => "inputs/dvd",
            Input::Bluray => "inputs/bluray",
            Input::Game => "inputs/game",
            Input::MediaPlayer => "inputs/mediaplayer",
            Input::Cd => "inputs/cd",
            Input::Tuner => "inputs/tuner",
            Input::TvAudio => "inputs/tvaudio",
            Input::Phono => "inputs/phono",
        }
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Input {
    type Err = String;

    /// Accepts both `inputs/aux_in_1` and the bare `aux_in_1`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bare = s.strip_prefix("inputs/").unwrap_or(s);
        Input::ALL
            .iter()
            .copied()
            .find(|input| &input.as_str()["inputs/".len()..] == bare)
            .ok_or_else(|| format!("Unknown input: {}", s))
    }
}

// ============================================================================
// Lenient field decoding
// ============================================================================

/// HEOS sends `""` for fields that don't apply; treat them as absent.
fn non_empty_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

/// Ids arrive as numbers on most firmware and as strings on some.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_i64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}
