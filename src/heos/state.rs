//! Session state cache
//!
//! Last-known players, active player, playback and music sources. Fed by
//! responses and events; reads never touch the network.

use parking_lot::RwLock;
use serde::Serialize;

use crate::heos::codec::{HeosEvent, Response};
use crate::heos::types::{
    parse_on_off, MusicSource, NowPlayingMedia, PlayState, Player, RepeatMode, ShuffleMode,
};

/// Observed playback state of the active player. Every field is unknown until seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlaybackState {
    pub pid: i64,
    pub play_state: Option<PlayState>,
    pub volume: Option<u8>,
    pub muted: Option<bool>,
    pub now_playing: Option<NowPlayingMedia>,
    pub repeat: Option<RepeatMode>,
    pub shuffle: Option<ShuffleMode>,
    /// Position in ms, from progress events
    pub position_ms: Option<i64>,
    pub duration_ms: Option<i64>,
}

impl PlaybackState {
    pub fn new(pid: i64) -> Self {
        Self {
            pid,
            ..Default::default()
        }
    }
}

/// Point-in-time copy of the whole cache
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub players: Vec<Player>,
    pub active_player: Option<i64>,
    pub playback: Option<PlaybackState>,
    pub sources: Vec<MusicSource>,
}

#[derive(Debug, Default)]
struct PlayersState {
    players: Vec<Player>,
    active: Option<i64>,
}

#[derive(Debug, Default)]
pub struct StateCache {
    players: RwLock<PlayersState>,
    playback: RwLock<Option<PlaybackState>>,
    sources: RwLock<Vec<MusicSource>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub fn snapshot(&self) -> StateSnapshot {
        let (players, active_player) = {
            let state = self.players.read();
            (state.players.clone(), state.active)
        };
        StateSnapshot {
            players,
            active_player,
            playback: self.playback.read().clone(),
            sources: self.sources.read().clone(),
        }
    }

    pub fn players(&self) -> Vec<Player> {
        self.players.read().players.clone()
    }

    pub fn player(&self, pid: i64) -> Option<Player> {
        self.players
            .read()
            .players
            .iter()
            .find(|p| p.pid == pid)
            .cloned()
    }

    /// Case-insensitive lookup by display name
    pub fn player_by_name(&self, name: &str) -> Option<Player> {
        self.players
            .read()
            .players
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn active_player(&self) -> Option<i64> {
        self.players.read().active
    }

    pub fn playback(&self) -> Option<PlaybackState> {
        self.playback.read().clone()
    }

    pub fn sources(&self) -> Vec<MusicSource> {
        self.sources.read().clone()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub fn set_players(&self, players: Vec<Player>) {
        let mut state = self.players.write();
        if let Some(active) = state.active {
            if !players.iter().any(|p| p.pid == active) {
                tracing::warn!("Active player {} missing from refreshed player list", active);
            }
        }
        state.players = players;
    }

    /// Make `pid` the active player. Playback state is replaced wholesale unless
    /// it already belongs to `pid`.
    pub fn set_active_player(&self, pid: i64) {
        self.players.write().active = Some(pid);
        let mut playback = self.playback.write();
        if playback.as_ref().map(|p| p.pid) != Some(pid) {
            *playback = Some(PlaybackState::new(pid));
        }
    }

    pub fn set_sources(&self, sources: Vec<MusicSource>) {
        *self.sources.write() = sources;
    }

    /// Apply a partial update to the active player's playback state.
    /// Updates for any other pid are ignored.
    fn update_playback(&self, pid: i64, apply: impl FnOnce(&mut PlaybackState)) {
        let mut playback = self.playback.write();
        match playback.as_mut() {
            Some(state) if state.pid == pid => apply(state),
            _ => tracing::trace!("Ignoring playback update for inactive player {}", pid),
        }
    }

    /// Fold a successful command response into the cache
    pub fn update_from_response(&self, response: &Response) {
        if !response.is_success() || response.is_under_process() {
            return;
        }

        let message = &response.message;
        match response.command.as_str() {
            "player/get_players" => match response.payload_as::<Vec<Player>>() {
                Ok(players) => self.set_players(players),
                Err(e) => tracing::debug!("Not caching player list: {}", e),
            },
            "player/get_player_info" => match response.payload_as::<Player>() {
                Ok(player) => {
                    let mut state = self.players.write();
                    match state.players.iter_mut().find(|p| p.pid == player.pid) {
                        Some(existing) => *existing = player,
                        None => state.players.push(player),
                    }
                }
                Err(e) => tracing::debug!("Not caching player info: {}", e),
            },
            "player/get_play_state" | "player/set_play_state" => {
                if let (Some(pid), Some(state)) = (
                    response.pid(),
                    message.get("state").and_then(|s| s.parse::<PlayState>().ok()),
                ) {
                    self.update_playback(pid, |p| p.play_state = Some(state));
                }
            }
            "player/get_volume" | "player/set_volume" => {
                if let (Some(pid), Some(level)) =
                    (response.pid(), message.parse_value::<u8>("level"))
                {
                    if level <= 100 {
                        self.update_playback(pid, |p| p.volume = Some(level));
                    }
                }
            }
            "player/get_mute" | "player/set_mute" => {
                if let (Some(pid), Some(muted)) =
                    (response.pid(), message.get("state").and_then(parse_on_off))
                {
                    self.update_playback(pid, |p| p.muted = Some(muted));
                }
            }
            "player/get_now_playing_media" => {
                if let Some(pid) = response.pid() {
                    match response.payload_as::<NowPlayingMedia>() {
                        Ok(media) => self.update_playback(pid, |p| p.now_playing = Some(media)),
                        Err(e) => tracing::debug!("Not caching now playing: {}", e),
                    }
                }
            }
            "player/get_play_mode" | "player/set_play_mode" => {
                if let Some(pid) = response.pid() {
                    let repeat = message.get("repeat").and_then(|r| r.parse().ok());
                    let shuffle = message.get("shuffle").and_then(|s| s.parse().ok());
                    self.update_playback(pid, |p| {
                        if repeat.is_some() {
                            p.repeat = repeat;
                        }
                        if shuffle.is_some() {
                            p.shuffle = shuffle;
                        }
                    });
                }
            }
            "browse/get_music_sources" => match response.payload_as::<Vec<MusicSource>>() {
                Ok(sources) => self.set_sources(sources),
                Err(e) => tracing::debug!("Not caching music sources: {}", e),
            },
            _ => {}
        }
    }

    /// Fold an unsolicited event into the cache. Only the fields the event
    /// carries are touched.
    pub fn update_from_event(&self, event: &HeosEvent) {
        match event {
            HeosEvent::PlayerStateChanged { pid, state } => {
                self.update_playback(*pid, |p| p.play_state = Some(*state));
            }
            HeosEvent::VolumeChanged { pid, level, mute } => {
                self.update_playback(*pid, |p| {
                    p.volume = Some(*level);
                    p.muted = Some(*mute);
                });
            }
            HeosEvent::NowPlayingProgress {
                pid,
                cur_pos,
                duration,
            } => {
                self.update_playback(*pid, |p| {
                    p.position_ms = Some(*cur_pos);
                    p.duration_ms = Some(*duration);
                });
            }
            HeosEvent::NowPlayingChanged { pid } => {
                // Descriptor is stale until the next get_now_playing_media
                self.update_playback(*pid, |p| {
                    p.now_playing = None;
                    p.position_ms = None;
                    p.duration_ms = None;
                });
            }
            HeosEvent::RepeatModeChanged { pid, repeat } => {
                self.update_playback(*pid, |p| p.repeat = Some(*repeat));
            }
            HeosEvent::ShuffleModeChanged { pid, shuffle } => {
                self.update_playback(*pid, |p| p.shuffle = Some(*shuffle));
            }
            _ => {}
        }
    }
}
