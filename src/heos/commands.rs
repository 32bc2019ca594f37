//! Player operations on [`HeosSession`]
//!
//! Everything here targets the active player unless a pid is passed in.
//! Arguments are validated before anything is sent.

use crate::error::{HeosError, Result};
use crate::heos::codec::{Command, Response};
use crate::heos::session::HeosSession;
use crate::heos::types::{
    on_off, parse_on_off, Input, MusicSource, NowPlayingMedia, PlayState, Player, RepeatMode,
    ShuffleMode,
};

/// Volume step bounds accepted by the device
const MIN_VOLUME_STEP: u8 = 1;
const MAX_VOLUME_STEP: u8 = 10;

const MAX_VOLUME: i32 = 100;

impl HeosSession {
    fn active_pid(&self) -> Result<i64> {
        self.inner
            .state()
            .active_player()
            .ok_or(HeosError::NoPlayerSelected)
    }

    /// `group/name?pid=<active>`
    fn player_command(&self, group: &str, name: &str) -> Result<Command> {
        Ok(Command::new(group, name).param("pid", self.active_pid()?))
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Connect, discover players and select one.
    ///
    /// Selection order: `player_name` argument, configured `player_id`,
    /// configured `player_name`, then the first player the device reports.
    pub async fn connect_and_discover(&self, player_name: Option<&str>) -> Result<Player> {
        self.connect().await?;

        let players = self.get_players().await?;
        if players.is_empty() {
            return Err(HeosError::PlayerNotFound(
                "no players found on the network".to_string(),
            ));
        }

        let config = self.config();
        // Exact name first, then any player whose name contains `name`
        let by_name = |name: &str| {
            let wanted = name.trim().to_lowercase();
            players
                .iter()
                .find(|p| p.name.to_lowercase() == wanted)
                .or_else(|| {
                    players
                        .iter()
                        .find(|p| p.name.to_lowercase().contains(&wanted))
                })
                .cloned()
                .ok_or_else(|| HeosError::PlayerNotFound(name.to_string()))
        };

        let player = match (player_name, config.player_id, config.player_name.as_deref()) {
            (Some(name), _, _) => by_name(name)?,
            (None, Some(pid), _) => players
                .iter()
                .find(|p| p.pid == pid)
                .cloned()
                .ok_or_else(|| HeosError::PlayerNotFound(format!("pid {}", pid)))?,
            (None, None, Some(name)) => by_name(name)?,
            (None, None, None) => players[0].clone(),
        };

        tracing::info!("Selected player {} ({})", player.name, player.pid);
        self.select_player(player.pid);
        Ok(player)
    }

    /// Refresh the known player set
    pub async fn get_players(&self) -> Result<Vec<Player>> {
        let response = self.request(Command::new("player", "get_players")).await?;
        match response.payload {
            None => Ok(Vec::new()),
            Some(_) => response.payload_as(),
        }
    }

    pub async fn get_player_info(&self, pid: i64) -> Result<Player> {
        self.request(Command::new("player", "get_player_info").param("pid", pid))
            .await?
            .payload_as()
    }

    /// Make `pid` the active player. A pid missing from the last-known set is
    /// accepted with a warning.
    pub fn select_player(&self, pid: i64) {
        let state = self.inner.state();
        if state.player(pid).is_none() {
            tracing::warn!("Selecting player {} not in the last-known player list", pid);
        }
        state.set_active_player(pid);
    }

    pub fn active_player(&self) -> Option<i64> {
        self.inner.state().active_player()
    }

    /// Cached details of the active player
    pub fn active_player_info(&self) -> Option<Player> {
        let state = self.inner.state();
        state.active_player().and_then(|pid| state.player(pid))
    }

    // =========================================================================
    // Volume
    // =========================================================================

    pub async fn get_volume(&self) -> Result<u8> {
        let response = self
            .request(self.player_command("player", "get_volume")?)
            .await?;
        parse_level(&response)
    }

    /// Set the volume (0-100). Returns the level sent, after any configured limit.
    pub async fn set_volume(&self, level: i32) -> Result<u8> {
        if !(0..=MAX_VOLUME).contains(&level) {
            return Err(HeosError::Validation(format!(
                "volume must be between 0 and {}, got {}",
                MAX_VOLUME, level
            )));
        }
        let command = self.player_command("player", "set_volume")?;

        let mut level = level as u8;
        if let Some(limit) = self.config().volume_limit {
            if level > limit {
                tracing::info!("Volume {} clamped to limit {}", level, limit);
                level = limit;
            }
        }

        self.request(command.param("level", level)).await?;
        Ok(level)
    }

    /// Raise the volume by `step` (clamped to 1-10), never past the configured limit
    pub async fn volume_up(&self, step: u8) -> Result<()> {
        let step = step.clamp(MIN_VOLUME_STEP, MAX_VOLUME_STEP);
        let command = self.player_command("player", "volume_up")?;

        if let Some(limit) = self.config().volume_limit {
            let current = self.get_volume().await?;
            if current >= limit {
                tracing::debug!("Volume {} already at limit {}", current, limit);
                return Ok(());
            }
            if current.saturating_add(step) > limit {
                self.set_volume(i32::from(limit)).await?;
                return Ok(());
            }
        }

        self.request(command.param("step", step)).await?;
        Ok(())
    }

    /// Lower the volume by `step` (clamped to 1-10)
    pub async fn volume_down(&self, step: u8) -> Result<()> {
        let step = step.clamp(MIN_VOLUME_STEP, MAX_VOLUME_STEP);
        let command = self.player_command("player", "volume_down")?;
        self.request(command.param("step", step)).await?;
        Ok(())
    }

    // =========================================================================
    // Mute
    // =========================================================================

    pub async fn get_mute(&self) -> Result<bool> {
        let response = self
            .request(self.player_command("player", "get_mute")?)
            .await?;
        parse_mute(&response)
    }

    pub async fn set_mute(&self, muted: bool) -> Result<()> {
        let command = self
            .player_command("player", "set_mute")?
            .param("state", on_off(muted));
        self.request(command).await?;
        Ok(())
    }

    /// Toggle mute and return the new state as reported by the device
    pub async fn toggle_mute(&self) -> Result<bool> {
        self.request(self.player_command("player", "toggle_mute")?)
            .await?;
        self.get_mute().await
    }

    // =========================================================================
    // Playback
    // =========================================================================

    pub async fn get_play_state(&self) -> Result<PlayState> {
        let response = self
            .request(self.player_command("player", "get_play_state")?)
            .await?;
        parse_play_state(&response)
    }

    pub async fn set_play_state(&self, state: PlayState) -> Result<()> {
        let command = self
            .player_command("player", "set_play_state")?
            .param("state", state);
        self.request(command).await?;
        Ok(())
    }

    pub async fn play(&self) -> Result<()> {
        self.set_play_state(PlayState::Play).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.set_play_state(PlayState::Pause).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.set_play_state(PlayState::Stop).await
    }

    /// Play when paused or stopped, pause when playing. Returns the state set.
    pub async fn toggle_play_pause(&self) -> Result<PlayState> {
        let target = self.get_play_state().await?.toggled();
        self.set_play_state(target).await?;
        Ok(target)
    }

    pub async fn play_next(&self) -> Result<()> {
        self.request(self.player_command("player", "play_next")?)
            .await?;
        Ok(())
    }

    pub async fn play_previous(&self) -> Result<()> {
        self.request(self.player_command("player", "play_previous")?)
            .await?;
        Ok(())
    }

    pub async fn get_play_mode(&self) -> Result<(RepeatMode, ShuffleMode)> {
        let response = self
            .request(self.player_command("player", "get_play_mode")?)
            .await?;
        let repeat = response
            .require("repeat")?
            .parse::<RepeatMode>()
            .map_err(HeosError::Protocol)?;
        let shuffle = response
            .require("shuffle")?
            .parse::<ShuffleMode>()
            .map_err(HeosError::Protocol)?;
        Ok((repeat, shuffle))
    }

    pub async fn set_play_mode(&self, repeat: RepeatMode, shuffle: ShuffleMode) -> Result<()> {
        let command = self
            .player_command("player", "set_play_mode")?
            .param("repeat", repeat)
            .param("shuffle", shuffle);
        self.request(command).await?;
        Ok(())
    }

    pub async fn clear_queue(&self) -> Result<()> {
        self.request(self.player_command("player", "clear_queue")?)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Now playing and sources
    // =========================================================================

    /// Current media. Fields the device leaves out (or sends empty) are `None`.
    pub async fn get_now_playing(&self) -> Result<NowPlayingMedia> {
        let response = self
            .request(self.player_command("player", "get_now_playing_media")?)
            .await?;
        match response.payload {
            None => Ok(NowPlayingMedia::default()),
            Some(_) => response.payload_as(),
        }
    }

    pub async fn get_music_sources(&self) -> Result<Vec<MusicSource>> {
        let response = self
            .request(Command::new("browse", "get_music_sources"))
            .await?;
        match response.payload {
            None => Ok(Vec::new()),
            Some(_) => response.payload_as(),
        }
    }

    /// Switch the active player to a physical input
    pub async fn play_input(&self, input: Input) -> Result<()> {
        let command = self
            .player_command("browse", "play_input")?
            .param("input", input.as_str());
        self.request(command).await?;
        Ok(())
    }

    /// Play preset `preset` (1-based) from HEOS favorites
    pub async fn play_preset(&self, preset: u32) -> Result<()> {
        if preset < 1 {
            return Err(HeosError::Validation(
                "preset must be 1 or greater".to_string(),
            ));
        }
        let command = self
            .player_command("browse", "play_preset")?
            .param("preset", preset);
        self.request(command).await?;
        Ok(())
    }

    /// Play a stream URL on the active player
    pub async fn play_url(&self, url: &str) -> Result<()> {
        let url = url.trim();
        if url.is_empty() {
            return Err(HeosError::Validation("url must not be empty".to_string()));
        }
        let command = self
            .player_command("browse", "play_stream")?
            .param("url", url);
        self.request(command).await?;
        Ok(())
    }
}

fn parse_level(response: &Response) -> Result<u8> {
    let raw = response.require("level")?;
    raw.trim()
        .parse::<u8>()
        .ok()
        .filter(|level| *level <= 100)
        .ok_or_else(|| HeosError::Protocol(format!("invalid volume level '{}'", raw)))
}

fn parse_mute(response: &Response) -> Result<bool> {
    let raw = response.require("state")?;
    parse_on_off(raw).ok_or_else(|| HeosError::Protocol(format!("invalid mute state '{}'", raw)))
}

fn parse_play_state(response: &Response) -> Result<PlayState> {
    response
        .require("state")?
        .parse()
        .map_err(|e| HeosError::Protocol(format!("{}", e)))
}
