//! HEOS CLI protocol client
//!
//! Speaks the line-oriented HEOS control protocol (TCP port 1255): commands go
//! out as `heos://group/command?k=v` lines, JSON responses and change events
//! come back on the same socket.

pub mod codec;
mod commands;
pub mod connection;
pub mod correlator;
pub mod health;
pub mod session;
pub mod state;
pub mod types;

pub use codec::{Command, EventCategory, HeosEvent, Message, Response};
pub use connection::ConnectionState;
pub use session::{HeosSession, SessionConfig};
pub use state::{PlaybackState, StateSnapshot};
pub use types::{
    Input, MusicSource, NowPlayingMedia, PlayState, Player, RepeatMode, ShuffleMode, DEFAULT_PORT,
};
