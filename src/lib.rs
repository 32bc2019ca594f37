//! HEOS Control - Rust Implementation
//!
//! A control session for HEOS audio receivers over the HEOS CLI protocol.
//!
//! This library provides:
//! - Wire codec for HEOS commands, responses and change events
//! - A connection manager with a single persistent TCP link
//! - Request/response correlation (FIFO per command kind, with timeouts)
//! - Event fan-out by category and a cached view of player state
//! - Heartbeat monitoring with bounded exponential-backoff reconnection
//! - Player operations: discovery, volume, mute, playback, sources, presets

pub mod bus;
pub mod config;
pub mod error;
pub mod heos;

pub use bus::{SessionEvent, Subscription};
pub use error::{HeosError, Result};
pub use heos::{ConnectionState, EventCategory, HeosSession, SessionConfig};
