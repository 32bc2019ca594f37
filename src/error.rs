//! Error types for HEOS session operations.

use std::time::Duration;

use thiserror::Error;

/// Error returned by every session operation.
#[derive(Debug, Clone, Error)]
pub enum HeosError {
    /// Caller-supplied parameter out of contract. Nothing was sent.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// Could not establish the connection or complete the handshake.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Operation requires a Connected session.
    #[error("not connected")]
    NotConnected,

    /// Socket failed while the request was in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// No response within the request bound.
    #[error("{command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    /// Malformed or unexpected response shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Request cancelled by disconnect or session teardown.
    #[error("request cancelled")]
    Cancelled,

    /// The device answered `result=fail`.
    #[error("HEOS error {eid}: {text}")]
    Command { eid: i32, text: String },

    /// Player-targeted operation without an active player.
    #[error("no active player selected")]
    NoPlayerSelected,

    /// Discovery found no matching player.
    #[error("player not found: {0}")]
    PlayerNotFound(String),
}

pub type Result<T> = std::result::Result<T, HeosError>;

/// Known error codes from the HEOS CLI documentation
pub mod error_codes {
    pub const UNRECOGNIZED_COMMAND: i32 = 1;
    pub const INVALID_ID: i32 = 2;
    pub const WRONG_ARGUMENTS: i32 = 3;
    pub const RESOURCE_NOT_FOUND: i32 = 4;
    pub const RESOURCE_IN_USE: i32 = 5;
    pub const INVALID_CREDENTIALS: i32 = 6;
    pub const USER_NOT_LOGGED_IN: i32 = 7;
    pub const USER_NOT_FOUND: i32 = 8;
    pub const INTERNAL_ERROR: i32 = 9;
    pub const SYSTEM_ERROR: i32 = 10;
    pub const PROCESSING_ERROR: i32 = 12;
    pub const MEDIA_NOT_FOUND: i32 = 13;
    pub const OPTION_NOT_SUPPORTED: i32 = 14;
    pub const TOO_MANY_REQUESTS: i32 = 15;
    pub const COMMAND_NOT_PROCESSED: i32 = 16;
}
