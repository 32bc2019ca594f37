//! Mock devices for session integration testing
//!
//! These mocks speak the device side of the protocol so the full session
//! (socket, correlator, events, reconnects) can be exercised without hardware.

pub mod heos;

pub use heos::MockHeosDevice;
