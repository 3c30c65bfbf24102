//! MAVLink Bridge Module
//!
//! Provides integration with ArduPilot/PX4 flight controllers via MAVLink protocol.
//! Supports serial, UDP and TCP connections.

mod commands;
mod connection;
mod link;
mod telemetry;

pub use connection::{FcConfig, FC_ENV_VAR};
pub use link::MavlinkLink;
