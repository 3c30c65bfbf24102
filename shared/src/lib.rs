//! SkyLink Shared Types
//!
//! This crate provides the message dispatcher, the link state machine and the
//! [`Link`] contract that every vehicle link implements, plus an in-process
//! [`LoopbackLink`] for tests.

pub mod dispatcher;
pub mod error;
pub mod link;
pub mod loopback;
pub mod messages;
pub mod state_machine;
pub mod stream;

use std::time::{SystemTime, UNIX_EPOCH};

pub use dispatcher::{
    DispatchReporter, Dispatcher, FailureCause, Handler, HandlerFailure, HandlerId, TracingReporter,
};
pub use error::{ErrorKind, LinkError};
pub use link::{Link, LinkDispatcher, LinkHandler, LinkSource, LinkStatus};
pub use loopback::{LoopbackConfig, LoopbackLink, SentCommand};
pub use messages::{
    AttitudeMessage, BarometerMessage, BodyFrameMessage, DistanceSensorMessage, GlobalFrameMessage,
    IntoMessageKeys, LocalFrameMessage, Message, MessageKey, MessageType, StateMessage,
};
pub use state_machine::{LinkState, LinkStateMachine, Operation};
pub use stream::MessageStream;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Timing parameters shared by link implementations
pub mod timing {
    /// Interval between heartbeats sent to the vehicle
    pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;

    /// Vehicle silence after which the link counts as lost
    pub const HEARTBEAT_TIMEOUT_MS: u64 = 5000;

    /// How long `start` waits for the transport and the first vehicle heartbeat
    pub const CONNECT_TIMEOUT_MS: u64 = 5000;

    /// How long authority and arming requests wait for confirmation
    pub const COMMAND_ACK_TIMEOUT_MS: u64 = 3000;
}
