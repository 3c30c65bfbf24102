//! Link State Machine
//!
//! Defines which link operations are valid in which state and where each
//! successful operation leaves the link.
//!
//! ```text
//! Disconnected --start--> Connected --take_control--> ControlAcquired --arm--> Armed
//!      ^                      ^                             ^                    |
//!      |                      +------release_control--------+<------disarm-------+
//!      +------------------------------- stop (from any state) -------------------+
//! ```

use std::fmt;

use crate::error::LinkError;

/// Connection and authority state of a link, ordered from least to most capable
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    Connected,
    ControlAcquired,
    Armed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::ControlAcquired => write!(f, "control_acquired"),
            LinkState::Armed => write!(f, "armed"),
        }
    }
}

/// Operations of the link contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Start,
    Stop,
    TakeControl,
    ReleaseControl,
    Arm,
    Disarm,
    CmdAttitude,
    CmdAttitudeRate,
    CmdVelocity,
    CmdMotors,
    CmdPosition,
    Takeoff,
    Land,
    SetHomePosition,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Start => "start",
            Operation::Stop => "stop",
            Operation::TakeControl => "take_control",
            Operation::ReleaseControl => "release_control",
            Operation::Arm => "arm",
            Operation::Disarm => "disarm",
            Operation::CmdAttitude => "cmd_attitude",
            Operation::CmdAttitudeRate => "cmd_attitude_rate",
            Operation::CmdVelocity => "cmd_velocity",
            Operation::CmdMotors => "cmd_motors",
            Operation::CmdPosition => "cmd_position",
            Operation::Takeoff => "takeoff",
            Operation::Land => "land",
            Operation::SetHomePosition => "set_home_position",
        }
    }

    /// Whether this operation may be issued while the link is in `state`
    pub fn is_permitted(&self, state: LinkState) -> bool {
        use LinkState::*;

        match self {
            Operation::Start => state == Disconnected,
            Operation::Stop => true,
            Operation::TakeControl => state == Connected,
            Operation::ReleaseControl => state >= ControlAcquired,
            Operation::Arm => state == ControlAcquired,
            Operation::Disarm => matches!(state, Armed | ControlAcquired),
            Operation::CmdAttitude
            | Operation::CmdAttitudeRate
            | Operation::CmdVelocity
            | Operation::CmdMotors
            | Operation::CmdPosition
            | Operation::Takeoff
            | Operation::Land => state == Armed,
            Operation::SetHomePosition => state >= Connected,
        }
    }

    /// State the link ends up in once this operation succeeds from `state`
    pub fn next_state(&self, state: LinkState) -> LinkState {
        match self {
            Operation::Start => LinkState::Connected,
            Operation::Stop => LinkState::Disconnected,
            Operation::TakeControl => LinkState::ControlAcquired,
            Operation::ReleaseControl => LinkState::Connected,
            Operation::Arm => LinkState::Armed,
            Operation::Disarm => LinkState::ControlAcquired,
            _ => state,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks the state of a single link and guards operations against it
#[derive(Debug, Default)]
pub struct LinkStateMachine {
    current_state: LinkState,
}

impl LinkStateMachine {
    /// Create a new state machine in the Disconnected state
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LinkState {
        self.current_state
    }

    /// Fail fast if `operation` is not valid in the current state
    pub fn check(&self, operation: Operation) -> Result<(), LinkError> {
        if operation.is_permitted(self.current_state) {
            Ok(())
        } else {
            Err(LinkError::InvalidState {
                operation,
                state: self.current_state,
            })
        }
    }

    /// Record that `operation` completed and return the new state
    pub fn complete(&mut self, operation: Operation) -> LinkState {
        self.current_state = operation.next_state(self.current_state);
        self.current_state
    }

    /// Force the link back to Disconnected (transport lost)
    pub fn reset(&mut self) -> LinkState {
        self.current_state = LinkState::Disconnected;
        self.current_state
    }
}

/// Check if a transition from one state to another is valid
pub fn is_valid_transition(from: LinkState, to: LinkState) -> bool {
    use LinkState::*;

    match (from, to) {
        (a, b) if a == b => true,

        // Stop is reachable from anywhere
        (_, Disconnected) => true,

        (Disconnected, Connected) => true,
        (Connected, ControlAcquired) => true,
        (ControlAcquired, Armed) => true,

        (Armed, ControlAcquired) => true,
        (ControlAcquired | Armed, Connected) => true,

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let fsm = LinkStateMachine::new();
        assert_eq!(fsm.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_normal_lifecycle() {
        let mut fsm = LinkStateMachine::new();

        let steps = [
            (Operation::Start, LinkState::Connected),
            (Operation::TakeControl, LinkState::ControlAcquired),
            (Operation::Arm, LinkState::Armed),
            (Operation::CmdVelocity, LinkState::Armed),
            (Operation::Disarm, LinkState::ControlAcquired),
            (Operation::ReleaseControl, LinkState::Connected),
            (Operation::Stop, LinkState::Disconnected),
        ];

        for (op, expected) in steps {
            let before = fsm.state();
            assert!(fsm.check(op).is_ok(), "{op} should be allowed while {before}");
            assert_eq!(fsm.complete(op), expected);
            assert!(is_valid_transition(before, expected));
        }
    }

    #[test]
    fn test_motion_requires_armed() {
        let mut fsm = LinkStateMachine::new();
        fsm.complete(Operation::Start);

        let err = fsm.check(Operation::CmdVelocity).unwrap_err();
        assert_eq!(
            err,
            LinkError::InvalidState {
                operation: Operation::CmdVelocity,
                state: LinkState::Connected,
            }
        );

        fsm.complete(Operation::TakeControl);
        assert!(fsm.check(Operation::Takeoff).is_err());
        fsm.complete(Operation::Arm);
        assert!(fsm.check(Operation::Takeoff).is_ok());
        assert!(fsm.check(Operation::CmdMotors).is_ok());
    }

    #[test]
    fn test_invalid_operations() {
        let fsm = LinkStateMachine::new();

        // Can't arm without a connection and authority
        assert!(fsm.check(Operation::Arm).is_err());
        assert!(fsm.check(Operation::TakeControl).is_err());
        assert!(fsm.check(Operation::SetHomePosition).is_err());
        assert!(fsm.check(Operation::Stop).is_ok());
        assert_eq!(fsm.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_start_only_from_disconnected() {
        let mut fsm = LinkStateMachine::new();
        fsm.complete(Operation::Start);
        assert!(fsm.check(Operation::Start).is_err());
    }

    #[test]
    fn test_release_from_armed() {
        assert!(Operation::ReleaseControl.is_permitted(LinkState::Armed));
        assert_eq!(
            Operation::ReleaseControl.next_state(LinkState::Armed),
            LinkState::Connected
        );
        assert!(!Operation::ReleaseControl.is_permitted(LinkState::Connected));
    }

    #[test]
    fn test_stop_from_any_state() {
        for state in [
            LinkState::Disconnected,
            LinkState::Connected,
            LinkState::ControlAcquired,
            LinkState::Armed,
        ] {
            assert!(Operation::Stop.is_permitted(state));
            assert_eq!(Operation::Stop.next_state(state), LinkState::Disconnected);
        }
    }

    #[test]
    fn test_skipping_states_is_invalid() {
        assert!(!is_valid_transition(LinkState::Disconnected, LinkState::Armed));
        assert!(!is_valid_transition(LinkState::Connected, LinkState::Armed));
        assert!(is_valid_transition(LinkState::Armed, LinkState::Disconnected));
    }
}
