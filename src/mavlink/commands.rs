//! MAVLink Command Translation
//!
//! Builds the MAVLink messages behind each link operation. The builders are
//! pure; sending and confirmation live in the link.

use mavlink::ardupilotmega::{
    AttitudeTargetTypemask, MavAutopilot, MavCmd, MavFrame, MavMessage, MavModeFlag, MavState,
    MavType, PositionTargetTypemask, COMMAND_INT_DATA, COMMAND_LONG_DATA, HEARTBEAT_DATA,
    SET_ACTUATOR_CONTROL_TARGET_DATA, SET_ATTITUDE_TARGET_DATA, SET_POSITION_TARGET_LOCAL_NED_DATA,
};
use skylink_shared::now_ms;

/// Ignore body rates, use the attitude quaternion
const ATTITUDE_ONLY: u8 = 0b0000_0111;
/// Ignore the attitude quaternion, use body rates
const RATES_ONLY: u8 = 0b1000_0000;
/// Velocity + yaw; ignore position, acceleration and yaw rate
const VELOCITY_ONLY: u16 = 0x09C7;
/// Position + yaw; ignore velocity, acceleration and yaw rate
const POSITION_ONLY: u16 = 0x09F8;

/// Actuator group carrying the motor outputs
const MOTOR_GROUP: u8 = 0;

/// Builds commands addressed to one flight controller
#[derive(Debug, Clone, Copy)]
pub struct MavCommandSender {
    target_system: u8,
    target_component: u8,
}

impl MavCommandSender {
    /// Create a new command sender
    pub fn new(target_system: u8, target_component: u8) -> Self {
        Self {
            target_system,
            target_component,
        }
    }

    fn command_long(&self, command: MavCmd, params: [f32; 7]) -> MavMessage {
        MavMessage::COMMAND_LONG(COMMAND_LONG_DATA {
            target_system: self.target_system,
            target_component: self.target_component,
            command,
            confirmation: 0,
            param1: params[0],
            param2: params[1],
            param3: params[2],
            param4: params[3],
            param5: params[4],
            param6: params[5],
            param7: params[6],
        })
    }

    /// Arm the drone
    pub fn arm(&self) -> MavMessage {
        // param1: 1 = arm
        self.command_long(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0])
    }

    /// Disarm the drone
    pub fn disarm(&self) -> MavMessage {
        self.command_long(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, [0.0; 7])
    }

    /// Set flight mode
    pub fn set_mode(&self, mode: ArduPilotMode) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_DO_SET_MODE,
            [
                1.0, // MAV_MODE_FLAG_CUSTOM_MODE_ENABLED
                mode as u32 as f32,
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
            ],
        )
    }

    /// Take off from a local NED position
    pub fn takeoff_local(&self, north: f32, east: f32, down: f32) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_NAV_TAKEOFF_LOCAL,
            [
                0.0, // Minimum pitch
                0.0,
                0.0, // Ascend rate (0 = default)
                f32::NAN, // Yaw (NAN = current)
                east,  // y
                north, // x
                down,  // z
            ],
        )
    }

    /// Land at a local NED position
    pub fn land_local(&self, north: f32, east: f32, down: f32) -> MavMessage {
        self.command_long(
            MavCmd::MAV_CMD_NAV_LAND_LOCAL,
            [0.0, 0.0, 0.0, f32::NAN, east, north, down],
        )
    }

    /// Set home to the given global position
    pub fn set_home(&self, latitude: f64, longitude: f64, altitude: f32) -> MavMessage {
        MavMessage::COMMAND_INT(COMMAND_INT_DATA {
            target_system: self.target_system,
            target_component: self.target_component,
            frame: MavFrame::MAV_FRAME_GLOBAL,
            command: MavCmd::MAV_CMD_DO_SET_HOME,
            current: 0,
            autocontinue: 0,
            param1: 0.0, // 0 = use the given location
            param2: 0.0,
            param3: 0.0,
            param4: f32::NAN,
            x: (latitude * 1e7) as i32,
            y: (longitude * 1e7) as i32,
            z: altitude,
        })
    }

    /// All four motor outputs in one setpoint, each in [0, 1]
    pub fn actuator_controls(&self, motors: [f32; 4]) -> MavMessage {
        let mut controls = [0.0; 8];
        for (slot, throttle) in controls.iter_mut().zip(motors) {
            *slot = throttle.clamp(0.0, 1.0);
        }

        MavMessage::SET_ACTUATOR_CONTROL_TARGET(SET_ACTUATOR_CONTROL_TARGET_DATA {
            time_usec: now_ms() * 1000,
            controls,
            group_mlx: MOTOR_GROUP,
            target_system: self.target_system,
            target_component: self.target_component,
        })
    }

    /// Attitude setpoint with collective thrust
    pub fn attitude_target(&self, roll: f32, pitch: f32, yaw: f32, thrust: f32) -> MavMessage {
        MavMessage::SET_ATTITUDE_TARGET(SET_ATTITUDE_TARGET_DATA {
            time_boot_ms: boot_ms(),
            target_system: self.target_system,
            target_component: self.target_component,
            type_mask: AttitudeTargetTypemask::from_bits_truncate(ATTITUDE_ONLY),
            q: euler_to_quaternion(roll, pitch, yaw),
            thrust: thrust.clamp(0.0, 1.0),
            ..Default::default()
        })
    }

    /// Body rate setpoint with collective thrust
    pub fn attitude_rate_target(&self, roll_rate: f32, pitch_rate: f32, yaw_rate: f32, thrust: f32) -> MavMessage {
        MavMessage::SET_ATTITUDE_TARGET(SET_ATTITUDE_TARGET_DATA {
            time_boot_ms: boot_ms(),
            target_system: self.target_system,
            target_component: self.target_component,
            type_mask: AttitudeTargetTypemask::from_bits_truncate(RATES_ONLY),
            q: [1.0, 0.0, 0.0, 0.0],
            body_roll_rate: roll_rate,
            body_pitch_rate: pitch_rate,
            body_yaw_rate: yaw_rate,
            thrust: thrust.clamp(0.0, 1.0),
            ..Default::default()
        })
    }

    /// Local NED velocity setpoint
    pub fn velocity_target(&self, vn: f32, ve: f32, vd: f32, heading: f32) -> MavMessage {
        MavMessage::SET_POSITION_TARGET_LOCAL_NED(SET_POSITION_TARGET_LOCAL_NED_DATA {
            time_boot_ms: boot_ms(),
            target_system: self.target_system,
            target_component: self.target_component,
            coordinate_frame: MavFrame::MAV_FRAME_LOCAL_NED,
            type_mask: PositionTargetTypemask::from_bits_truncate(VELOCITY_ONLY),
            vx: vn,
            vy: ve,
            vz: vd,
            yaw: heading,
            ..Default::default()
        })
    }

    /// Local NED position setpoint
    pub fn position_target(&self, north: f32, east: f32, down: f32, heading: f32) -> MavMessage {
        MavMessage::SET_POSITION_TARGET_LOCAL_NED(SET_POSITION_TARGET_LOCAL_NED_DATA {
            time_boot_ms: boot_ms(),
            target_system: self.target_system,
            target_component: self.target_component,
            coordinate_frame: MavFrame::MAV_FRAME_LOCAL_NED,
            type_mask: PositionTargetTypemask::from_bits_truncate(POSITION_ONLY),
            x: north,
            y: east,
            z: down,
            yaw: heading,
            ..Default::default()
        })
    }
}

/// GCS heartbeat announcing this companion computer
pub fn heartbeat() -> MavMessage {
    MavMessage::HEARTBEAT(HEARTBEAT_DATA {
        custom_mode: 0,
        mavtype: MavType::MAV_TYPE_GCS,
        autopilot: MavAutopilot::MAV_AUTOPILOT_INVALID,
        base_mode: MavModeFlag::empty(),
        system_status: MavState::MAV_STATE_ACTIVE,
        mavlink_version: 3,
    })
}

/// Euler angles (ZYX) to a [w, x, y, z] quaternion
pub fn euler_to_quaternion(roll: f32, pitch: f32, yaw: f32) -> [f32; 4] {
    let (sr, cr) = (roll * 0.5).sin_cos();
    let (sp, cp) = (pitch * 0.5).sin_cos();
    let (sy, cy) = (yaw * 0.5).sin_cos();

    [
        cr * cp * cy + sr * sp * sy,
        sr * cp * cy - cr * sp * sy,
        cr * sp * cy + sr * cp * sy,
        cr * cp * sy - sr * sp * cy,
    ]
}

fn boot_ms() -> u32 {
    // Wraps after ~49 days, which the autopilot tolerates
    now_ms() as u32
}

/// ArduPilot Copter flight modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ArduPilotMode {
    Stabilize = 0,
    Acro = 1,
    AltHold = 2,
    Auto = 3,
    Guided = 4,
    Loiter = 5,
    Rtl = 6,
    Circle = 7,
    Land = 9,
    Drift = 11,
    Sport = 13,
    Flip = 14,
    AutoTune = 15,
    PosHold = 16,
    Brake = 17,
    Throw = 18,
    AvoidAdsb = 19,
    GuidedNoGps = 20,
    SmartRtl = 21,
    FlowHold = 22,
    Follow = 23,
    ZigZag = 24,
    SystemId = 25,
    HeliAutorotate = 26,
    AutoRtl = 27,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender() -> MavCommandSender {
        MavCommandSender::new(1, 1)
    }

    #[test]
    fn test_ardupilot_modes() {
        assert_eq!(ArduPilotMode::Guided as u32, 4);
        assert_eq!(ArduPilotMode::Loiter as u32, 5);
        assert_eq!(ArduPilotMode::Land as u32, 9);
    }

    #[test]
    fn test_arm_disarm() {
        match sender().arm() {
            MavMessage::COMMAND_LONG(cmd) => {
                assert_eq!(cmd.command, MavCmd::MAV_CMD_COMPONENT_ARM_DISARM);
                assert_eq!(cmd.param1, 1.0);
                assert_eq!(cmd.target_system, 1);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        match sender().disarm() {
            MavMessage::COMMAND_LONG(cmd) => assert_eq!(cmd.param1, 0.0),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_set_mode_guided() {
        match sender().set_mode(ArduPilotMode::Guided) {
            MavMessage::COMMAND_LONG(cmd) => {
                assert_eq!(cmd.command, MavCmd::MAV_CMD_DO_SET_MODE);
                assert_eq!(cmd.param1, 1.0);
                assert_eq!(cmd.param2, 4.0);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_takeoff_passes_position_through() {
        match sender().takeoff_local(1.0, 2.0, -3.0) {
            MavMessage::COMMAND_LONG(cmd) => {
                assert_eq!(cmd.command, MavCmd::MAV_CMD_NAV_TAKEOFF_LOCAL);
                assert_eq!(cmd.param5, 2.0);
                assert_eq!(cmd.param6, 1.0);
                assert_eq!(cmd.param7, -3.0);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_set_home_scales_coordinates() {
        match sender().set_home(47.397742, 8.545594, 488.0) {
            MavMessage::COMMAND_INT(cmd) => {
                assert_eq!(cmd.command, MavCmd::MAV_CMD_DO_SET_HOME);
                assert_eq!(cmd.x, 473977420);
                assert_eq!(cmd.y, 85455940);
                assert_eq!(cmd.z, 488.0);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_actuator_controls_carry_all_motors() {
        match sender().actuator_controls([0.1, 0.2, 1.5, -0.3]) {
            MavMessage::SET_ACTUATOR_CONTROL_TARGET(target) => {
                assert_eq!(target.group_mlx, MOTOR_GROUP);
                assert_eq!(target.target_system, 1);
                assert_eq!(&target.controls[..4], &[0.1, 0.2, 1.0, 0.0]);
                assert!(target.controls[4..].iter().all(|c| *c == 0.0));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_velocity_target() {
        match sender().velocity_target(1.0, -1.0, 0.5, 0.0) {
            MavMessage::SET_POSITION_TARGET_LOCAL_NED(sp) => {
                assert_eq!(sp.coordinate_frame, MavFrame::MAV_FRAME_LOCAL_NED);
                assert_eq!(sp.type_mask.bits(), VELOCITY_ONLY);
                assert_eq!((sp.vx, sp.vy, sp.vz), (1.0, -1.0, 0.5));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_attitude_target_level_is_identity() {
        match sender().attitude_target(0.0, 0.0, 0.0, 0.5) {
            MavMessage::SET_ATTITUDE_TARGET(sp) => {
                assert_eq!(sp.q, [1.0, 0.0, 0.0, 0.0]);
                assert_eq!(sp.thrust, 0.5);
                assert_eq!(sp.type_mask.bits(), ATTITUDE_ONLY);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_quaternion_yaw() {
        let q = euler_to_quaternion(0.0, 0.0, std::f32::consts::PI);
        assert!(q[0].abs() < 1e-6);
        assert!((q[3] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_heartbeat_is_gcs() {
        match heartbeat() {
            MavMessage::HEARTBEAT(hb) => {
                assert_eq!(hb.mavtype, MavType::MAV_TYPE_GCS);
                assert_eq!(hb.mavlink_version, 3);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
