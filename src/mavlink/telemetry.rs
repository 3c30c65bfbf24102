//! MAVLink Telemetry Decoding
//!
//! Converts flight controller telemetry into typed link [`Message`]s.
//! Timestamps are receive time in milliseconds since the Unix epoch.

use mavlink::ardupilotmega::{MavMessage, MavSeverity};
use skylink_shared::{
    now_ms, AttitudeMessage, BarometerMessage, BodyFrameMessage, DistanceSensorMessage,
    GlobalFrameMessage, LocalFrameMessage, Message, StateMessage,
};
use tracing::{debug, error, info, warn};

use super::commands::ArduPilotMode;

const STANDARD_GRAVITY: f32 = 9.80665;

/// Decode one MAVLink message into zero or more link messages
pub fn decode(msg: &MavMessage) -> Vec<Message> {
    let time_ms = now_ms();

    match msg {
        MavMessage::HEARTBEAT(hb) => {
            let armed = (hb.base_mode.bits() & 0x80) != 0; // MAV_MODE_FLAG_SAFETY_ARMED
            vec![Message::State(StateMessage {
                time_ms,
                armed,
                guided: hb.custom_mode == ArduPilotMode::Guided as u32,
                mode: mode_to_string(hb.custom_mode),
            })]
        }

        MavMessage::GLOBAL_POSITION_INT(pos) => vec![Message::GlobalPosition(GlobalFrameMessage {
            time_ms,
            latitude: pos.lat as f64 / 1e7,
            longitude: pos.lon as f64 / 1e7,
            altitude: pos.alt as f32 / 1000.0, // mm to m
        })],

        MavMessage::HOME_POSITION(home) => vec![Message::GlobalHome(GlobalFrameMessage {
            time_ms,
            latitude: home.latitude as f64 / 1e7,
            longitude: home.longitude as f64 / 1e7,
            altitude: home.altitude as f32 / 1000.0,
        })],

        MavMessage::LOCAL_POSITION_NED(local) => vec![
            Message::LocalPosition(LocalFrameMessage {
                time_ms,
                north: local.x,
                east: local.y,
                down: local.z,
            }),
            Message::LocalVelocity(LocalFrameMessage {
                time_ms,
                north: local.vx,
                east: local.vy,
                down: local.vz,
            }),
        ],

        MavMessage::ATTITUDE(att) => vec![Message::Attitude(AttitudeMessage {
            time_ms,
            roll: att.roll,
            pitch: att.pitch,
            yaw: att.yaw,
        })],

        MavMessage::SCALED_IMU(imu) => vec![
            Message::RawGyroscope(BodyFrameMessage {
                time_ms,
                x: imu.xgyro as f32 / 1000.0, // mrad/s to rad/s
                y: imu.ygyro as f32 / 1000.0,
                z: imu.zgyro as f32 / 1000.0,
            }),
            Message::RawAccelerometer(BodyFrameMessage {
                time_ms,
                x: imu.xacc as f32 / 1000.0 * STANDARD_GRAVITY, // mG to m/s^2
                y: imu.yacc as f32 / 1000.0 * STANDARD_GRAVITY,
                z: imu.zacc as f32 / 1000.0 * STANDARD_GRAVITY,
            }),
        ],

        MavMessage::SCALED_PRESSURE(baro) => vec![Message::Barometer(BarometerMessage {
            time_ms,
            pressure_hpa: baro.press_abs,
            temperature_c: baro.temperature as f32 / 100.0, // cdegC
        })],

        MavMessage::DISTANCE_SENSOR(range) => vec![Message::DistanceSensor(DistanceSensorMessage {
            time_ms,
            min_distance: range.min_distance as f32 / 100.0, // cm to m
            max_distance: range.max_distance as f32 / 100.0,
            current_distance: range.current_distance as f32 / 100.0,
            orientation: range.orientation as u8,
        })],

        MavMessage::STATUSTEXT(text) => {
            log_status_text(text.severity, &text.text);
            Vec::new()
        }

        _ => Vec::new(),
    }
}

fn log_status_text(severity: MavSeverity, raw: &[u8]) {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches('\0');
    let level = severity_to_string(severity as u8);

    match severity as u8 {
        0..=3 => error!(severity = level, "[FC] {}", text),
        4 => warn!(severity = level, "[FC] {}", text),
        5 | 6 => info!(severity = level, "[FC] {}", text),
        _ => debug!(severity = level, "[FC] {}", text),
    }
}

/// Convert ArduPilot mode number to string
pub fn mode_to_string(mode: u32) -> String {
    match mode {
        0 => "STABILIZE".to_string(),
        1 => "ACRO".to_string(),
        2 => "ALT_HOLD".to_string(),
        3 => "AUTO".to_string(),
        4 => "GUIDED".to_string(),
        5 => "LOITER".to_string(),
        6 => "RTL".to_string(),
        7 => "CIRCLE".to_string(),
        9 => "LAND".to_string(),
        11 => "DRIFT".to_string(),
        13 => "SPORT".to_string(),
        14 => "FLIP".to_string(),
        15 => "AUTOTUNE".to_string(),
        16 => "POSHOLD".to_string(),
        17 => "BRAKE".to_string(),
        18 => "THROW".to_string(),
        19 => "AVOID_ADSB".to_string(),
        20 => "GUIDED_NOGPS".to_string(),
        21 => "SMART_RTL".to_string(),
        _ => format!("UNKNOWN({})", mode),
    }
}

/// Convert MAVLink severity to string
fn severity_to_string(severity: u8) -> &'static str {
    match severity {
        0 => "EMERGENCY",
        1 => "ALERT",
        2 => "CRITICAL",
        3 => "ERROR",
        4 => "WARNING",
        5 => "NOTICE",
        6 => "INFO",
        7 => "DEBUG",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::ardupilotmega::{
        GLOBAL_POSITION_INT_DATA, HEARTBEAT_DATA, LOCAL_POSITION_NED_DATA, MavModeFlag,
        SCALED_IMU_DATA, SCALED_PRESSURE_DATA, SYS_STATUS_DATA,
    };
    use skylink_shared::MessageType;

    #[test]
    fn test_mode_to_string() {
        assert_eq!(mode_to_string(0), "STABILIZE");
        assert_eq!(mode_to_string(4), "GUIDED");
        assert_eq!(mode_to_string(6), "RTL");
        assert_eq!(mode_to_string(99), "UNKNOWN(99)");
    }

    #[test]
    fn test_heartbeat_to_state() {
        let msgs = decode(&MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 4,
            base_mode: MavModeFlag::from_bits_truncate(0x80),
            ..Default::default()
        }));

        match msgs.as_slice() {
            [Message::State(state)] => {
                assert!(state.armed);
                assert!(state.guided);
                assert_eq!(state.mode, "GUIDED");
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_global_position_units() {
        let msgs = decode(&MavMessage::GLOBAL_POSITION_INT(GLOBAL_POSITION_INT_DATA {
            lat: 473977420,
            lon: 85455940,
            alt: 488_500,
            ..Default::default()
        }));

        match msgs.as_slice() {
            [Message::GlobalPosition(pos)] => {
                assert!((pos.latitude - 47.397742).abs() < 1e-9);
                assert!((pos.longitude - 8.545594).abs() < 1e-9);
                assert!((pos.altitude - 488.5).abs() < 1e-3);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_local_position_yields_position_and_velocity() {
        let msgs = decode(&MavMessage::LOCAL_POSITION_NED(LOCAL_POSITION_NED_DATA {
            x: 1.0,
            y: 2.0,
            z: -3.0,
            vx: 0.5,
            ..Default::default()
        }));

        let types: Vec<MessageType> = msgs.iter().map(Message::message_type).collect();
        assert_eq!(types, vec![MessageType::LocalPosition, MessageType::LocalVelocity]);
        match &msgs[1] {
            Message::LocalVelocity(v) => assert_eq!(v.north, 0.5),
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_scaled_imu_units() {
        let msgs = decode(&MavMessage::SCALED_IMU(SCALED_IMU_DATA {
            zacc: -1000,
            xgyro: 500,
            ..Default::default()
        }));

        match msgs.as_slice() {
            [Message::RawGyroscope(gyro), Message::RawAccelerometer(acc)] => {
                assert!((gyro.x - 0.5).abs() < 1e-6);
                assert!((acc.z + STANDARD_GRAVITY).abs() < 1e-4);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_scaled_pressure() {
        let msgs = decode(&MavMessage::SCALED_PRESSURE(SCALED_PRESSURE_DATA {
            press_abs: 1013.25,
            temperature: 2150,
            ..Default::default()
        }));

        match msgs.as_slice() {
            [Message::Barometer(baro)] => {
                assert_eq!(baro.pressure_hpa, 1013.25);
                assert!((baro.temperature_c - 21.5).abs() < 1e-6);
            }
            other => panic!("unexpected decode: {:?}", other),
        }
    }

    #[test]
    fn test_unhandled_message_is_ignored() {
        assert!(decode(&MavMessage::SYS_STATUS(SYS_STATUS_DATA::default())).is_empty());
    }
}
