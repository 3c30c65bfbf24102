//! Message keys and telemetry messages
//!
//! Concrete links decode raw vehicle data into a [`Message`] and dispatch it
//! under the [`MessageKey`] of its [`MessageType`].

use std::fmt;

/// Canonical key under which handlers are registered
///
/// Keys are trimmed, upper-cased and stripped of a leading `MSG_`, so
/// `"gps"`, `"MSG_GPS"` and `" GPS "` all name the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey(String);

impl MessageKey {
    /// Key matching every dispatched message
    pub const WILDCARD: &'static str = "*";

    pub fn new(name: impl AsRef<str>) -> Self {
        let upper = name.as_ref().trim().to_ascii_uppercase();
        match upper.strip_prefix("MSG_") {
            Some(rest) if !rest.is_empty() => Self(rest.to_string()),
            _ => Self(upper),
        }
    }

    pub fn wildcard() -> Self {
        Self(Self::WILDCARD.to_string())
    }

    pub fn is_wildcard(&self) -> bool {
        self.0 == Self::WILDCARD
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageKey {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for MessageKey {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

impl From<&String> for MessageKey {
    fn from(name: &String) -> Self {
        Self::new(name)
    }
}

impl From<&MessageKey> for MessageKey {
    fn from(key: &MessageKey) -> Self {
        key.clone()
    }
}

impl From<MessageType> for MessageKey {
    fn from(msg_type: MessageType) -> Self {
        Self(msg_type.as_str().to_string())
    }
}

/// One key or a collection of keys accepted by registration calls
pub trait IntoMessageKeys {
    fn into_message_keys(self) -> Vec<MessageKey>;
}

macro_rules! single_key {
    ($($ty:ty),* $(,)?) => {
        $(
            impl IntoMessageKeys for $ty {
                fn into_message_keys(self) -> Vec<MessageKey> {
                    vec![MessageKey::from(self)]
                }
            }
        )*
    };
}

single_key!(&str, String, &String, MessageKey, &MessageKey, MessageType);

impl<K: Into<MessageKey>> IntoMessageKeys for Vec<K> {
    fn into_message_keys(self) -> Vec<MessageKey> {
        self.into_iter().map(Into::into).collect()
    }
}

impl<K: Into<MessageKey>, const N: usize> IntoMessageKeys for [K; N] {
    fn into_message_keys(self) -> Vec<MessageKey> {
        self.into_iter().map(Into::into).collect()
    }
}

impl<K: Into<MessageKey> + Clone> IntoMessageKeys for &[K] {
    fn into_message_keys(self) -> Vec<MessageKey> {
        self.iter().cloned().map(Into::into).collect()
    }
}

/// Telemetry message types produced by links
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    State,
    GlobalPosition,
    GlobalHome,
    LocalPosition,
    LocalVelocity,
    Attitude,
    RawGyroscope,
    RawAccelerometer,
    Barometer,
    DistanceSensor,
    ConnectionClosed,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::State => "STATE",
            MessageType::GlobalPosition => "GLOBAL_POSITION",
            MessageType::GlobalHome => "GLOBAL_HOME",
            MessageType::LocalPosition => "LOCAL_POSITION",
            MessageType::LocalVelocity => "LOCAL_VELOCITY",
            MessageType::Attitude => "ATTITUDE",
            MessageType::RawGyroscope => "RAW_GYROSCOPE",
            MessageType::RawAccelerometer => "RAW_ACCELEROMETER",
            MessageType::Barometer => "BAROMETER",
            MessageType::DistanceSensor => "DISTANCE_SENSOR",
            MessageType::ConnectionClosed => "CONNECTION_CLOSED",
        }
    }

    pub fn key(&self) -> MessageKey {
        MessageKey::from(*self)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Armed/guided status reported by the vehicle
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StateMessage {
    pub time_ms: u64,
    pub armed: bool,
    /// Vehicle accepts commands from this link
    pub guided: bool,
    pub mode: String,
}

/// Geodetic position (degrees, metres above MSL)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GlobalFrameMessage {
    pub time_ms: u64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f32,
}

/// Local NED vector (position in m or velocity in m/s)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LocalFrameMessage {
    pub time_ms: u64,
    pub north: f32,
    pub east: f32,
    pub down: f32,
}

/// Body-frame vector from a raw IMU sensor
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BodyFrameMessage {
    pub time_ms: u64,
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

/// Euler angles in radians
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AttitudeMessage {
    pub time_ms: u64,
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BarometerMessage {
    pub time_ms: u64,
    pub pressure_hpa: f32,
    pub temperature_c: f32,
}

/// Range finder reading, distances in metres
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DistanceSensorMessage {
    pub time_ms: u64,
    pub min_distance: f32,
    pub max_distance: f32,
    pub current_distance: f32,
    pub orientation: u8,
}

/// Typed inbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    State(StateMessage),
    GlobalPosition(GlobalFrameMessage),
    GlobalHome(GlobalFrameMessage),
    LocalPosition(LocalFrameMessage),
    LocalVelocity(LocalFrameMessage),
    Attitude(AttitudeMessage),
    RawGyroscope(BodyFrameMessage),
    RawAccelerometer(BodyFrameMessage),
    Barometer(BarometerMessage),
    DistanceSensor(DistanceSensorMessage),
    ConnectionClosed,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::State(_) => MessageType::State,
            Message::GlobalPosition(_) => MessageType::GlobalPosition,
            Message::GlobalHome(_) => MessageType::GlobalHome,
            Message::LocalPosition(_) => MessageType::LocalPosition,
            Message::LocalVelocity(_) => MessageType::LocalVelocity,
            Message::Attitude(_) => MessageType::Attitude,
            Message::RawGyroscope(_) => MessageType::RawGyroscope,
            Message::RawAccelerometer(_) => MessageType::RawAccelerometer,
            Message::Barometer(_) => MessageType::Barometer,
            Message::DistanceSensor(_) => MessageType::DistanceSensor,
            Message::ConnectionClosed => MessageType::ConnectionClosed,
        }
    }

    pub fn key(&self) -> MessageKey {
        self.message_type().key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_canonicalization() {
        assert_eq!(MessageKey::new("gps"), MessageKey::new("GPS"));
        assert_eq!(MessageKey::new(" MSG_GPS "), MessageKey::new("GPS"));
        assert_eq!(MessageKey::from("msg_state"), MessageType::State.key());
        assert_eq!(
            MessageKey::from(String::from("Global_Position")),
            MessageType::GlobalPosition.key()
        );
        assert_ne!(MessageKey::new("GPS"), MessageKey::new("GPS2"));
    }

    #[test]
    fn test_prefix_alone_is_kept() {
        assert_eq!(MessageKey::new("msg_").as_str(), "MSG_");
    }

    #[test]
    fn test_wildcard() {
        assert!(MessageKey::new("*").is_wildcard());
        assert!(MessageKey::new(" * ").is_wildcard());
        assert!(MessageKey::wildcard().is_wildcard());
        assert!(!MessageType::State.key().is_wildcard());
    }

    #[test]
    fn test_into_message_keys() {
        assert_eq!("gps".into_message_keys(), vec![MessageKey::new("GPS")]);
        assert_eq!(
            vec!["gps", "state"].into_message_keys(),
            vec![MessageKey::new("GPS"), MessageKey::new("STATE")]
        );
        assert_eq!(
            [MessageType::Attitude, MessageType::Barometer].into_message_keys().len(),
            2
        );
        let keys: &[&str] = &["a", "b", "c"];
        assert_eq!(keys.into_message_keys().len(), 3);
    }

    #[test]
    fn test_message_type_of_message() {
        let msg = Message::LocalVelocity(LocalFrameMessage::default());
        assert_eq!(msg.message_type(), MessageType::LocalVelocity);
        assert_eq!(msg.key().as_str(), "LOCAL_VELOCITY");
        assert_eq!(Message::ConnectionClosed.key().as_str(), "CONNECTION_CLOSED");
    }
}
