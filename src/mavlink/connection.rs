//! Flight Controller Connection
//!
//! Opens a MAVLink connection to an ArduPilot/PX4 flight controller via serial,
//! UDP or TCP and runs the three tasks of an active session: the reader
//! feeding ingestion (with the vehicle heartbeat watchdog), a single writer
//! serializing outbound messages, and the GCS heartbeat.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use mavlink::ardupilotmega::{MavCmd, MavMessage, MavResult};
use mavlink::error::MessageReadError;
use mavlink::{AsyncMavConnection, MavHeader};
use skylink_shared::{timing, LinkError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::commands::heartbeat;

/// Environment variable overriding the flight controller connection string
pub const FC_ENV_VAR: &str = "SKYLINK_FC";

const OUTBOUND_QUEUE: usize = 100;

pub type SharedConnection = Arc<dyn AsyncMavConnection<MavMessage> + Send + Sync>;

/// Connection type for flight controller
#[derive(Debug, Clone, PartialEq)]
pub enum FcConnectionType {
    /// Serial port connection (e.g., "/dev/ttyACM0" or "/dev/serial0")
    Serial { port: String, baud: u32 },
    /// Listen for UDP (e.g., "127.0.0.1:14550")
    Udp { address: String },
    /// Send UDP to a fixed peer
    UdpOut { address: String },
    /// Listen for a TCP client (e.g., "127.0.0.1:5760")
    Tcp { address: String },
    /// Connect to a TCP server
    TcpOut { address: String },
}

impl Default for FcConnectionType {
    fn default() -> Self {
        // Default to SITL UDP for development
        Self::Udp {
            address: "127.0.0.1:14550".into(),
        }
    }
}

impl FcConnectionType {
    /// Connection string understood by `mavlink::connect`
    pub fn address(&self) -> String {
        match self {
            FcConnectionType::Serial { port, baud } => format!("serial:{}:{}", port, baud),
            FcConnectionType::Udp { address } => format!("udpin:{}", address),
            FcConnectionType::UdpOut { address } => format!("udpout:{}", address),
            FcConnectionType::Tcp { address } => format!("tcpin:{}", address),
            FcConnectionType::TcpOut { address } => format!("tcpout:{}", address),
        }
    }
}

impl FromStr for FcConnectionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (scheme, rest) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| anyhow!("missing scheme in connection string '{}'", s))?;

        if rest.is_empty() {
            bail!("missing address in connection string '{}'", s);
        }

        let address = rest.to_string();
        match scheme {
            "serial" => {
                let (port, baud) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| anyhow!("serial connection needs <port>:<baud>, got '{}'", rest))?;
                let baud = baud
                    .parse()
                    .with_context(|| format!("invalid baud rate '{}'", baud))?;
                Ok(Self::Serial {
                    port: port.to_string(),
                    baud,
                })
            }
            "udpin" | "udp" => Ok(Self::Udp { address }),
            "udpout" => Ok(Self::UdpOut { address }),
            "tcpin" => Ok(Self::Tcp { address }),
            "tcpout" | "tcp" => Ok(Self::TcpOut { address }),
            other => bail!("unknown connection scheme '{}'", other),
        }
    }
}

/// Configuration for flight controller connection
#[derive(Debug, Clone)]
pub struct FcConfig {
    /// Connection type and parameters
    pub connection: FcConnectionType,
    /// System ID for this companion computer
    pub system_id: u8,
    /// Component ID for this companion computer
    pub component_id: u8,
    /// Target system ID (flight controller)
    pub target_system: u8,
    /// Target component ID (autopilot)
    pub target_component: u8,
    /// How long `start` waits for the transport, and again for the first
    /// vehicle heartbeat
    pub connect_timeout: Duration,
    /// How long authority and arming requests wait for confirmation
    pub command_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Vehicle silence after which the session counts as lost
    pub heartbeat_timeout: Duration,
}

impl Default for FcConfig {
    fn default() -> Self {
        Self {
            connection: FcConnectionType::default(),
            system_id: 255,      // Companion computer
            component_id: 190,   // MAV_COMP_ID_ONBOARD_COMPUTER
            target_system: 1,    // Autopilot
            target_component: 1, // MAV_COMP_ID_AUTOPILOT1
            connect_timeout: Duration::from_millis(timing::CONNECT_TIMEOUT_MS),
            command_timeout: Duration::from_millis(timing::COMMAND_ACK_TIMEOUT_MS),
            heartbeat_interval: Duration::from_millis(timing::HEARTBEAT_INTERVAL_MS),
            heartbeat_timeout: Duration::from_millis(timing::HEARTBEAT_TIMEOUT_MS),
        }
    }
}

impl FcConfig {
    /// Defaults, with the connection taken from `SKYLINK_FC` when set
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(conn) = std::env::var(FC_ENV_VAR) {
            config.connection = conn
                .parse()
                .with_context(|| format!("invalid {}", FC_ENV_VAR))?;
        }
        Ok(config)
    }

    /// Create MAVLink header for sending messages
    pub fn make_header(&self, sequence: u8) -> MavHeader {
        MavHeader {
            system_id: self.system_id,
            component_id: self.component_id,
            sequence,
        }
    }
}

/// Acknowledgement of a command by the vehicle
#[derive(Debug, Clone)]
pub struct CommandAck {
    /// Position of this ack in the stream of acks received this session
    pub seq: u64,
    pub command: MavCmd,
    pub result: MavResult,
}

/// What the reader has learned about the vehicle so far
#[derive(Debug, Clone, Default)]
pub struct VehicleStatus {
    pub heartbeats: u64,
    pub armed: bool,
    pub custom_mode: u32,
    pub acks: u64,
    pub last_ack: Option<CommandAck>,
    pub transport_lost: bool,
}

impl VehicleStatus {
    /// Fold a message from the vehicle into the status; returns whether it changed
    pub fn apply(&mut self, msg: &MavMessage) -> bool {
        match msg {
            MavMessage::HEARTBEAT(hb) => {
                self.heartbeats += 1;
                self.armed = (hb.base_mode.bits() & 0x80) != 0; // MAV_MODE_FLAG_SAFETY_ARMED
                self.custom_mode = hb.custom_mode;
                true
            }
            MavMessage::COMMAND_ACK(ack) => {
                self.acks += 1;
                self.last_ack = Some(CommandAck {
                    seq: self.acks,
                    command: ack.command,
                    result: ack.result,
                });
                true
            }
            _ => false,
        }
    }

    /// A refusal of `command` received after ack number `after`
    pub fn rejection(&self, command: MavCmd, after: u64) -> Option<MavResult> {
        let ack = self.last_ack.as_ref()?;
        if ack.seq <= after || ack.command != command {
            return None;
        }
        match ack.result {
            MavResult::MAV_RESULT_ACCEPTED | MavResult::MAV_RESULT_IN_PROGRESS => None,
            result => Some(result),
        }
    }
}

/// A queued outbound message and, for callers that wait, where to report the write
struct Outbound {
    msg: MavMessage,
    reply: Option<oneshot::Sender<Result<(), LinkError>>>,
}

/// An open connection and the tasks serving it
///
/// Dropping the session aborts all three tasks; [`Session::close`] also waits
/// for them, so the transport is released when it returns.
pub struct Session {
    outbound_tx: mpsc::Sender<Outbound>,
    lost_rx: watch::Receiver<Option<String>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl Session {
    /// Open the configured connection and start the session tasks
    ///
    /// `on_message` runs on the reader task for every message from the target
    /// system.
    pub async fn open<F>(config: &FcConfig, on_message: F) -> Result<Self, LinkError>
    where
        F: FnMut(MavHeader, MavMessage) + Send + 'static,
    {
        let address = config.connection.address();
        info!(%address, "Connecting to flight controller");

        let conn = match timeout(config.connect_timeout, mavlink::connect_async::<MavMessage>(&address)).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => return Err(LinkError::Connection(format!("{}: {}", address, e))),
            Err(_) => {
                return Err(LinkError::Connection(format!(
                    "{}: not connected within {:?}",
                    address, config.connect_timeout
                )))
            }
        };

        let session = Self::spawn(Arc::from(conn), config, on_message);
        info!(%address, "Connected to flight controller");
        Ok(session)
    }

    /// Start the session tasks on an open connection
    pub fn spawn<F>(conn: SharedConnection, config: &FcConfig, on_message: F) -> Self
    where
        F: FnMut(MavHeader, MavMessage) + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (lost_tx, lost_rx) = watch::channel(None);
        let lost_tx = Arc::new(lost_tx);

        let reader = tokio::spawn(read_loop(
            conn.clone(),
            config.target_system,
            config.heartbeat_timeout,
            on_message,
            lost_tx.clone(),
        ));
        let writer = tokio::spawn(write_loop(conn, config.clone(), outbound_rx, lost_tx));
        let heartbeat = tokio::spawn(heartbeat_loop(outbound_tx.clone(), config.heartbeat_interval));

        Self {
            outbound_tx,
            lost_rx,
            reader,
            writer,
            heartbeat,
        }
    }

    /// Write a message and wait until the transport accepted it
    pub async fn send(&self, msg: MavMessage) -> Result<(), LinkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.outbound_tx
            .send(Outbound {
                msg,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| session_closed())?;
        reply_rx.await.map_err(|_| session_closed())?
    }

    /// Becomes `Some(reason)` once the transport fails or the vehicle goes silent
    pub fn lost(&self) -> watch::Receiver<Option<String>> {
        self.lost_rx.clone()
    }

    /// Stop the session tasks and wait until they have released the transport
    pub async fn close(mut self) {
        debug!("Closing flight controller session");
        for task in [&self.reader, &self.writer, &self.heartbeat] {
            task.abort();
        }
        for task in [&mut self.reader, &mut self.writer, &mut self.heartbeat] {
            let _ = task.await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
        self.heartbeat.abort();
    }
}

fn session_closed() -> LinkError {
    LinkError::Transport("FC connection closed".into())
}

/// Record the first loss reason; later ones are ignored
fn report_loss(lost_tx: &watch::Sender<Option<String>>, reason: String) {
    lost_tx.send_if_modified(|lost| {
        if lost.is_some() {
            return false;
        }
        *lost = Some(reason);
        true
    });
}

/// Read until the transport fails or the vehicle stops sending heartbeats
///
/// The watchdog arms on the first heartbeat from `target_system`.
async fn read_loop<F>(
    conn: SharedConnection,
    target_system: u8,
    heartbeat_timeout: Duration,
    mut on_message: F,
    lost_tx: Arc<watch::Sender<Option<String>>>,
) where
    F: FnMut(MavHeader, MavMessage),
{
    let mut deadline: Option<Instant> = None;

    loop {
        let silence = async move {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            received = conn.recv() => match received {
                Ok((header, msg)) => {
                    if header.system_id != target_system {
                        continue;
                    }
                    if matches!(msg, MavMessage::HEARTBEAT(_)) {
                        deadline = Some(Instant::now() + heartbeat_timeout);
                    }
                    on_message(header, msg);
                }
                Err(MessageReadError::Io(e)) => {
                    error!("Flight controller read error: {}", e);
                    report_loss(&lost_tx, e.to_string());
                    return;
                }
                Err(e) => {
                    debug!("Dropping unparseable MAVLink frame: {}", e);
                }
            },
            _ = silence => {
                warn!("No heartbeat from vehicle for {:?}", heartbeat_timeout);
                report_loss(&lost_tx, format!("no vehicle heartbeat for {:?}", heartbeat_timeout));
                return;
            }
        }
    }
}

/// Serialize every outbound message onto the connection
///
/// A failed write is reported to its caller and counts as transport loss.
async fn write_loop(
    conn: SharedConnection,
    config: FcConfig,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    lost_tx: Arc<watch::Sender<Option<String>>>,
) {
    let mut sequence: u8 = 0;
    while let Some(Outbound { msg, reply }) = outbound_rx.recv().await {
        let header = config.make_header(sequence);
        sequence = sequence.wrapping_add(1);

        let result = conn
            .send(&header, &msg)
            .await
            .map(|_| ())
            .map_err(|e| LinkError::Transport(format!("write failed: {}", e)));
        if let Err(ref e) = result {
            warn!("Failed to send MAVLink message: {}", e);
            report_loss(&lost_tx, e.to_string());
        }
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }
}

async fn heartbeat_loop(outbound_tx: mpsc::Sender<Outbound>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        let beat = Outbound {
            msg: heartbeat(),
            reply: None,
        };
        if outbound_tx.send(beat).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    use mavlink::ardupilotmega::{COMMAND_ACK_DATA, HEARTBEAT_DATA, MavModeFlag};
    use mavlink::error::MessageWriteError;
    use mavlink::MavlinkVersion;
    use tokio::sync::Mutex;

    /// In-memory connection: frames come from a channel, writes optionally fail
    struct ScriptedWire {
        inbound: Mutex<mpsc::UnboundedReceiver<(MavHeader, MavMessage)>>,
        fail_writes: bool,
    }

    impl ScriptedWire {
        fn new(fail_writes: bool) -> (mpsc::UnboundedSender<(MavHeader, MavMessage)>, SharedConnection) {
            let (tx, rx) = mpsc::unbounded_channel();
            let wire = ScriptedWire {
                inbound: Mutex::new(rx),
                fail_writes,
            };
            (tx, Arc::new(wire))
        }
    }

    #[async_trait::async_trait]
    impl AsyncMavConnection<MavMessage> for ScriptedWire {
        async fn recv(&self) -> Result<(MavHeader, MavMessage), MessageReadError> {
            match self.inbound.lock().await.recv().await {
                Some(frame) => Ok(frame),
                None => Err(MessageReadError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "wire closed",
                ))),
            }
        }

        async fn send(&self, _header: &MavHeader, _data: &MavMessage) -> Result<usize, MessageWriteError> {
            if self.fail_writes {
                Err(MessageWriteError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "cable cut")))
            } else {
                Ok(1)
            }
        }

        fn set_protocol_version(&mut self, _version: MavlinkVersion) {}

        fn protocol_version(&self) -> MavlinkVersion {
            MavlinkVersion::V2
        }

        fn set_allow_recv_any_version(&mut self, _allow: bool) {}

        fn allow_recv_any_version(&self) -> bool {
            true
        }
    }

    fn vehicle_header(system_id: u8) -> MavHeader {
        MavHeader {
            system_id,
            component_id: 1,
            sequence: 0,
        }
    }

    fn quick_config() -> FcConfig {
        FcConfig {
            connect_timeout: Duration::from_millis(300),
            heartbeat_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    async fn wait_lost(session: &Session) -> String {
        let mut lost = session.lost();
        let reason = timeout(Duration::from_secs(2), lost.wait_for(|l| l.is_some()))
            .await
            .expect("session not reported lost")
            .unwrap()
            .clone();
        reason.unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = FcConfig::default();
        assert_eq!(config.system_id, 255);
        assert_eq!(config.target_system, 1);
        assert_eq!(config.connection.address(), "udpin:127.0.0.1:14550");
    }

    #[test]
    fn test_connection_types() {
        let serial: FcConnectionType = "serial:/dev/ttyACM0:57600".parse().unwrap();
        assert_eq!(
            serial,
            FcConnectionType::Serial {
                port: "/dev/ttyACM0".into(),
                baud: 57600,
            }
        );
        assert_eq!(serial.address(), "serial:/dev/ttyACM0:57600");

        let udp: FcConnectionType = "udpin:0.0.0.0:14550".parse().unwrap();
        assert!(matches!(udp, FcConnectionType::Udp { .. }));

        let tcp: FcConnectionType = "tcpout:127.0.0.1:5760".parse().unwrap();
        assert_eq!(tcp.address(), "tcpout:127.0.0.1:5760");
    }

    #[test]
    fn test_invalid_connection_strings() {
        assert!("nothing".parse::<FcConnectionType>().is_err());
        assert!("carrier-pigeon:home".parse::<FcConnectionType>().is_err());
        assert!("serial:/dev/ttyUSB0".parse::<FcConnectionType>().is_err());
        assert!("serial:/dev/ttyUSB0:fast".parse::<FcConnectionType>().is_err());
        assert!("udpin:".parse::<FcConnectionType>().is_err());
    }

    #[test]
    fn test_vehicle_status_heartbeat() {
        let mut status = VehicleStatus::default();
        let hb = MavMessage::HEARTBEAT(HEARTBEAT_DATA {
            custom_mode: 4,
            base_mode: MavModeFlag::from_bits_truncate(0x80 | 0x01),
            ..Default::default()
        });

        assert!(status.apply(&hb));
        assert_eq!(status.heartbeats, 1);
        assert!(status.armed);
        assert_eq!(status.custom_mode, 4);
    }

    #[test]
    fn test_rejection_only_counts_newer_acks() {
        let mut status = VehicleStatus::default();
        let denied = MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
            command: MavCmd::MAV_CMD_COMPONENT_ARM_DISARM,
            result: MavResult::MAV_RESULT_DENIED,
            ..Default::default()
        });

        status.apply(&denied);
        assert_eq!(
            status.rejection(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, 0),
            Some(MavResult::MAV_RESULT_DENIED)
        );
        // Already seen before the request was sent
        assert_eq!(status.rejection(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, 1), None);
        // Different command
        assert_eq!(status.rejection(MavCmd::MAV_CMD_DO_SET_MODE, 0), None);
    }

    #[test]
    fn test_accepted_ack_is_not_rejection() {
        let mut status = VehicleStatus::default();
        status.apply(&MavMessage::COMMAND_ACK(COMMAND_ACK_DATA {
            command: MavCmd::MAV_CMD_DO_SET_MODE,
            result: MavResult::MAV_RESULT_ACCEPTED,
            ..Default::default()
        }));
        assert_eq!(status.rejection(MavCmd::MAV_CMD_DO_SET_MODE, 0), None);
    }

    #[tokio::test]
    async fn test_failed_write_reaches_caller() {
        let (_frames, wire) = ScriptedWire::new(true);
        let session = Session::spawn(wire, &quick_config(), |_, _| {});

        let err = session.send(heartbeat()).await.unwrap_err();
        assert!(matches!(err, LinkError::Transport(_)));
        assert!(wait_lost(&session).await.contains("cable cut"));
    }

    #[tokio::test]
    async fn test_successful_write() {
        let (_frames, wire) = ScriptedWire::new(false);
        let session = Session::spawn(wire, &quick_config(), |_, _| {});

        session.send(heartbeat()).await.unwrap();
        assert!(session.lost().borrow().is_none());
        session.close().await;
    }

    #[tokio::test]
    async fn test_silent_vehicle_is_lost() {
        let (frames, wire) = ScriptedWire::new(false);
        let received = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = received.clone();
        let session = Session::spawn(wire, &quick_config(), move |_, _| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        frames
            .send((vehicle_header(1), MavMessage::HEARTBEAT(HEARTBEAT_DATA::default())))
            .unwrap();
        // Heartbeats from other systems neither reach ingestion nor feed the watchdog
        for _ in 0..5 {
            frames
                .send((vehicle_header(42), MavMessage::HEARTBEAT(HEARTBEAT_DATA::default())))
                .unwrap();
        }

        assert!(wait_lost(&session).await.contains("no vehicle heartbeat"));
        assert_eq!(received.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_watchdog_waits_for_first_heartbeat() {
        let (_frames, wire) = ScriptedWire::new(false);
        let session = Session::spawn(wire, &quick_config(), |_, _| {});

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(session.lost().borrow().is_none());
    }

    #[tokio::test]
    async fn test_read_error_is_lost() {
        let (frames, wire) = ScriptedWire::new(false);
        let session = Session::spawn(wire, &quick_config(), |_, _| {});

        drop(frames);
        assert!(wait_lost(&session).await.contains("wire closed"));
    }

    #[tokio::test]
    async fn test_connect_respects_timeout() {
        // Nobody ever connects to a TCP listener
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .and_then(|l| l.local_addr())
            .unwrap()
            .port();
        let config = FcConfig {
            connection: FcConnectionType::Tcp {
                address: format!("127.0.0.1:{}", port),
            },
            ..quick_config()
        };

        let opened = timeout(Duration::from_secs(3), Session::open(&config, |_, _| {}))
            .await
            .expect("open did not honour connect_timeout");
        match opened {
            Err(LinkError::Connection(reason)) => assert!(reason.contains("not connected within")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connected to nobody"),
        }
    }

    #[tokio::test]
    async fn test_close_releases_udp_port() {
        let port = std::net::UdpSocket::bind("127.0.0.1:0")
            .and_then(|s| s.local_addr())
            .unwrap()
            .port();
        let config = FcConfig {
            connection: FcConnectionType::Udp {
                address: format!("127.0.0.1:{}", port),
            },
            ..quick_config()
        };

        let session = Session::open(&config, |_, _| {}).await.unwrap();
        session.close().await;

        let session = Session::open(&config, |_, _| {}).await.unwrap();
        session.close().await;
        assert!(std::net::UdpSocket::bind(("127.0.0.1", port)).is_ok());
    }
}
