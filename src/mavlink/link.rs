//! MAVLink Vehicle Link
//!
//! [`Link`] implementation for ArduPilot flight controllers. Authority maps to
//! GUIDED mode, arming to `MAV_CMD_COMPONENT_ARM_DISARM`; both are confirmed by
//! the vehicle's heartbeat before the state machine advances.

use std::sync::Arc;

use async_trait::async_trait;
use mavlink::ardupilotmega::{MavCmd, MavMessage, MavResult};
use skylink_shared::{
    Link, LinkDispatcher, LinkError, LinkSource, LinkState, LinkStatus, Message, Operation,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::commands::{ArduPilotMode, MavCommandSender};
use super::connection::{FcConfig, Session, VehicleStatus};
use super::telemetry;

/// Outcome of waiting for the vehicle to act on a command
#[derive(Debug, Clone, PartialEq)]
enum Confirmation {
    Confirmed,
    Rejected(MavResult),
    TimedOut,
    TransportLost,
}

/// An open session and the task watching it for loss
struct Active {
    session: Session,
    monitor: JoinHandle<()>,
}

impl Active {
    async fn close(self) {
        self.monitor.abort();
        self.session.close().await;
    }
}

/// Link to a flight controller over serial, UDP or TCP
pub struct MavlinkLink {
    name: String,
    config: FcConfig,
    commands: MavCommandSender,
    status: Arc<LinkStatus>,
    source: LinkSource,
    dispatcher: Arc<LinkDispatcher>,
    vehicle: Arc<watch::Sender<VehicleStatus>>,
    session: Mutex<Option<Active>>,
}

impl MavlinkLink {
    pub fn new(name: impl Into<String>, config: FcConfig) -> Self {
        Self::with_dispatcher(name, config, Arc::new(LinkDispatcher::new()))
    }

    /// Use an existing dispatcher, e.g. one shared with other links
    pub fn with_dispatcher(name: impl Into<String>, config: FcConfig, dispatcher: Arc<LinkDispatcher>) -> Self {
        let name = name.into();
        let status = Arc::new(LinkStatus::new());
        let source = status.source(name.as_str());
        let commands = MavCommandSender::new(config.target_system, config.target_component);
        let (vehicle, _) = watch::channel(VehicleStatus::default());

        Self {
            name,
            config,
            commands,
            status,
            source,
            dispatcher,
            vehicle: Arc::new(vehicle),
            session: Mutex::new(None),
        }
    }

    /// Latest vehicle status seen by the reader
    #[cfg(test)]
    pub fn vehicle_status(&self) -> VehicleStatus {
        self.vehicle.borrow().clone()
    }

    async fn send(&self, msg: MavMessage) -> Result<(), LinkError> {
        let active = self.session.lock().await;
        match active.as_ref() {
            Some(active) => active.session.send(msg).await,
            None => Err(LinkError::Transport(format!("{} is not connected", self.name))),
        }
    }

    /// Check the state, send one message, apply the transition
    async fn simple_command(&self, operation: Operation, msg: MavMessage) -> Result<(), LinkError> {
        self.status.check(operation).await?;
        self.send(msg).await?;
        self.status.complete(operation).await;
        Ok(())
    }

    /// Number of acks seen so far; acks up to here cannot answer a new request
    fn ack_mark(&self) -> u64 {
        self.vehicle.borrow().acks
    }

    async fn await_confirmation<F>(&self, command: MavCmd, after: u64, confirmed: F) -> Confirmation
    where
        F: Fn(&VehicleStatus) -> bool,
    {
        let mut rx = self.vehicle.subscribe();
        let waited = timeout(
            self.config.command_timeout,
            rx.wait_for(|s| s.transport_lost || s.rejection(command, after).is_some() || confirmed(s)),
        )
        .await;

        match waited {
            Err(_) => Confirmation::TimedOut,
            Ok(Err(_)) => Confirmation::TransportLost,
            Ok(Ok(s)) => {
                if s.transport_lost {
                    Confirmation::TransportLost
                } else if let Some(result) = s.rejection(command, after) {
                    Confirmation::Rejected(result)
                } else {
                    Confirmation::Confirmed
                }
            }
        }
    }

    /// Open the session with ingestion wired to this link
    async fn open_session(&self) -> Result<Session, LinkError> {
        let vehicle = self.vehicle.clone();
        let dispatcher = self.dispatcher.clone();
        let source = self.source.clone();
        let on_message = move |_header: mavlink::MavHeader, msg: MavMessage| {
            vehicle.send_if_modified(|status| status.apply(&msg));
            for message in telemetry::decode(&msg) {
                dispatcher.dispatch(&source, message.key(), &message);
            }
        };

        Session::open(&self.config, on_message).await
    }

    /// On session loss: fail pending confirmations, reset to Disconnected and
    /// emit `CONNECTION_CLOSED`
    fn watch_loss(&self, session: &Session) -> JoinHandle<()> {
        let mut lost = session.lost();
        let name = self.name.clone();
        let status = self.status.clone();
        let vehicle = self.vehicle.clone();
        let dispatcher = self.dispatcher.clone();
        let source = self.source.clone();

        tokio::spawn(async move {
            let reason = match lost.wait_for(|l| l.is_some()).await {
                Ok(reason) => reason.clone().unwrap_or_default(),
                // Session closed
                Err(_) => return,
            };

            vehicle.send_modify(|s| s.transport_lost = true);
            if status.disconnect().await {
                warn!(link = %name, %reason, "Connection to vehicle lost");
                dispatcher.dispatch(&source, Message::ConnectionClosed.key(), &Message::ConnectionClosed);
            }
        })
    }
}

#[async_trait]
impl Link for MavlinkLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn dispatcher(&self) -> &Arc<LinkDispatcher> {
        &self.dispatcher
    }

    fn state(&self) -> LinkState {
        self.status.current()
    }

    fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.status.subscribe()
    }

    async fn start(&self) -> Result<(), LinkError> {
        self.status.check(Operation::Start).await?;

        let mut slot = self.session.lock().await;
        if let Some(stale) = slot.take() {
            stale.close().await;
        }
        self.vehicle.send_replace(VehicleStatus::default());
        let session = self.open_session().await?;

        let mut lost = session.lost();
        let mut rx = self.vehicle.subscribe();
        let heard = tokio::select! {
            waited = timeout(self.config.connect_timeout, rx.wait_for(|s| s.heartbeats > 0)) => {
                matches!(waited, Ok(Ok(_)))
            }
            _ = lost.wait_for(|l| l.is_some()) => false,
        };

        if !heard {
            session.close().await;
            return Err(LinkError::Connection(format!(
                "no heartbeat from vehicle on {} within {:?}",
                self.config.connection.address(),
                self.config.connect_timeout
            )));
        }

        self.status.complete(Operation::Start).await;
        // A loss between the handshake and here is picked up right away
        let monitor = self.watch_loss(&session);
        *slot = Some(Active { session, monitor });
        info!(link = %self.name, "Vehicle link started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), LinkError> {
        if let Some(active) = self.session.lock().await.take() {
            active.close().await;
        }
        if !self.status.disconnect().await {
            return Ok(());
        }

        self.dispatcher
            .dispatch(&self.source, Message::ConnectionClosed.key(), &Message::ConnectionClosed);
        info!(link = %self.name, "Vehicle link stopped");
        Ok(())
    }

    async fn take_control(&self) -> Result<(), LinkError> {
        self.status.check(Operation::TakeControl).await?;

        let mark = self.ack_mark();
        self.send(self.commands.set_mode(ArduPilotMode::Guided)).await?;
        let guided = ArduPilotMode::Guided as u32;

        match self
            .await_confirmation(MavCmd::MAV_CMD_DO_SET_MODE, mark, |s| s.custom_mode == guided)
            .await
        {
            Confirmation::Confirmed => {
                self.status.complete(Operation::TakeControl).await;
                info!(link = %self.name, "Control acquired");
                Ok(())
            }
            Confirmation::Rejected(result) => {
                Err(LinkError::Authority(format!("vehicle refused GUIDED mode: {:?}", result)))
            }
            Confirmation::TimedOut => Err(LinkError::Authority(format!(
                "vehicle did not enter GUIDED mode within {:?}",
                self.config.command_timeout
            ))),
            Confirmation::TransportLost => Err(LinkError::Transport("connection lost".into())),
        }
    }

    async fn release_control(&self) -> Result<(), LinkError> {
        self.simple_command(Operation::ReleaseControl, self.commands.set_mode(ArduPilotMode::Loiter))
            .await?;
        info!(link = %self.name, "Control released");
        Ok(())
    }

    async fn arm(&self) -> Result<(), LinkError> {
        self.status.check(Operation::Arm).await?;

        let mark = self.ack_mark();
        self.send(self.commands.arm()).await?;

        match self
            .await_confirmation(MavCmd::MAV_CMD_COMPONENT_ARM_DISARM, mark, |s| s.armed)
            .await
        {
            Confirmation::Confirmed => {
                self.status.complete(Operation::Arm).await;
                info!(link = %self.name, "Vehicle armed");
                Ok(())
            }
            Confirmation::Rejected(result) => Err(LinkError::rejected(Operation::Arm, format!("{:?}", result))),
            Confirmation::TimedOut => Err(LinkError::rejected(
                Operation::Arm,
                format!("not armed within {:?}", self.config.command_timeout),
            )),
            Confirmation::TransportLost => Err(LinkError::Transport("connection lost".into())),
        }
    }

    async fn disarm(&self) -> Result<(), LinkError> {
        self.simple_command(Operation::Disarm, self.commands.disarm()).await?;
        info!(link = %self.name, "Vehicle disarmed");
        Ok(())
    }

    async fn cmd_attitude(&self, roll: f32, pitch: f32, yaw: f32, collective: f32) -> Result<(), LinkError> {
        self.simple_command(
            Operation::CmdAttitude,
            self.commands.attitude_target(roll, pitch, yaw, collective),
        )
        .await
    }

    async fn cmd_attitude_rate(
        &self,
        roll_rate: f32,
        pitch_rate: f32,
        yaw_rate: f32,
        collective: f32,
    ) -> Result<(), LinkError> {
        self.simple_command(
            Operation::CmdAttitudeRate,
            self.commands
                .attitude_rate_target(roll_rate, pitch_rate, yaw_rate, collective),
        )
        .await
    }

    async fn cmd_velocity(&self, vn: f32, ve: f32, vd: f32, heading: f32) -> Result<(), LinkError> {
        self.simple_command(Operation::CmdVelocity, self.commands.velocity_target(vn, ve, vd, heading))
            .await
    }

    async fn cmd_motors(&self, motor1: f32, motor2: f32, motor3: f32, motor4: f32) -> Result<(), LinkError> {
        self.simple_command(
            Operation::CmdMotors,
            self.commands.actuator_controls([motor1, motor2, motor3, motor4]),
        )
        .await
    }

    async fn cmd_position(&self, north: f32, east: f32, down: f32, heading: f32) -> Result<(), LinkError> {
        self.simple_command(
            Operation::CmdPosition,
            self.commands.position_target(north, east, down, heading),
        )
        .await
    }

    async fn takeoff(&self, north: f32, east: f32, down: f32) -> Result<(), LinkError> {
        debug!(link = %self.name, north, east, down, "Takeoff");
        self.simple_command(Operation::Takeoff, self.commands.takeoff_local(north, east, down))
            .await
    }

    async fn land(&self, north: f32, east: f32, down: f32) -> Result<(), LinkError> {
        debug!(link = %self.name, north, east, down, "Land");
        self.simple_command(Operation::Land, self.commands.land_local(north, east, down))
            .await
    }

    async fn set_home_position(&self, latitude: f64, longitude: f64, altitude: f32) -> Result<(), LinkError> {
        self.simple_command(
            Operation::SetHomePosition,
            self.commands.set_home(latitude, longitude, altitude),
        )
        .await
    }
}
