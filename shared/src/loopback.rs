//! Loopback Link
//!
//! In-process simulated vehicle implementing [`Link`]. Every outbound command
//! is recorded instead of being sent, and tests can inject inbound messages as
//! if they had been decoded from a real transport.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::LinkError;
use crate::link::{Link, LinkDispatcher, LinkSource, LinkStatus};
use crate::messages::{GlobalFrameMessage, Message, StateMessage};
use crate::now_ms;
use crate::state_machine::{LinkState, Operation};

/// A command recorded by the loopback link
#[derive(Debug, Clone, PartialEq)]
pub enum SentCommand {
    TakeControl,
    ReleaseControl,
    Arm,
    Disarm,
    Attitude { roll: f32, pitch: f32, yaw: f32, collective: f32 },
    AttitudeRate { roll_rate: f32, pitch_rate: f32, yaw_rate: f32, collective: f32 },
    Velocity { vn: f32, ve: f32, vd: f32, heading: f32 },
    Motors([f32; 4]),
    Position { north: f32, east: f32, down: f32, heading: f32 },
    Takeoff { north: f32, east: f32, down: f32 },
    Land { north: f32, east: f32, down: f32 },
    SetHome { latitude: f64, longitude: f64, altitude: f32 },
}

/// How the simulated vehicle behaves
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// `start` succeeds
    pub reachable: bool,
    /// `take_control` is granted
    pub grant_authority: bool,
    /// `arm` is accepted
    pub accept_arm: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            reachable: true,
            grant_authority: true,
            accept_arm: true,
        }
    }
}

/// Simulated link for tests and demos
pub struct LoopbackLink {
    name: String,
    config: LoopbackConfig,
    status: LinkStatus,
    source: LinkSource,
    dispatcher: Arc<LinkDispatcher>,
    sent: Mutex<Vec<SentCommand>>,
}

impl LoopbackLink {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, LoopbackConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: LoopbackConfig) -> Self {
        Self::with_dispatcher(name, config, Arc::new(LinkDispatcher::new()))
    }

    /// Use an existing dispatcher, e.g. one with a custom reporter
    pub fn with_dispatcher(
        name: impl Into<String>,
        config: LoopbackConfig,
        dispatcher: Arc<LinkDispatcher>,
    ) -> Self {
        let name = name.into();
        let status = LinkStatus::new();
        let source = status.source(name.as_str());

        Self {
            name,
            config,
            status,
            source,
            dispatcher,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Feed an inbound message as if it came from the vehicle
    ///
    /// Returns `false` (and drops the message) while the link is stopped.
    pub fn inject(&self, message: Message) -> bool {
        if self.status.current() == LinkState::Disconnected {
            debug!(link = %self.name, "Dropping injected message, link stopped");
            return false;
        }
        self.deliver(&message);
        true
    }

    /// Every command sent so far, oldest first
    pub fn sent_commands(&self) -> Vec<SentCommand> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn deliver(&self, message: &Message) {
        self.dispatcher.dispatch(&self.source, message.key(), message);
    }

    fn record(&self, command: SentCommand) {
        debug!(link = %self.name, ?command, "Loopback command");
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command);
    }

    fn publish_state(&self, armed: bool, guided: bool) {
        self.deliver(&Message::State(StateMessage {
            time_ms: now_ms(),
            armed,
            guided,
            mode: if guided { "GUIDED".into() } else { "LOITER".into() },
        }));
    }

    /// Check the state, record the command, apply the transition
    async fn simple_command(&self, operation: Operation, command: SentCommand) -> Result<(), LinkError> {
        self.status.check(operation).await?;
        self.record(command);
        self.status.complete(operation).await;
        Ok(())
    }
}

#[async_trait]
impl Link for LoopbackLink {
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
        if !self.config.reachable {
            return Err(LinkError::Connection(format!("{} is unreachable", self.name)));
        }
        self.status.complete(Operation::Start).await;
        info!(link = %self.name, "Loopback link started");
        Ok(())
    }

    async fn stop(&self) -> Result<(), LinkError> {
        if !self.status.disconnect().await {
            return Ok(());
        }
        self.dispatcher.dispatch(&self.source, Message::ConnectionClosed.key(), &Message::ConnectionClosed);
        info!(link = %self.name, "Loopback link stopped");
        Ok(())
    }

    async fn take_control(&self) -> Result<(), LinkError> {
        self.status.check(Operation::TakeControl).await?;
        self.record(SentCommand::TakeControl);
        if !self.config.grant_authority {
            return Err(LinkError::Authority("vehicle denied control".into()));
        }
        self.status.complete(Operation::TakeControl).await;
        self.publish_state(false, true);
        Ok(())
    }

    async fn release_control(&self) -> Result<(), LinkError> {
        let was_armed = self.status.current() == LinkState::Armed;
        self.simple_command(Operation::ReleaseControl, SentCommand::ReleaseControl).await?;
        self.publish_state(was_armed, false);
        Ok(())
    }

    async fn arm(&self) -> Result<(), LinkError> {
        self.status.check(Operation::Arm).await?;
        self.record(SentCommand::Arm);
        if !self.config.accept_arm {
            return Err(LinkError::rejected(Operation::Arm, "failsafe active"));
        }
        self.status.complete(Operation::Arm).await;
        self.publish_state(true, true);
        Ok(())
    }

    async fn disarm(&self) -> Result<(), LinkError> {
        self.simple_command(Operation::Disarm, SentCommand::Disarm).await?;
        self.publish_state(false, true);
        Ok(())
    }

    async fn cmd_attitude(&self, roll: f32, pitch: f32, yaw: f32, collective: f32) -> Result<(), LinkError> {
        self.simple_command(
            Operation::CmdAttitude,
            SentCommand::Attitude { roll, pitch, yaw, collective },
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
            SentCommand::AttitudeRate { roll_rate, pitch_rate, yaw_rate, collective },
        )
        .await
    }

    async fn cmd_velocity(&self, vn: f32, ve: f32, vd: f32, heading: f32) -> Result<(), LinkError> {
        self.simple_command(Operation::CmdVelocity, SentCommand::Velocity { vn, ve, vd, heading })
            .await
    }

    async fn cmd_motors(&self, motor1: f32, motor2: f32, motor3: f32, motor4: f32) -> Result<(), LinkError> {
        self.simple_command(
            Operation::CmdMotors,
            SentCommand::Motors([motor1, motor2, motor3, motor4]),
        )
        .await
    }

    async fn cmd_position(&self, north: f32, east: f32, down: f32, heading: f32) -> Result<(), LinkError> {
        self.simple_command(
            Operation::CmdPosition,
            SentCommand::Position { north, east, down, heading },
        )
        .await
    }

    async fn takeoff(&self, north: f32, east: f32, down: f32) -> Result<(), LinkError> {
        self.simple_command(Operation::Takeoff, SentCommand::Takeoff { north, east, down })
            .await
    }

    async fn land(&self, north: f32, east: f32, down: f32) -> Result<(), LinkError> {
        self.simple_command(Operation::Land, SentCommand::Land { north, east, down })
            .await
    }

    async fn set_home_position(&self, latitude: f64, longitude: f64, altitude: f32) -> Result<(), LinkError> {
        self.simple_command(
            Operation::SetHomePosition,
            SentCommand::SetHome { latitude, longitude, altitude },
        )
        .await?;

        // The simulated vehicle echoes its new home back
        self.deliver(&Message::GlobalHome(GlobalFrameMessage {
            time_ms: now_ms(),
            latitude,
            longitude,
            altitude,
        }));
        Ok(())
    }
}
