//! Vehicle link contract
//!
//! Every concrete link (MAVLink over serial/UDP/TCP, the in-process loopback,
//! ...) implements [`Link`] in full. Operations are guarded by the
//! [`LinkStateMachine`] and fail fast outside their required state.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};

use crate::dispatcher::{Dispatcher, Handler};
use crate::error::LinkError;
use crate::messages::{IntoMessageKeys, Message, MessageKey};
use crate::state_machine::{LinkState, LinkStateMachine, Operation};

/// Dispatcher type shared by all links
pub type LinkDispatcher = Dispatcher<LinkSource, Message>;

/// Handler type shared by all links
pub type LinkHandler = Handler<LinkSource, Message>;

/// Identifies the link a message came from; passed to every handler
#[derive(Debug, Clone)]
pub struct LinkSource {
    name: Arc<str>,
    state_rx: watch::Receiver<LinkState>,
}

impl LinkSource {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Link state at the time of the call
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }
}

/// State of one link: the state machine plus a watch channel publishing it
#[derive(Debug)]
pub struct LinkStatus {
    fsm: RwLock<LinkStateMachine>,
    state_tx: watch::Sender<LinkState>,
}

impl LinkStatus {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(LinkState::Disconnected);
        Self {
            fsm: RwLock::new(LinkStateMachine::new()),
            state_tx,
        }
    }

    pub fn current(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Build the source descriptor handed to handlers
    pub fn source(&self, name: impl Into<Arc<str>>) -> LinkSource {
        LinkSource {
            name: name.into(),
            state_rx: self.subscribe(),
        }
    }

    /// Fail fast if `operation` is not valid right now
    pub async fn check(&self, operation: Operation) -> Result<(), LinkError> {
        self.fsm.read().await.check(operation)
    }

    /// Apply the transition of a completed `operation`
    pub async fn complete(&self, operation: Operation) -> LinkState {
        let state = self.fsm.write().await.complete(operation);
        self.state_tx.send_replace(state);
        state
    }

    /// Back to Disconnected; `false` if the link already was
    ///
    /// Check and reset happen under one lock, so when `stop` and a transport
    /// loss race exactly one of them sees `true`.
    pub async fn disconnect(&self) -> bool {
        let mut fsm = self.fsm.write().await;
        if fsm.state() == LinkState::Disconnected {
            return false;
        }
        let state = fsm.reset();
        self.state_tx.send_replace(state);
        true
    }
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Capability set every vehicle link implements
///
/// Lifecycle: `start` → `take_control` → `arm` → motion commands → `disarm`
/// → `release_control` → `stop`. `stop` is accepted in any state.
#[async_trait]
pub trait Link: Send + Sync {
    /// Human-readable name for this link
    fn name(&self) -> &str;

    /// Dispatcher fed by this link's inbound messages
    fn dispatcher(&self) -> &Arc<LinkDispatcher>;

    fn state(&self) -> LinkState;

    /// Receive every state change of this link
    fn subscribe_state(&self) -> watch::Receiver<LinkState>;

    /// Register `callback` under `keys` on this link's dispatcher
    fn on_message<F>(&self, keys: impl IntoMessageKeys, callback: F) -> LinkHandler
    where
        Self: Sized,
        F: Fn(&LinkSource, &MessageKey, &Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher().on_message(keys, callback)
    }

    /// Establish the transport and begin ingestion
    async fn start(&self) -> Result<(), LinkError>;

    /// Tear down the transport; idempotent
    async fn stop(&self) -> Result<(), LinkError>;

    /// Request command authority from the vehicle
    async fn take_control(&self) -> Result<(), LinkError>;

    async fn release_control(&self) -> Result<(), LinkError>;

    async fn arm(&self) -> Result<(), LinkError>;

    async fn disarm(&self) -> Result<(), LinkError>;

    /// Attitude setpoint in radians, collective thrust normalized to [0, 1]
    async fn cmd_attitude(&self, roll: f32, pitch: f32, yaw: f32, collective: f32) -> Result<(), LinkError>;

    /// Body rate setpoint in rad/s, collective thrust normalized to [0, 1]
    async fn cmd_attitude_rate(
        &self,
        roll_rate: f32,
        pitch_rate: f32,
        yaw_rate: f32,
        collective: f32,
    ) -> Result<(), LinkError>;

    /// Local NED velocity setpoint in m/s with heading in radians
    async fn cmd_velocity(&self, vn: f32, ve: f32, vd: f32, heading: f32) -> Result<(), LinkError>;

    /// Raw motor commands normalized to [0, 1]
    async fn cmd_motors(&self, motor1: f32, motor2: f32, motor3: f32, motor4: f32) -> Result<(), LinkError>;

    /// Local NED position setpoint in metres with heading in radians
    async fn cmd_position(&self, north: f32, east: f32, down: f32, heading: f32) -> Result<(), LinkError>;

    /// Take off from the given current local position
    ///
    /// The link has no position knowledge of its own, so the caller supplies it.
    async fn takeoff(&self, north: f32, east: f32, down: f32) -> Result<(), LinkError>;

    /// Land at the given local position
    async fn land(&self, north: f32, east: f32, down: f32) -> Result<(), LinkError>;

    /// Set the home reference (degrees, metres)
    async fn set_home_position(&self, latitude: f64, longitude: f64, altitude: f32) -> Result<(), LinkError>;
}
