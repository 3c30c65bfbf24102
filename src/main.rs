mod mavlink;

use std::sync::Arc;

use anyhow::{Context, Result};
use skylink_shared::{Link, LinkState, Message};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::mavlink::{FcConfig, MavlinkLink, FC_ENV_VAR};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let config = FcConfig::from_env()?;
    info!(
        "SkyLink starting: {} (override with {})",
        config.connection.address(),
        FC_ENV_VAR
    );

    let link = Arc::new(MavlinkLink::new("fc", config));

    // Log every inbound message
    let _all = link.on_message("*", |source, key, message| {
        match message {
            Message::State(state) => info!(
                link = source.name(),
                armed = state.armed,
                guided = state.guided,
                mode = %state.mode,
                "{}",
                key
            ),
            Message::ConnectionClosed => warn!(link = source.name(), "{}", key),
            other => debug!(link = source.name(), "{}: {:?}", key, other),
        }
        Ok(())
    });

    let mut state_rx = link.subscribe_state();
    tokio::spawn(async move {
        while state_rx.changed().await.is_ok() {
            let state = *state_rx.borrow_and_update();
            info!("Link state: {}", state);
        }
    });

    link.start()
        .await
        .context("failed to connect to flight controller")?;

    let mut state_rx = link.subscribe_state();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
        }
        _ = state_rx.wait_for(|s| *s == LinkState::Disconnected) => {
            warn!("Flight controller connection lost");
        }
    }

    link.stop().await?;
    info!("SkyLink stopped");
    Ok(())
}
