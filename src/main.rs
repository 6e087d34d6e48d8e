// src/main.rs

use anyhow::Result;
use stms::{CoreEvent, Settings, TrafficSystem};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stms=info,ort=warn".into()),
        )
        .init();

    info!("Smart Traffic Management System starting");

    let settings = if std::path::Path::new("config.yaml").exists() {
        Settings::load("config.yaml")?
    } else {
        info!("no config.yaml found, using defaults");
        Settings::default()
    };

    let (system, handle) = match TrafficSystem::new(&settings) {
        Ok(pair) => pair,
        Err(e) => {
            error!("initialization failed: {e:#}");
            return Err(e);
        }
    };
    info!(
        "Violation storage: {}",
        system.violation_directory().display()
    );

    tokio::spawn(run_presenter(system.subscribe()));

    for (approach, uri) in settings.cameras.iter().enumerate() {
        if let Some(uri) = uri {
            handle.connect_camera(approach, uri.clone());
        }
    }
    if settings.simulation_mode {
        info!("simulation mode: not opening a serial port");
    } else {
        handle.initialize_arduino(settings.serial_port.clone());
    }
    handle.start_system();

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutting down");
            shutdown.stop_system();
            shutdown.shutdown();
        }
    });

    system.run().await
}

/// Minimal console presenter: renders the event stream a GUI would
/// otherwise consume. Log events are already mirrored to tracing by the
/// core, so only state changes are shown here.
async fn run_presenter(mut events: broadcast::Receiver<CoreEvent>) {
    loop {
        match events.recv().await {
            Ok(CoreEvent::TrafficLightChanged { approach, light }) => {
                info!("Road {} light: {light}", approach + 1);
            }
            Ok(CoreEvent::VehicleCountChanged { approach, count }) => {
                info!("Road {} vehicles: {count}", approach + 1);
            }
            Ok(CoreEvent::DensityChanged { approach, density }) => {
                info!("Road {} density: {density}", approach + 1);
            }
            Ok(CoreEvent::ViolationDetected(record)) => {
                warn!(
                    "[{}] Road {}: {}",
                    record.timestamp,
                    record.approach + 1,
                    record.reason
                );
            }
            Ok(CoreEvent::CameraStatusChanged { approach, connected }) => {
                info!(
                    "Road {} camera {}",
                    approach + 1,
                    if connected { "connected" } else { "disconnected" }
                );
            }
            Ok(CoreEvent::ArduinoStatusChanged { connected, port }) => {
                info!(
                    "Controller board {}{}",
                    if connected { "connected: " } else { "disconnected" },
                    port
                );
            }
            Ok(CoreEvent::EnergySavingStatusChanged { active }) => {
                info!(
                    "Energy saving {}",
                    if active { "active" } else { "inactive" }
                );
            }
            Ok(CoreEvent::FrameUpdated { .. }) | Ok(CoreEvent::LogMessage { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("presenter lagged, skipped {skipped} events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
