// main.rs

mod actuation;
mod clock;
mod config;
mod flag;
mod registry;
mod ring_buffer;
mod sensors;
mod sim;
mod stage_control;
mod state;
mod store;
mod telemetry_task;
mod web;

use crate::actuation::{ActuationExecutor, actuation_task};
use crate::clock::{Clock, get_current_timestamp_ms};
use crate::config::{Config, config_path};
use crate::flag::Flag;
use crate::registry::Registry;
use crate::ring_buffer::RingBuffer;
use crate::sensors::{SensorDevice, SensorIngest, sensor_task};
use crate::sim::SimulatedStand;
use crate::stage_control::{StageControl, stage_task};
use crate::state::AppState;
use crate::telemetry_task::telemetry_task;
use anyhow::Context;
use axum::Router;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const LOG_BUFFER_LEN: usize = 1024;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "engine_control_backend=info,telemetry=info,tower_http=debug".into());

    // EC_LOG_JSON=1 switches to one JSON object per line
    if std::env::var("EC_LOG_JSON").is_ok_and(|v| v == "1" || v == "true") {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let path = config_path();
    let config = Config::load(&path).with_context(|| format!("loading {}", path.display()))?;
    tracing::info!(path = %path.display(), stages = ?config.stages.list, "config loaded");

    let clock: Arc<dyn Clock> = Arc::new(get_current_timestamp_ms);

    // --- Shared stores ---
    let registry = Arc::new(Registry::with_default_schema()?);
    let flag = Arc::new(Flag::with_default_schema()?);

    // --- Stand ---
    tracing::warn!("no stand hardware attached, running against the simulated stand");
    let stand = SimulatedStand::new(config.sim, clock.clone());
    let devices: Vec<Box<dyn SensorDevice>> = config
        .sensors
        .iter()
        .map(|c| Box::new(stand.sensor(c.sensor_type, c.location)) as Box<dyn SensorDevice>)
        .collect();

    let ingest = SensorIngest::new(registry.clone(), devices, &config.sensors);
    let executor =
        ActuationExecutor::new(registry.clone(), flag.clone(), clock.clone(), Box::new(stand));
    let control = StageControl::begin(
        registry.clone(),
        flag.clone(),
        clock.clone(),
        &config.stages,
    )?;

    // --- Channels ---
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let logs = Arc::new(Mutex::new(RingBuffer::new(LOG_BUFFER_LEN)));

    let state = Arc::new(AppState {
        registry: registry.clone(),
        flag,
        cmd_tx,
        logs: logs.clone(),
    });

    // --- Background tasks ---
    let periods = config.tasks;
    let _sensors = tokio::spawn(sensor_task(
        ingest,
        Duration::from_millis(periods.sensor_period_ms),
    ));
    let _actuation = tokio::spawn(actuation_task(
        executor,
        Duration::from_millis(periods.actuation_period_ms),
        cmd_rx,
    ));
    let _stages = tokio::spawn(stage_task(
        control,
        Duration::from_millis(periods.control_period_ms),
    ));
    let _telemetry = tokio::spawn(telemetry_task(
        registry,
        logs,
        Duration::from_millis(periods.telemetry_period_ms),
    ));

    // --- Webserver ---
    let app: Router = web::router(state);

    let listener = tokio::net::TcpListener::bind(&config.http.addr)
        .await
        .with_context(|| format!("binding {}", config.http.addr))?;
    tracing::info!(addr = %config.http.addr, "operator API listening");
    axum::serve(listener, app).await?;
    Ok(())
}
