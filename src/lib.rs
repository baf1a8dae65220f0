pub mod config;
pub mod db;
pub mod hub;
pub mod led;
pub mod models;
pub mod sensor;
pub mod state;
pub mod stats;
pub mod utils;
pub mod web;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    config::AppConfig,
    db::Database,
    hub::Hub,
    led::{run_led_mapper, LedSettings, LedStrip},
    sensor::{PollController, TouchSensor},
    state::StateController,
    web::WebState,
};

const PURGE_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Wire everything together and run until Ctrl-C: sensor poller, state
/// engine, LED mapper, retention purge, and the dashboard API.
pub async fn run(
    config: AppConfig,
    sensor: Box<dyn TouchSensor>,
    strip: Box<dyn LedStrip>,
) -> Result<()> {
    let db = Database::new(config.db_path.clone())?;

    let startup = Utc::now();
    // A power cut mid-touch leaves an open event behind. Close it without a
    // duration so it does not skew the averages.
    match db.close_dangling_events(startup).await {
        Ok(0) => {}
        Ok(closed) => warn!("closed {closed} touch events left open by an unclean shutdown"),
        Err(err) => error!("failed to close dangling touch events: {err}"),
    }

    let hub = Hub::new(config.subscriber_queue_len);
    let (controller, led_rx) =
        StateController::new(db.clone(), hub.clone(), &config, startup).await?;
    controller.spawn_ticker().await;

    let shutdown_token = CancellationToken::new();

    let led_task = tokio::spawn(run_led_mapper(
        strip,
        led_rx,
        LedSettings::from(&config),
        shutdown_token.child_token(),
    ));

    let mut poller = PollController::new();
    poller.start_polling(
        sensor,
        db.clone(),
        controller.clone(),
        &config,
        &shutdown_token,
    )?;

    let purge_task = if config.retention_days > 0 {
        Some(spawn_retention_purge(
            db.clone(),
            config.retention_days,
            shutdown_token.child_token(),
        ))
    } else {
        None
    };

    let web_state = WebState {
        db: db.clone(),
        controller: controller.clone(),
        hub,
        heartbeat: Duration::from_secs(config.heartbeat_secs.max(1)),
    };
    let app = web::router(web_state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind dashboard API to {addr}"))?;
    info!("dashboard API listening on {addr}");

    let server_token = shutdown_token.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = server_token.cancelled() => {}
            }
        })
        .await
        .context("dashboard API server failed")?;

    info!("shutting down");
    shutdown_token.cancel();

    if let Err(err) = poller.stop_polling().await {
        error!("failed to stop sensor polling cleanly: {err}");
    }
    controller.shutdown(Utc::now()).await;

    if let Err(err) = led_task.await {
        error!("LED mapper task failed to join: {err}");
    }
    if let Some(task) = purge_task {
        let _ = task.await;
    }

    // Dropping the database handle flushes and joins the worker thread.
    drop(db);
    Ok(())
}

/// Deletes touch events older than the retention window. Runs once at
/// startup and then daily. The durable all-time counter is unaffected.
fn spawn_retention_purge(
    db: Database,
    retention_days: u32,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
                    match db.purge_events_before(cutoff).await {
                        Ok(0) => {}
                        Ok(removed) => {
                            info!("retention purge removed {removed} touch events");
                        }
                        Err(err) => error!("retention purge failed: {err}"),
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
    })
}
