use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::{error, info};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time,
};

use crate::{
    config::AppConfig,
    db::Database,
    hub::Hub,
    models::EmotionalState,
    stats::{self, StatisticsSnapshot},
};

struct Engine {
    state: EmotionalState,
    since: DateTime<Utc>,
    /// Last instant up to which time-in-state was flushed to the per-day
    /// duration counters.
    last_flush: DateTime<Utc>,
}

/// Owns the emotional state singleton. Transitions are decided here and
/// nowhere else: the poll task reports touches, the tick task drives decay,
/// and everyone else observes through snapshots or the LED watch channel.
///
/// Hysteresis policy: one threshold in both directions, applied to the count
/// of touches inside the rolling window. Flapping resistance comes from old
/// touches aging out of the window, not from a second, lower threshold.
#[derive(Clone)]
pub struct StateController {
    inner: Arc<Mutex<Engine>>,
    db: Database,
    hub: Hub,
    led_tx: watch::Sender<EmotionalState>,
    ticker: Arc<Mutex<Option<JoinHandle<()>>>>,
    glad_threshold: u32,
    rate_window: Duration,
    tick_interval: std::time::Duration,
}

impl StateController {
    /// Build the controller, restoring the persisted state so a restart does
    /// not artificially reset GLAD to SAD. Returns the watch receiver the
    /// LED mapper listens on.
    pub async fn new(
        db: Database,
        hub: Hub,
        config: &AppConfig,
        now: DateTime<Utc>,
    ) -> Result<(Self, watch::Receiver<EmotionalState>)> {
        let (state, since) = match db.current_state().await? {
            Some(restored) => restored,
            None => {
                db.set_current_state(EmotionalState::Sad, now).await?;
                (EmotionalState::Sad, now)
            }
        };
        info!("Emotional state restored: {} since {since}", state.as_str());

        let (led_tx, led_rx) = watch::channel(state);

        Ok((
            Self {
                inner: Arc::new(Mutex::new(Engine {
                    state,
                    since,
                    last_flush: now,
                })),
                db,
                hub,
                led_tx,
                ticker: Arc::new(Mutex::new(None)),
                glad_threshold: config.glad_threshold,
                rate_window: Duration::seconds(config.rate_window_secs as i64),
                tick_interval: std::time::Duration::from_secs(config.tick_interval_secs),
            },
            led_rx,
        ))
    }

    pub async fn current(&self) -> (EmotionalState, DateTime<Utc>) {
        let engine = self.inner.lock().await;
        (engine.state, engine.since)
    }

    /// Called by the poll task after a touch has been durably recorded.
    pub async fn on_touch(&self, now: DateTime<Utc>) {
        if let Err(err) = self.evaluate(now).await {
            error!("State evaluation after touch failed: {err:#}");
        }
    }

    /// Re-evaluate the transition rule against `now`, flush time-in-state
    /// into the per-day counters, and broadcast a fresh snapshot.
    ///
    /// A decided transition is authoritative immediately: persistence or
    /// broadcast failures are logged but never roll it back.
    pub async fn evaluate(&self, now: DateTime<Utc>) -> Result<()> {
        // The engine lock is held from decision through publish. A
        // touch-driven evaluation and a tick run concurrently; interleaving
        // them could hand subscribers two opposite transitions out of order.
        let mut engine = self.inner.lock().await;

        let window_count = self.db.count_started_since(now - self.rate_window).await?;
        let desired = if window_count >= self.glad_threshold as u64 {
            EmotionalState::Glad
        } else {
            EmotionalState::Sad
        };

        let elapsed = (now - engine.last_flush).num_seconds().max(0) as u64;
        if elapsed > 0 {
            if let Err(err) = self
                .db
                .add_state_duration(stats::local_day(now), engine.state, elapsed)
                .await
            {
                error!("Failed to flush state duration: {err:#}");
            } else {
                engine.last_flush = now;
            }
        }

        if desired != engine.state {
            info!(
                "Emotional state changed from {} to {} ({window_count} touches in window, threshold {})",
                engine.state.as_str(),
                desired.as_str(),
                self.glad_threshold
            );
            engine.state = desired;
            engine.since = now;

            if let Err(err) = self.db.set_current_state(desired, now).await {
                error!("Failed to persist state change: {err:#}");
            }
            let _ = self.led_tx.send(desired);
        }

        let snapshot = stats::collect_snapshot(&self.db, engine.state, engine.since, now).await?;
        self.hub.publish(snapshot);
        Ok(())
    }

    /// Assemble a snapshot without mutating anything. Used by the plain HTTP
    /// endpoint.
    pub async fn snapshot(&self, now: DateTime<Utc>) -> Result<StatisticsSnapshot> {
        let (state, since) = self.current().await;
        stats::collect_snapshot(&self.db, state, since, now).await
    }

    /// Spawn the periodic tick task so the state can decay even when nobody
    /// touches the sensor, and dashboards keep receiving fresh snapshots.
    /// The interval's immediate first tick doubles as the startup broadcast,
    /// so sessions connecting right away get a snapshot without waiting a
    /// full tick interval.
    pub async fn spawn_ticker(&self) {
        let mut ticker_guard = self.ticker.lock().await;
        if let Some(handle) = ticker_guard.take() {
            handle.abort();
        }

        let controller = self.clone();
        let tick_interval = self.tick_interval;

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(tick_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if let Err(err) = controller.evaluate(Utc::now()).await {
                    error!("Periodic state evaluation failed: {err:#}");
                }
            }
        });

        *ticker_guard = Some(handle);
    }

    /// Stop the ticker and flush the remaining time-in-state. Called once at
    /// shutdown after the poll task is gone.
    pub async fn shutdown(&self, now: DateTime<Utc>) {
        if let Some(handle) = self.ticker.lock().await.take() {
            handle.abort();
        }

        let mut engine = self.inner.lock().await;
        let elapsed = (now - engine.last_flush).num_seconds().max(0) as u64;
        if elapsed > 0 {
            if let Err(err) = self
                .db
                .add_state_duration(stats::local_day(now), engine.state, elapsed)
                .await
            {
                error!("Failed to flush state duration at shutdown: {err:#}");
            } else {
                engine.last_flush = now;
            }
        }
    }
}
