use chrono::Utc;
use tokio::time::{sleep, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    config::AppConfig,
    db::{Database, StoreError},
    state::StateController,
};

use super::decoder::{decode_transitions, Transition};
use super::TouchSensor;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

// Import the logging macros (exported at crate root)
use crate::{log_error, log_info, log_warn};

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub channels: u8,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub max_sensor_errors: u32,
    pub error_cooldown: Duration,
}

impl From<&AppConfig> for PollSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            channels: config.channels,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            debounce: Duration::from_millis(config.debounce_ms),
            max_sensor_errors: config.max_sensor_errors.max(1),
            error_cooldown: Duration::from_secs(config.sensor_error_cooldown_secs),
        }
    }
}

/// Per-channel bookkeeping across polls.
struct ChannelState {
    /// End time of the most recent touch, for debounce.
    last_end: Option<Instant>,
    /// Set when a start was suppressed (debounce) or failed to record, so
    /// the matching end is skipped too and the store stays balanced.
    suppressed: bool,
}

pub async fn poll_loop(
    mut sensor: Box<dyn TouchSensor>,
    db: Database,
    state: StateController,
    settings: PollSettings,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut prev_mask: u16 = 0;
    let mut error_count: u32 = 0;
    let mut channels: Vec<ChannelState> = (0..settings.channels)
        .map(|_| ChannelState {
            last_end: None,
            suppressed: false,
        })
        .collect();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let mask = match sensor.read_touch_mask() {
                    Ok(mask) => {
                        error_count = 0;
                        mask
                    }
                    Err(err) => {
                        error_count += 1;
                        log_error!("sensor read failed ({error_count} consecutive): {err}");

                        if error_count >= settings.max_sensor_errors {
                            log_warn!("reinitializing sensor after {error_count} consecutive read errors");
                            if let Err(reinit_err) = sensor.reinitialize() {
                                log_error!("sensor reinitialization failed: {reinit_err}");
                            }
                            error_count = 0;

                            tokio::select! {
                                _ = sleep(settings.error_cooldown) => {}
                                _ = cancel_token.cancelled() => break,
                            }
                        }
                        continue;
                    }
                };

                let events = decode_transitions(prev_mask, mask, settings.channels);
                prev_mask = mask;
                if events.is_empty() {
                    continue;
                }

                let now = Utc::now();
                let poll_instant = Instant::now();
                let mut touch_recorded = false;

                for event in events {
                    let slot = &mut channels[event.channel as usize];
                    match event.transition {
                        Transition::Start => {
                            let bounced = slot
                                .last_end
                                .map(|end| poll_instant.duration_since(end) < settings.debounce)
                                .unwrap_or(false);
                            if bounced {
                                log_info!("debounced touch on channel {}", event.channel);
                                slot.suppressed = true;
                                continue;
                            }

                            match db.record_touch_start(event.channel, now).await {
                                Ok(_) => {
                                    touch_recorded = true;
                                    log_info!("touch started on channel {}", event.channel);
                                }
                                Err(err) => {
                                    // Skip the matching end as well, whether this
                                    // was a consistency fault or a failed write.
                                    slot.suppressed = true;
                                    if err.downcast_ref::<StoreError>().is_some() {
                                        log_error!("dropping inconsistent touch start: {err}");
                                    } else {
                                        log_error!("touch on channel {} was not recorded: {err:#}", event.channel);
                                    }
                                }
                            }
                        }
                        Transition::End => {
                            slot.last_end = Some(poll_instant);
                            if slot.suppressed {
                                slot.suppressed = false;
                                continue;
                            }

                            match db.record_touch_end(event.channel, now).await {
                                Ok(closed) => {
                                    log_info!(
                                        "touch ended on channel {} after {}ms",
                                        event.channel,
                                        closed.duration_ms.unwrap_or(0)
                                    );
                                }
                                Err(err) => {
                                    if err.downcast_ref::<StoreError>().is_some() {
                                        log_error!("dropping inconsistent touch end: {err}");
                                    } else {
                                        log_error!("touch end on channel {} was not recorded: {err:#}", event.channel);
                                    }
                                }
                            }
                        }
                    }
                }

                if touch_recorded {
                    state.on_touch(now).await;
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("poll loop shutting down");
                break;
            }
        }
    }
}
