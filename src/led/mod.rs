use thiserror::Error;
use tokio::{
    sync::watch,
    time::{Duration, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{config::AppConfig, models::EmotionalState};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

#[derive(Debug, Error)]
pub enum LedError {
    #[error("LED device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Hardware seam for the LED strip: a single RGB triple pushed to the whole
/// strip. The real device sits behind SPI; tests record calls.
pub trait LedStrip: Send {
    fn set_color(&mut self, r: u8, g: u8, b: u8) -> Result<(), LedError>;

    fn clear(&mut self) -> Result<(), LedError> {
        self.set_color(0, 0, 0)
    }
}

/// No-hardware strip that just logs color changes.
pub struct SimulatedStrip;

impl LedStrip for SimulatedStrip {
    fn set_color(&mut self, r: u8, g: u8, b: u8) -> Result<(), LedError> {
        log_info!("led color set to ({r}, {g}, {b})");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct LedSettings {
    pub sad_color: [u8; 3],
    pub glad_color: [u8; 3],
    pub transition: Duration,
    pub refresh: Duration,
}

impl From<&AppConfig> for LedSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            sad_color: config.sad_color,
            glad_color: config.glad_color,
            transition: Duration::from_secs_f64(config.transition_secs.max(0.01)),
            refresh: Duration::from_secs_f64(1.0 / config.led_refresh_hz.max(1) as f64),
        }
    }
}

/// One in-flight color fade. `from` is wherever the strip actually was when
/// the fade was (re)targeted, so interrupting a fade never jumps.
#[derive(Debug, Clone, Copy)]
struct Ramp {
    from: [f64; 3],
    to: [f64; 3],
}

impl Ramp {
    /// Linear interpolation per channel; `t` clamped to [0, 1].
    fn color_at(&self, t: f64) -> [f64; 3] {
        let t = t.clamp(0.0, 1.0);
        [
            self.from[0] + (self.to[0] - self.from[0]) * t,
            self.from[1] + (self.to[1] - self.from[1]) * t,
            self.from[2] + (self.to[2] - self.from[2]) * t,
        ]
    }
}

fn as_float(color: [u8; 3]) -> [f64; 3] {
    [color[0] as f64, color[1] as f64, color[2] as f64]
}

fn quantize(color: [f64; 3]) -> (u8, u8, u8) {
    let q = |c: f64| c.round().clamp(0.0, 255.0) as u8;
    (q(color[0]), q(color[1]), q(color[2]))
}

/// Reactive LED task: follows the emotional state watch channel, fading the
/// strip to each state's color over the configured duration at a bounded
/// refresh rate. Driver failures are logged and retried on the next frame.
pub async fn run_led_mapper(
    mut strip: Box<dyn LedStrip>,
    mut state_rx: watch::Receiver<EmotionalState>,
    settings: LedSettings,
    cancel_token: CancellationToken,
) {
    let color_for = |state: EmotionalState| match state {
        EmotionalState::Sad => settings.sad_color,
        EmotionalState::Glad => settings.glad_color,
    };

    let mut current = as_float(color_for(*state_rx.borrow_and_update()));
    let (r, g, b) = quantize(current);
    if let Err(err) = strip.set_color(r, g, b) {
        log_error!("failed to set initial LED color: {err}");
    }

    let mut ticker = tokio::time::interval(settings.refresh);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut ramp: Option<(Ramp, Instant)> = None;

    loop {
        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    log_info!("state channel closed, LED mapper exiting");
                    break;
                }
                let target = as_float(color_for(*state_rx.borrow_and_update()));
                // Retarget from the currently displayed color, even if a
                // previous fade is still in flight.
                ramp = Some((Ramp { from: current, to: target }, Instant::now()));
            }
            _ = ticker.tick(), if ramp.is_some() => {
                let (active, started) = match ramp {
                    Some(pair) => pair,
                    None => continue,
                };
                let t = started.elapsed().as_secs_f64() / settings.transition.as_secs_f64();
                current = active.color_at(t);

                let (r, g, b) = quantize(current);
                if let Err(err) = strip.set_color(r, g, b) {
                    log_error!("LED write failed, retrying next frame: {err}");
                }

                if t >= 1.0 {
                    ramp = None;
                }
            }
            _ = cancel_token.cancelled() => {
                if let Err(err) = strip.clear() {
                    log_error!("failed to clear LED strip at shutdown: {err}");
                }
                log_info!("LED mapper shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct RecordingStrip {
        frames: Arc<Mutex<Vec<(u8, u8, u8)>>>,
    }

    impl LedStrip for RecordingStrip {
        fn set_color(&mut self, r: u8, g: u8, b: u8) -> Result<(), LedError> {
            self.frames.lock().unwrap().push((r, g, b));
            Ok(())
        }
    }

    fn settings() -> LedSettings {
        LedSettings {
            sad_color: [0, 0, 255],
            glad_color: [255, 215, 0],
            transition: Duration::from_millis(100),
            refresh: Duration::from_millis(20),
        }
    }

    #[test]
    fn ramp_hits_both_endpoints() {
        let ramp = Ramp {
            from: [0.0, 0.0, 255.0],
            to: [255.0, 215.0, 0.0],
        };
        assert_eq!(quantize(ramp.color_at(0.0)), (0, 0, 255));
        assert_eq!(quantize(ramp.color_at(1.0)), (255, 215, 0));
        assert_eq!(quantize(ramp.color_at(2.0)), (255, 215, 0));
    }

    #[test]
    fn midpoint_is_linear_per_channel() {
        let ramp = Ramp {
            from: [0.0, 0.0, 255.0],
            to: [255.0, 215.0, 0.0],
        };
        let mid = ramp.color_at(0.5);
        assert_eq!(quantize(mid), (128, 108, 128));
    }

    #[test]
    fn retarget_resumes_from_interpolated_color() {
        let outbound = Ramp {
            from: [0.0, 0.0, 255.0],
            to: [255.0, 215.0, 0.0],
        };
        let halfway = outbound.color_at(0.5);

        // Interrupted halfway and sent back: the new ramp starts exactly at
        // the displayed color, not at the original start.
        let inbound = Ramp {
            from: halfway,
            to: [0.0, 0.0, 255.0],
        };
        assert_eq!(inbound.color_at(0.0), halfway);
        assert_eq!(quantize(inbound.color_at(1.0)), (0, 0, 255));
    }

    #[tokio::test(start_paused = true)]
    async fn mapper_fades_to_the_new_state_color() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let strip = RecordingStrip {
            frames: frames.clone(),
        };
        let (tx, rx) = watch::channel(EmotionalState::Sad);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_led_mapper(
            Box::new(strip),
            rx,
            settings(),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(10)).await;
        tx.send(EmotionalState::Glad).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        cancel.cancel();
        task.await.unwrap();

        let recorded = frames.lock().unwrap().clone();
        assert_eq!(recorded.first(), Some(&(0, 0, 255)));
        // Shutdown clears the strip; the frame before that is the completed
        // fade target.
        assert_eq!(recorded.last(), Some(&(0, 0, 0)));
        assert_eq!(recorded[recorded.len() - 2], (255, 215, 0));

        // The fade is monotonic per channel: blue falls, red and green rise.
        let fade = &recorded[1..recorded.len() - 1];
        for pair in fade.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
            assert!(pair[1].1 >= pair[0].1);
            assert!(pair[1].2 <= pair[0].2);
        }
    }
}
