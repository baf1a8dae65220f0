mod decoder;
mod poller;

pub use decoder::{decode_transitions, TouchTransition, Transition};

use anyhow::{bail, Context, Result};
use log::info;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{config::AppConfig, db::Database, state::StateController};

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("touch sensor unavailable: {0}")]
    Unavailable(String),
}

/// Hardware seam for the capacitive touch sensor. The real device is an
/// MPR121 behind I2C; tests and non-Pi hosts plug in simulated readers.
pub trait TouchSensor: Send {
    /// Read the current touch bitmask, one bit per channel, set while the
    /// channel is touched.
    fn read_touch_mask(&mut self) -> Result<u16, SensorError>;

    /// Re-establish contact with the hardware after repeated read failures.
    fn reinitialize(&mut self) -> Result<(), SensorError> {
        Ok(())
    }
}

/// Scripted sensor used when no hardware is attached: replays a fixed mask
/// sequence, then reads as untouched forever.
pub struct SimulatedSensor {
    script: Vec<u16>,
    position: usize,
}

impl SimulatedSensor {
    pub fn new(script: Vec<u16>) -> Self {
        Self {
            script,
            position: 0,
        }
    }

    pub fn idle() -> Self {
        Self::new(Vec::new())
    }
}

impl TouchSensor for SimulatedSensor {
    fn read_touch_mask(&mut self) -> Result<u16, SensorError> {
        let mask = self.script.get(self.position).copied().unwrap_or(0);
        if self.position < self.script.len() {
            self.position += 1;
        }
        Ok(mask)
    }
}

/// Owns the polling task's lifecycle. Stopping cancels only the poll loop;
/// the tick task and client sessions are unaffected.
pub struct PollController {
    handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl PollController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
        }
    }

    pub fn start_polling(
        &mut self,
        sensor: Box<dyn TouchSensor>,
        db: Database,
        state: StateController,
        config: &AppConfig,
        parent_token: &CancellationToken,
    ) -> Result<()> {
        if self.handle.is_some() {
            bail!("polling already active");
        }

        let cancel_token = parent_token.child_token();
        let token_clone = cancel_token.clone();

        let handle = tokio::spawn(poller::poll_loop(
            sensor,
            db,
            state,
            poller::PollSettings::from(config),
            token_clone,
        ));

        info!("Touch polling started");
        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub async fn stop_polling(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.handle.take() {
            handle
                .await
                .context("poll loop task failed to join")
                .map(|_| ())
        } else {
            Ok(())
        }
    }
}

impl Default for PollController {
    fn default() -> Self {
        Self::new()
    }
}
