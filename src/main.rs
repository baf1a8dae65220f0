use std::path::PathBuf;

use anyhow::Result;
use log::{info, LevelFilter};

use touch_companion::{
    config::AppConfig,
    led::SimulatedStrip,
    sensor::SimulatedSensor,
};

#[tokio::main]
async fn main() -> Result<()> {
    let level = if AppConfig::debug_mode() {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();

    let settings_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("settings.json"));
    let config = AppConfig::load(&settings_path)?;
    info!("loaded settings from {}", settings_path.display());

    // The Pi build swaps these for the MPR121 sensor and SPI LED drivers.
    let sensor = Box::new(SimulatedSensor::idle());
    let strip = Box::new(SimulatedStrip);

    touch_companion::run(config, sensor, strip).await
}
