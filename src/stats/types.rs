use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{EmotionalState, StateDurations};

/// Point-in-time, internally consistent view of the aggregated statistics.
/// Derived on demand; never stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsSnapshot {
    pub total_count: u64,
    /// Touches started within the trailing 60 minutes of `last_update`.
    pub hour_count: u64,
    /// Touches started since local midnight.
    pub today_count: u64,
    pub avg_duration_ms: f64,
    pub state: EmotionalState,
    pub state_since: DateTime<Utc>,
    /// Seconds spent in each state today.
    pub state_durations: StateDurations,
    pub last_update: DateTime<Utc>,
}

/// Standard response envelope for the dashboard API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}
