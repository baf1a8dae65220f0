use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One recorded touch on one channel. Open while `ended_at` is `None`;
/// immutable once closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TouchEvent {
    pub id: Option<i64>,
    pub channel: u8,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}
