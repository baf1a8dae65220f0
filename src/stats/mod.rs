mod types;

pub use types::{ApiResponse, StatisticsSnapshot};

use anyhow::Result;
use chrono::{DateTime, Duration, Local, LocalResult, NaiveDate, TimeZone, Utc};

use crate::db::Database;
use crate::models::EmotionalState;

/// Calendar day (device-local) that `now` falls on. Used as the key for
/// per-day state duration totals.
pub fn local_day(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}

/// UTC instant of local midnight for the day `now` falls on.
pub fn day_start_utc(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&Local);
    let midnight = match local.date_naive().and_hms_opt(0, 0, 0) {
        Some(naive) => naive,
        None => return now,
    };
    match Local.from_local_datetime(&midnight) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
        // DST gap at midnight; the day effectively starts at local "now".
        LocalResult::None => now,
    }
}

/// Assemble a full snapshot against `now`. Counts are recomputed from the
/// event log on every call so the rolling hour window actually rolls; only
/// the all-time total comes from the durable counter.
pub async fn collect_snapshot(
    db: &Database,
    state: EmotionalState,
    state_since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<StatisticsSnapshot> {
    let hour_count = db.count_started_since(now - Duration::hours(1)).await?;
    let today_count = db.count_started_since(day_start_utc(now)).await?;
    let total_count = db.total_touches().await?;
    let avg_duration_ms = db.average_duration_ms().await?;
    let state_durations = db.state_durations(local_day(now)).await?;

    Ok(StatisticsSnapshot {
        total_count,
        hour_count,
        today_count,
        avg_duration_ms,
        state,
        state_since,
        state_durations,
        last_update: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    async fn seeded_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("stats.sqlite3")).unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn snapshot_is_idempotent_for_a_fixed_now() {
        let (_dir, db) = seeded_db().await;
        for i in 0..3 {
            db.record_touch_start(0, at(i * 5)).await.unwrap();
            db.record_touch_end(0, at(i * 5 + 1)).await.unwrap();
        }

        let now = at(100);
        let first = collect_snapshot(&db, EmotionalState::Sad, at(0), now)
            .await
            .unwrap();
        let second = collect_snapshot(&db, EmotionalState::Sad, at(0), now)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.total_count, 3);
        assert_eq!(first.hour_count, 3);
    }

    #[tokio::test]
    async fn hour_count_rolls_with_now() {
        let (_dir, db) = seeded_db().await;
        db.record_touch_start(0, at(0)).await.unwrap();
        db.record_touch_end(0, at(1)).await.unwrap();

        let fresh = collect_snapshot(&db, EmotionalState::Sad, at(0), at(60))
            .await
            .unwrap();
        assert_eq!(fresh.hour_count, 1);

        // Same data, later "now": the touch has aged out of the hour window
        // but stays in the all-time total.
        let aged = collect_snapshot(&db, EmotionalState::Sad, at(0), at(4000))
            .await
            .unwrap();
        assert_eq!(aged.hour_count, 0);
        assert_eq!(aged.total_count, 1);
    }

    #[test]
    fn day_start_is_at_or_before_now() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let start = day_start_utc(now);
        assert!(start <= now);
        assert!(now - start < Duration::hours(25));
    }
}
