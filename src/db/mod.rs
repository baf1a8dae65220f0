use std::{
    convert::TryFrom,
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::oneshot;

mod migrations;

use crate::models::{EmotionalState, StateDurations, TouchEvent};
use migrations::run_migrations;

/// Consistency faults on the touch event log. These indicate a decoder/store
/// invariant violation upstream; callers log the fault and drop the event
/// rather than corrupting aggregates.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("channel {0} already has an open touch event")]
    DuplicateOpenEvent(u8),
    #[error("channel {0} has no open touch event")]
    NoOpenEvent(u8),
}

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("value {value} exceeds SQLite INTEGER range"))
}

fn to_u64(value: i64, field: &str) -> Result<u64> {
    u64::try_from(value).map_err(|_| anyhow!("{field} contains negative value {value}"))
}

fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field} '{value}'"))
}

fn channel_from_i64(value: i64) -> Result<u8> {
    u8::try_from(value).map_err(|_| anyhow!("channel {value} out of range"))
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<TouchEvent> {
    Ok(TouchEvent {
        id: Some(row.get::<_, i64>(0)?),
        channel: channel_from_i64(row.get::<_, i64>(1)?)?,
        started_at: parse_datetime(&row.get::<_, String>(2)?, "started_at")?,
        ended_at: row
            .get::<_, Option<String>>(3)?
            .map(|s| parse_datetime(&s, "ended_at"))
            .transpose()?,
        duration_ms: row
            .get::<_, Option<i64>>(4)?
            .map(|ms| to_u64(ms, "duration_ms"))
            .transpose()?,
    })
}

/// Handle to the statistics store. All operations run on a dedicated worker
/// thread that owns the SQLite connection, so writes are serialized and each
/// one is committed before the caller's future resolves.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("touch-companion-db".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(
                            Err(anyhow::Error::new(err).context("failed to open SQLite database")),
                        );
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "synchronous", "NORMAL") {
                    error!("Failed to set synchronous pragma: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        info!("Database initialized at {}", db_path.as_path().display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }

    /// Open a touch event for `channel`. Increments the durable all-time
    /// counter in the same transaction, so count and log cannot diverge.
    pub async fn record_touch_start(&self, channel: u8, at: DateTime<Utc>) -> Result<i64> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;

            let open: Option<i64> = tx
                .query_row(
                    "SELECT id FROM touch_events WHERE channel = ?1 AND ended_at IS NULL",
                    params![channel as i64],
                    |row| row.get(0),
                )
                .optional()?;
            if open.is_some() {
                return Err(StoreError::DuplicateOpenEvent(channel).into());
            }

            tx.execute(
                "INSERT INTO touch_events (channel, started_at) VALUES (?1, ?2)",
                params![channel as i64, at.to_rfc3339()],
            )
            .with_context(|| "failed to insert touch event")?;
            let id = tx.last_insert_rowid();

            tx.execute(
                "UPDATE counters SET value = value + 1 WHERE name = 'total_touches'",
                [],
            )
            .with_context(|| "failed to bump total_touches counter")?;

            tx.commit().context("failed to commit touch start")?;
            Ok(id)
        })
        .await
    }

    /// Close the open touch event for `channel`, computing its duration.
    pub async fn record_touch_end(&self, channel: u8, at: DateTime<Utc>) -> Result<TouchEvent> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;

            let open: Option<(i64, String)> = tx
                .query_row(
                    "SELECT id, started_at FROM touch_events
                     WHERE channel = ?1 AND ended_at IS NULL",
                    params![channel as i64],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let (id, started_at_raw) = match open {
                Some(pair) => pair,
                None => return Err(StoreError::NoOpenEvent(channel).into()),
            };

            let started_at = parse_datetime(&started_at_raw, "started_at")?;
            let duration_ms = (at - started_at).num_milliseconds().max(0) as u64;

            tx.execute(
                "UPDATE touch_events SET ended_at = ?1, duration_ms = ?2 WHERE id = ?3",
                params![at.to_rfc3339(), to_i64(duration_ms)?, id],
            )
            .with_context(|| "failed to close touch event")?;

            tx.commit().context("failed to commit touch end")?;

            Ok(TouchEvent {
                id: Some(id),
                channel,
                started_at,
                ended_at: Some(at),
                duration_ms: Some(duration_ms),
            })
        })
        .await
    }

    /// Close any events left open by a previous crash. Their durations stay
    /// NULL (unknown) so they never skew the average.
    pub async fn close_dangling_events(&self, at: DateTime<Utc>) -> Result<usize> {
        self.execute(move |conn| {
            let closed = conn
                .execute(
                    "UPDATE touch_events SET ended_at = ?1 WHERE ended_at IS NULL",
                    params![at.to_rfc3339()],
                )
                .with_context(|| "failed to close dangling touch events")?;
            Ok(closed)
        })
        .await
    }

    /// Count of all touches ever recorded, from the durable counter.
    /// Unaffected by retention purges.
    pub async fn total_touches(&self) -> Result<u64> {
        self.execute(|conn| {
            let value: i64 = conn.query_row(
                "SELECT value FROM counters WHERE name = 'total_touches'",
                [],
                |row| row.get(0),
            )?;
            to_u64(value, "total_touches")
        })
        .await
    }

    /// Number of retained events with `started_at >= since`.
    pub async fn count_started_since(&self, since: DateTime<Utc>) -> Result<u64> {
        self.execute(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM touch_events WHERE started_at >= ?1",
                params![since.to_rfc3339()],
                |row| row.get(0),
            )?;
            to_u64(count, "count")
        })
        .await
    }

    /// Mean duration in milliseconds over retained, closed events.
    pub async fn average_duration_ms(&self) -> Result<f64> {
        self.execute(|conn| {
            let avg: Option<f64> = conn.query_row(
                "SELECT AVG(duration_ms) FROM touch_events WHERE duration_ms IS NOT NULL",
                [],
                |row| row.get(0),
            )?;
            Ok(avg.unwrap_or(0.0))
        })
        .await
    }

    pub async fn recent_events(&self, limit: u32, offset: u32) -> Result<Vec<TouchEvent>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, channel, started_at, ended_at, duration_ms
                 FROM touch_events
                 ORDER BY started_at DESC, id DESC
                 LIMIT ?1 OFFSET ?2",
            )?;

            let mut rows = stmt.query(params![limit as i64, offset as i64])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }
            Ok(events)
        })
        .await
    }

    /// Delete events older than `before`. The all-time counter is untouched;
    /// only the detailed log shrinks.
    pub async fn purge_events_before(&self, before: DateTime<Utc>) -> Result<usize> {
        self.execute(move |conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM touch_events WHERE started_at < ?1",
                    params![before.to_rfc3339()],
                )
                .with_context(|| "failed to purge old touch events")?;
            Ok(deleted)
        })
        .await
    }

    pub async fn current_state(&self) -> Result<Option<(EmotionalState, DateTime<Utc>)>> {
        self.execute(|conn| {
            let state_raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM meta WHERE key = 'current_state'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            let since_raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM meta WHERE key = 'state_since'",
                    [],
                    |row| row.get(0),
                )
                .optional()?;

            match (state_raw, since_raw) {
                (Some(state), Some(since)) => {
                    let state = EmotionalState::from_str(&state)
                        .ok_or_else(|| anyhow!("unknown emotional state '{state}'"))?;
                    let since = parse_datetime(&since, "state_since")?;
                    Ok(Some((state, since)))
                }
                _ => Ok(None),
            }
        })
        .await
    }

    pub async fn set_current_state(
        &self,
        state: EmotionalState,
        since: DateTime<Utc>,
    ) -> Result<()> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO meta (key, value) VALUES ('current_state', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![state.as_str()],
            )?;
            tx.execute(
                "INSERT INTO meta (key, value) VALUES ('state_since', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![since.to_rfc3339()],
            )?;
            tx.commit().context("failed to persist current state")?;
            Ok(())
        })
        .await
    }

    /// Accumulate `secs` of time spent in `state` on `day`.
    pub async fn add_state_duration(
        &self,
        day: NaiveDate,
        state: EmotionalState,
        secs: u64,
    ) -> Result<()> {
        if secs == 0 {
            return Ok(());
        }
        self.execute(move |conn| {
            let column = match state {
                EmotionalState::Sad => "sad_secs",
                EmotionalState::Glad => "glad_secs",
            };
            let sql = format!(
                "INSERT INTO state_days (day, {column}) VALUES (?1, ?2)
                 ON CONFLICT(day) DO UPDATE SET {column} = {column} + excluded.{column}"
            );
            conn.execute(&sql, params![day.to_string(), to_i64(secs)?])
                .with_context(|| "failed to accumulate state duration")?;
            Ok(())
        })
        .await
    }

    pub async fn state_durations(&self, day: NaiveDate) -> Result<StateDurations> {
        self.execute(move |conn| {
            let row: Option<(i64, i64)> = conn
                .query_row(
                    "SELECT sad_secs, glad_secs FROM state_days WHERE day = ?1",
                    params![day.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match row {
                Some((sad, glad)) => Ok(StateDurations {
                    sad_secs: to_u64(sad, "sad_secs")?,
                    glad_secs: to_u64(glad, "glad_secs")?,
                }),
                None => Ok(StateDurations::default()),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn test_db() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("test.sqlite3")).unwrap();
        (dir, db)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn start_then_end_yields_exact_duration() {
        let (_dir, db) = test_db();

        db.record_touch_start(3, at(0)).await.unwrap();
        let event = db.record_touch_end(3, at(2)).await.unwrap();

        assert_eq!(event.channel, 3);
        assert_eq!(event.duration_ms, Some(2000));
        assert_eq!(event.ended_at.unwrap() - event.started_at, Duration::seconds(2));
    }

    #[tokio::test]
    async fn duplicate_open_event_is_rejected() {
        let (_dir, db) = test_db();

        db.record_touch_start(1, at(0)).await.unwrap();
        let err = db.record_touch_start(1, at(1)).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::DuplicateOpenEvent(1))
        );

        // Other channels are unaffected.
        db.record_touch_start(2, at(1)).await.unwrap();
    }

    #[tokio::test]
    async fn end_without_open_event_is_rejected() {
        let (_dir, db) = test_db();

        let err = db.record_touch_end(0, at(0)).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<StoreError>(),
            Some(&StoreError::NoOpenEvent(0))
        );
    }

    #[tokio::test]
    async fn purge_preserves_all_time_counter() {
        let (_dir, db) = test_db();

        for i in 0..5 {
            db.record_touch_start(0, at(i * 10)).await.unwrap();
            db.record_touch_end(0, at(i * 10 + 1)).await.unwrap();
        }
        assert_eq!(db.total_touches().await.unwrap(), 5);

        let deleted = db.purge_events_before(at(30)).await.unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(db.total_touches().await.unwrap(), 5);
        assert_eq!(db.count_started_since(at(0)).await.unwrap(), 2);

        let remaining = db.recent_events(10, 0).await.unwrap();
        assert!(remaining.iter().all(|e| e.started_at >= at(30)));
    }

    #[tokio::test]
    async fn count_window_tracks_started_at() {
        let (_dir, db) = test_db();

        for i in 0..4 {
            db.record_touch_start(0, at(i * 60)).await.unwrap();
            db.record_touch_end(0, at(i * 60 + 1)).await.unwrap();
        }

        assert_eq!(db.count_started_since(at(0)).await.unwrap(), 4);
        assert_eq!(db.count_started_since(at(61)).await.unwrap(), 2);
        assert_eq!(db.count_started_since(at(500)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn dangling_events_close_without_duration() {
        let (_dir, db) = test_db();

        db.record_touch_start(5, at(0)).await.unwrap();
        let closed = db.close_dangling_events(at(100)).await.unwrap();
        assert_eq!(closed, 1);

        // The recovered event has no duration, so the average ignores it.
        assert_eq!(db.average_duration_ms().await.unwrap(), 0.0);

        // And a fresh start on the same channel is legal again.
        db.record_touch_start(5, at(101)).await.unwrap();
    }

    #[tokio::test]
    async fn average_duration_over_closed_events() {
        let (_dir, db) = test_db();

        db.record_touch_start(0, at(0)).await.unwrap();
        db.record_touch_end(0, at(1)).await.unwrap(); // 1000 ms
        db.record_touch_start(1, at(10)).await.unwrap();
        db.record_touch_end(1, at(13)).await.unwrap(); // 3000 ms
        db.record_touch_start(2, at(20)).await.unwrap(); // still open

        let avg = db.average_duration_ms().await.unwrap();
        assert!((avg - 2000.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.sqlite3");

        {
            let db = Database::new(path.clone()).unwrap();
            db.set_current_state(EmotionalState::Glad, at(42)).await.unwrap();
        }

        let db = Database::new(path).unwrap();
        let (state, since) = db.current_state().await.unwrap().unwrap();
        assert_eq!(state, EmotionalState::Glad);
        assert_eq!(since, at(42));
    }

    #[tokio::test]
    async fn state_durations_accumulate_per_day() {
        let (_dir, db) = test_db();
        let day = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();

        db.add_state_duration(day, EmotionalState::Sad, 30).await.unwrap();
        db.add_state_duration(day, EmotionalState::Glad, 10).await.unwrap();
        db.add_state_duration(day, EmotionalState::Sad, 5).await.unwrap();

        let durations = db.state_durations(day).await.unwrap();
        assert_eq!(durations.sad_secs, 35);
        assert_eq!(durations.glad_secs, 10);

        let other = db
            .state_durations(NaiveDate::from_ymd_opt(2025, 6, 2).unwrap())
            .await
            .unwrap();
        assert_eq!(other, StateDurations::default());
    }
}
