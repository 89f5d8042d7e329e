//! SQLite persistence layer (via sqlx): samples, calibration versions, and
//! logged events, plus the backup/restore helpers carried over for SD-card
//! wear mitigation on low-power field hardware.
//!
//! Uses runtime-checked `sqlx::query`/`query_as` rather than the `query!`
//! macros — those need a `.sqlx` offline cache built by `cargo sqlx
//! prepare` against a live database, which this build never has a chance
//! to generate.

use crate::error::{AgriScanError, Result};
use crate::sample::{CalibrationVersion, Event, EventType, Sample};
use futures::{Stream, StreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::collections::BTreeSet;
use std::str::FromStr;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// Upper bound on rows returned by a single `/api/series` query, so an
/// unbounded range (`start=0&end=<now>`) on a years-old deployment still
/// answers in one page instead of streaming the entire table.
const MAX_SERIES_ROWS: i64 = 200;

/// Renders a serde-tagged C-like enum to its wire string (e.g. `Regime`,
/// `Status`) for storage in a `TEXT` column.
fn enum_to_db_string<T: serde::Serialize>(value: T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => String::new(),
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/agriscan/agriscan.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .map_err(|e| AgriScanError::Configuration(format!("invalid sqlite url {db_url}: {e}")))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AgriScanError::Fatal(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Inserts a batch of samples as one transaction — the unit the
    /// acquisition pipeline flushes on `batch_size` or shutdown.
    pub async fn insert_samples_batch(&self, samples: &[Sample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for s in samples {
            let flags_json = serde_json::to_string(&s.qc_flags).unwrap_or_else(|_| "[]".into());
            let regime = enum_to_db_string(s.regime);
            let status = enum_to_db_string(s.status);
            let urgency = enum_to_db_string(s.urgency);
            sqlx::query(
                r#"
                INSERT INTO samples (
                  timestamp, raw, temp_c, theta, theta_fc, theta_refill,
                  psi_kpa, aw_mm, fraction_depleted, drying_rate,
                  regime, status, urgency, confidence,
                  qc_valid, qc_flags, seq
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(s.timestamp)
            .bind(s.raw)
            .bind(s.temp_c)
            .bind(s.theta)
            .bind(s.theta_fc)
            .bind(s.theta_refill)
            .bind(s.psi_kpa)
            .bind(s.aw_mm)
            .bind(s.fraction_depleted)
            .bind(s.drying_rate)
            .bind(regime)
            .bind(status)
            .bind(urgency)
            .bind(s.confidence)
            .bind(s.qc_valid)
            .bind(flags_json)
            .bind(s.seq)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_calibration(&self, cal: &CalibrationVersion) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO calibration (timestamp, state, theta_fc, theta_refill, n_events, confidence, params_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(cal.timestamp)
        .bind(&cal.state)
        .bind(cal.theta_fc)
        .bind(cal.theta_refill)
        .bind(cal.n_events)
        .bind(cal.confidence)
        .bind(&cal.params_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_event(
        &self,
        ts_start: i64,
        ts_end: i64,
        event_type: EventType,
        delta_theta: f64,
        metadata: &str,
    ) -> Result<()> {
        let event_type = enum_to_db_string(event_type);
        sqlx::query(
            r#"
            INSERT INTO events (ts_start, ts_end, event_type, delta_theta, metadata)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts_start)
        .bind(ts_end)
        .bind(event_type)
        .bind(delta_theta)
        .bind(metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_sample(&self) -> Result<Option<Sample>> {
        let row = sqlx::query("SELECT * FROM samples ORDER BY timestamp DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| row_to_sample(&r)))
    }

    pub async fn recent_samples(&self, limit: i64) -> Result<Vec<Sample>> {
        let rows = sqlx::query("SELECT * FROM samples ORDER BY timestamp DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_sample).collect())
    }

    /// Streamed/chunked query over a (possibly large) time range, wrapped
    /// for direct use as an `axum::body::Body::from_stream` source.
    /// sqlx's `.fetch()` already yields a `Stream` row-by-row — this maps
    /// rows into `Sample`s without buffering the whole range, and caps the
    /// result at `MAX_SERIES_ROWS` regardless of how wide `[from_ts, to_ts]`
    /// is; callers paginate by re-querying from the last returned timestamp.
    pub fn samples_in_range(
        &self,
        from_ts: i64,
        to_ts: i64,
    ) -> impl Stream<Item = Result<Sample>> + '_ {
        sqlx::query(
            "SELECT * FROM samples WHERE timestamp >= ? AND timestamp <= ? ORDER BY timestamp ASC LIMIT ?",
        )
        .bind(from_ts)
        .bind(to_ts)
        .bind(MAX_SERIES_ROWS)
        .fetch(&self.pool)
        .map(|row| row.map(|r| row_to_sample(&r)).map_err(AgriScanError::from))
    }

    pub async fn latest_calibration(&self) -> Result<Option<CalibrationVersion>> {
        let row = sqlx::query(
            "SELECT version, timestamp, state, theta_fc, theta_refill, n_events, confidence, params_json FROM calibration ORDER BY version DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| CalibrationVersion {
            version: r.get("version"),
            timestamp: r.get("timestamp"),
            state: r.get("state"),
            theta_fc: r.get("theta_fc"),
            theta_refill: r.get("theta_refill"),
            n_events: r.get("n_events"),
            confidence: r.get("confidence"),
            params_json: r.get("params_json"),
        }))
    }

    pub async fn recent_events(&self, limit: i64) -> Result<Vec<Event>> {
        let rows = sqlx::query(
            "SELECT id, ts_start, ts_end, event_type, delta_theta, metadata FROM events ORDER BY ts_start DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| {
                let event_type_str: String = r.get("event_type");
                let event_type: EventType =
                    serde_json::from_value(serde_json::Value::String(event_type_str))
                        .unwrap_or(EventType::Wetting);
                Event {
                    id: r.get("id"),
                    ts_start: r.get("ts_start"),
                    ts_end: r.get("ts_end"),
                    event_type,
                    delta_theta: r.get("delta_theta"),
                    metadata: r.get("metadata"),
                }
            })
            .collect())
    }

    /// Deletes samples older than `cutoff_ts` — a maintenance hook, not
    /// called on any automatic schedule yet.
    pub async fn prune_before(&self, cutoff_ts: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM samples WHERE timestamp < ?")
            .bind(cutoff_ts)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Atomic, defragmented snapshot via `VACUUM INTO`, written to a temp
    /// file and renamed so a crash mid-write can't corrupt the previous
    /// good backup.
    pub async fn backup(&self, dest_path: &str) -> Result<()> {
        if let Some(parent) = std::path::Path::new(dest_path).parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = format!("{dest_path}.tmp");
        let _ = tokio::fs::remove_file(&tmp_path).await;

        let escaped = tmp_path.replace('\'', "''");
        sqlx::query(&format!("VACUUM INTO '{escaped}'"))
            .execute(&self.pool)
            .await?;

        tokio::fs::rename(&tmp_path, dest_path).await?;
        Ok(())
    }
}

fn row_to_sample(r: &sqlx::sqlite::SqliteRow) -> Sample {
    let flags_json: String = r.get("qc_flags");
    let qc_flags: BTreeSet<crate::sample::QcFlag> =
        serde_json::from_str(&flags_json).unwrap_or_default();
    let regime_str: String = r.get("regime");
    let status_str: String = r.get("status");
    let urgency_str: String = r.get("urgency");

    Sample {
        timestamp: r.get("timestamp"),
        raw: r.get("raw"),
        temp_c: r.get("temp_c"),
        theta: r.get("theta"),
        theta_fc: r.get("theta_fc"),
        theta_refill: r.get("theta_refill"),
        psi_kpa: r.get("psi_kpa"),
        aw_mm: r.get("aw_mm"),
        fraction_depleted: r.get("fraction_depleted"),
        drying_rate: r.get("drying_rate"),
        regime: serde_json::from_value(serde_json::Value::String(regime_str))
            .unwrap_or(crate::sample::Regime::Unknown),
        status: serde_json::from_value(serde_json::Value::String(status_str))
            .unwrap_or(crate::sample::Status::Unknown),
        urgency: serde_json::from_value(serde_json::Value::String(urgency_str))
            .unwrap_or(crate::sample::Urgency::None),
        confidence: r.get("confidence"),
        qc_valid: r.get("qc_valid"),
        qc_flags,
        seq: r.get("seq"),
    }
}

// ---------------------------------------------------------------------------
// Backup / restore helpers (SD card wear mitigation)
// ---------------------------------------------------------------------------

/// Extract the filesystem path from a SQLite connection URL. `None` for
/// in-memory databases or non-sqlite URLs.
pub fn db_file_path(db_url: &str) -> Option<String> {
    let stripped = db_url.strip_prefix("sqlite:")?;
    if stripped.starts_with(":memory:") || stripped.is_empty() {
        return None;
    }
    let path = stripped.split('?').next().unwrap_or(stripped);
    if path.is_empty() {
        return None;
    }
    Some(path.to_string())
}

/// Restore a backup to the working path if the working DB is missing or
/// empty. Call before [`Db::connect`] when using a RAM-backed working
/// directory. Returns `true` if a restore was performed.
pub fn restore_from_backup(working_path: &str, backup_path: &str) -> Result<bool> {
    let backup = std::path::Path::new(backup_path);
    if !backup.exists() {
        tracing::info!(backup_path, "no backup file found — starting fresh");
        return Ok(false);
    }

    let working = std::path::Path::new(working_path);
    let needs_restore =
        !working.exists() || working.metadata().map(|m| m.len() == 0).unwrap_or(true);

    if needs_restore {
        if let Some(parent) = working.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(backup, working)?;
        tracing::info!(backup_path, working_path, "database restored from backup");
        Ok(true)
    } else {
        tracing::debug!(working_path, "working database exists — skipping restore");
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Regime, Status, Urgency};
    use futures::pin_mut;

    fn sample_at(ts: i64, theta: f64) -> Sample {
        Sample {
            timestamp: ts,
            raw: 500,
            temp_c: 20.0,
            theta,
            theta_fc: 0.3,
            theta_refill: Some(0.18),
            psi_kpa: 10.0,
            aw_mm: 20.0,
            fraction_depleted: 0.3,
            drying_rate: Some(-0.001),
            regime: Regime::Stable,
            status: Status::Optimal,
            urgency: Urgency::None,
            confidence: 0.5,
            qc_valid: true,
            qc_flags: BTreeSet::new(),
            seq: ts,
        }
    }

    #[tokio::test]
    async fn insert_and_read_back_sample() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.insert_samples_batch(&[sample_at(1000, 0.25)]).await.unwrap();

        let latest = db.latest_sample().await.unwrap().unwrap();
        assert_eq!(latest.timestamp, 1000);
        assert!((latest.theta - 0.25).abs() < 1e-9);
        assert_eq!(latest.status, Status::Optimal);
    }

    #[tokio::test]
    async fn batch_insert_is_atomic() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let batch: Vec<Sample> = (0..6).map(|i| sample_at(i * 900, 0.2 + i as f64 * 0.01)).collect();
        db.insert_samples_batch(&batch).await.unwrap();
        let recent = db.recent_samples(10).await.unwrap();
        assert_eq!(recent.len(), 6);
    }

    #[tokio::test]
    async fn streamed_range_query_yields_ordered_rows() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let batch: Vec<Sample> = (0..5).map(|i| sample_at(i * 900, 0.2)).collect();
        db.insert_samples_batch(&batch).await.unwrap();

        let stream = db.samples_in_range(0, 4 * 900);
        pin_mut!(stream);
        let mut timestamps = Vec::new();
        while let Some(row) = stream.next().await {
            timestamps.push(row.unwrap().timestamp);
        }
        assert_eq!(timestamps, vec![0, 900, 1800, 2700, 3600]);
    }

    #[tokio::test]
    async fn streamed_range_query_caps_at_max_series_rows() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let batch: Vec<Sample> = (0..(MAX_SERIES_ROWS + 50)).map(|i| sample_at(i, 0.2)).collect();
        db.insert_samples_batch(&batch).await.unwrap();

        let stream = db.samples_in_range(0, i64::MAX);
        pin_mut!(stream);
        let mut count = 0;
        while let Some(row) = stream.next().await {
            row.unwrap();
            count += 1;
        }
        assert_eq!(count, MAX_SERIES_ROWS as usize);
    }

    #[tokio::test]
    async fn calibration_round_trip() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let cal = CalibrationVersion {
            version: 1,
            timestamp: 1000,
            state: "NORMAL_OPERATION".to_string(),
            theta_fc: 0.30,
            theta_refill: Some(0.18),
            n_events: 3,
            confidence: 0.7,
            params_json: "{}".to_string(),
        };
        db.insert_calibration(&cal).await.unwrap();
        let latest = db.latest_calibration().await.unwrap().unwrap();
        assert_eq!(latest.state, "NORMAL_OPERATION");
        assert_eq!(latest.n_events, 3);
    }

    #[tokio::test]
    async fn event_round_trip() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.insert_event(0, 7200, EventType::Wetting, 0.05, "{}").await.unwrap();
        let events = db.recent_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Wetting);
    }

    #[tokio::test]
    async fn prune_before_removes_old_rows() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db.insert_samples_batch(&[sample_at(0, 0.2), sample_at(100_000, 0.25)])
            .await
            .unwrap();
        let deleted = db.prune_before(50_000).await.unwrap();
        assert_eq!(deleted, 1);
        let remaining = db.recent_samples(10).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn health_check_succeeds() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.health_check().await.unwrap();
    }

    #[test]
    fn file_path_absolute_with_query() {
        assert_eq!(
            db_file_path("sqlite:/home/pi/agriscan.db?mode=rwc"),
            Some("/home/pi/agriscan.db".to_string())
        );
    }

    #[test]
    fn file_path_memory_returns_none() {
        assert_eq!(db_file_path("sqlite::memory:"), None);
    }

    #[test]
    fn restore_no_backup_returns_false() {
        let result = restore_from_backup("/nonexistent/working.db", "/nonexistent/backup.db");
        assert!(!result.unwrap());
    }

    #[tokio::test]
    async fn backup_and_restore_round_trip() {
        let dir = std::env::temp_dir().join(format!("agriscan_backup_test_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let db_path = dir.join("test.db");
        let backup_path = dir.join("backup.db");
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let db = Db::connect(&db_url).await.unwrap();
        db.migrate().await.unwrap();
        db.insert_samples_batch(&[sample_at(0, 0.25)]).await.unwrap();

        let backup_str = backup_path.to_str().unwrap();
        db.backup(backup_str).await.unwrap();
        assert!(backup_path.exists());

        drop(db);
        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(format!("{}-wal", db_path.display()));
        let _ = std::fs::remove_file(format!("{}-shm", db_path.display()));

        let restored = restore_from_backup(db_path.to_str().unwrap(), backup_str).unwrap();
        assert!(restored);

        let db = Db::connect(&db_url).await.unwrap();
        let recent = db.recent_samples(10).await.unwrap();
        assert_eq!(recent.len(), 1);

        drop(db);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
