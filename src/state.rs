//! In-memory diagnostics state backing `/api/diagnostics`: uptime, last
//! acquisition/write/backup timestamps, QC pass rate, the last raw
//! sensor readings, and a capped error ring buffer.

use crate::sample::QcFlag;
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

const MAX_ERRORS: usize = 200;
const ERROR_WINDOW_S: i64 = 86_400;

/// Confidence thresholds for the `calibration.status` diagnostics label.
const CONFIDENCE_LEARNING_MAX: f64 = 0.35;
const CONFIDENCE_CALIBRATING_MAX: f64 = 0.65;

pub type SharedState = Arc<RwLock<DiagnosticsState>>;

pub struct DiagnosticsState {
    started_at: Instant,
    pub last_reading_ts: Option<i64>,
    pub last_write_ts: Option<i64>,
    pub last_backup_ts: Option<i64>,
    pub qc_total: u64,
    pub qc_pass: u64,
    pub last_raw: Option<i64>,
    pub last_temp_c: Option<f64>,
    last_qc_flags: BTreeSet<QcFlag>,
    errors: VecDeque<ErrorEvent>,
    pub sensor_ok: bool,
    pub storage_ok: bool,
}

#[derive(Clone, Serialize)]
pub struct ErrorEvent {
    pub ts: i64,
    pub detail: String,
}

#[derive(Serialize)]
pub struct StorageDiagnostics {
    pub status: &'static str,
    pub free_gb: f64,
    pub last_write_seconds_ago: Option<i64>,
}

#[derive(Serialize)]
pub struct SensorDiagnostics {
    pub soil_status: &'static str,
    pub soil_last_raw: Option<i64>,
    pub temp_status: &'static str,
    pub temp_last_c: Option<f64>,
    pub failure_rate_percent: f64,
}

#[derive(Serialize)]
pub struct SystemDiagnostics {
    pub uptime_hours: f64,
    pub memory_free_kb: u64,
    pub last_reading_seconds_ago: Option<i64>,
}

#[derive(Serialize)]
pub struct CalibrationDiagnostics {
    pub status: &'static str,
    pub confidence: f64,
    pub events_captured: i64,
}

#[derive(Serialize)]
pub struct DiagnosticsResponse {
    pub storage: StorageDiagnostics,
    pub sensors: SensorDiagnostics,
    pub system: SystemDiagnostics,
    pub calibration: CalibrationDiagnostics,
    pub errors_24h: usize,
    pub recent_errors: Vec<ErrorEvent>,
    pub autocal_state: String,
}

impl DiagnosticsState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            last_reading_ts: None,
            last_write_ts: None,
            last_backup_ts: None,
            qc_total: 0,
            qc_pass: 0,
            last_raw: None,
            last_temp_c: None,
            last_qc_flags: BTreeSet::new(),
            errors: VecDeque::with_capacity(MAX_ERRORS),
            sensor_ok: true,
            storage_ok: true,
        }
    }

    pub fn record_reading(&mut self, ts: i64, raw: i64, temp_c: f64, qc_valid: bool, flags: BTreeSet<QcFlag>) {
        self.last_reading_ts = Some(ts);
        self.last_raw = Some(raw);
        self.last_temp_c = Some(temp_c);
        self.last_qc_flags = flags;
        self.qc_total += 1;
        if qc_valid {
            self.qc_pass += 1;
        }
    }

    pub fn record_write(&mut self, ts: i64) {
        self.last_write_ts = Some(ts);
    }

    pub fn record_backup(&mut self, ts: i64) {
        self.last_backup_ts = Some(ts);
    }

    pub fn record_error(&mut self, ts: i64, detail: String) {
        if self.errors.len() >= MAX_ERRORS {
            self.errors.pop_front();
        }
        self.errors.push_back(ErrorEvent { ts, detail });
    }

    pub fn errors_in_last_24h(&self, now_ts: i64) -> usize {
        self.errors
            .iter()
            .filter(|e| now_ts - e.ts <= ERROR_WINDOW_S)
            .count()
    }

    fn calibration_status_label(confidence: f64) -> &'static str {
        if confidence < CONFIDENCE_LEARNING_MAX {
            "Learning"
        } else if confidence < CONFIDENCE_CALIBRATING_MAX {
            "Calibrating"
        } else {
            "Calibrated"
        }
    }

    /// Builds the `/api/diagnostics` payload. `n_events`/`confidence`/
    /// `autocal_state` come from the auto-calibration context (read through
    /// a snapshot, not held here — calibration state is exclusively owned
    /// by `AutoCal`).
    pub fn to_response(
        &self,
        now_ts: i64,
        autocal_state: &str,
        confidence: f64,
        n_events: i64,
        disk_free_gb: f64,
        memory_free_kb: u64,
    ) -> DiagnosticsResponse {
        let failure_rate_percent = if self.qc_total > 0 {
            100.0 * (1.0 - self.qc_pass as f64 / self.qc_total as f64)
        } else {
            0.0
        };

        let soil_status = if self.last_qc_flags.contains(&QcFlag::OutOfBounds)
            || self.last_qc_flags.contains(&QcFlag::Spike)
            || self.last_qc_flags.contains(&QcFlag::Stuck)
        {
            "fault"
        } else {
            "ok"
        };
        let temp_status = if self.last_qc_flags.contains(&QcFlag::TempOutOfRange) {
            "fault"
        } else {
            "ok"
        };

        DiagnosticsResponse {
            storage: StorageDiagnostics {
                status: if self.storage_ok { "ok" } else { "fault" },
                free_gb: disk_free_gb,
                last_write_seconds_ago: self.last_write_ts.map(|ts| now_ts - ts),
            },
            sensors: SensorDiagnostics {
                soil_status,
                soil_last_raw: self.last_raw,
                temp_status,
                temp_last_c: self.last_temp_c,
                failure_rate_percent,
            },
            system: SystemDiagnostics {
                uptime_hours: self.started_at.elapsed().as_secs_f64() / 3600.0,
                memory_free_kb,
                last_reading_seconds_ago: self.last_reading_ts.map(|ts| now_ts - ts),
            },
            calibration: CalibrationDiagnostics {
                status: Self::calibration_status_label(confidence),
                confidence,
                events_captured: n_events,
            },
            errors_24h: self.errors_in_last_24h(now_ts),
            recent_errors: self.errors.iter().rev().take(20).cloned().collect(),
            autocal_state: autocal_state.to_string(),
        }
    }
}

impl Default for DiagnosticsState {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads free disk space (GB) for the filesystem backing `path`, and free
/// system memory (KB). Used only for diagnostics; never on the acquisition
/// hot path.
pub fn system_snapshot(db_path: &str) -> (f64, u64) {
    use sysinfo::{Disks, System};

    let mut sys = System::new();
    sys.refresh_memory();
    let memory_free_kb = sys.available_memory() / 1024;

    let disks = Disks::new_with_refreshed_list();
    let target = std::path::Path::new(db_path)
        .canonicalize()
        .unwrap_or_else(|_| std::path::PathBuf::from(db_path));
    let free_gb = disks
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space() as f64 / 1e9)
        .unwrap_or(0.0);

    (free_gb, memory_free_kb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_reading_tracks_qc_counters_and_last_values() {
        let mut st = DiagnosticsState::new();
        st.record_reading(100, 600, 21.0, true, BTreeSet::new());
        st.record_reading(200, 610, 21.5, false, BTreeSet::from([QcFlag::Spike]));
        assert_eq!(st.qc_total, 2);
        assert_eq!(st.qc_pass, 1);
        assert_eq!(st.last_reading_ts, Some(200));
        assert_eq!(st.last_raw, Some(610));
        assert_eq!(st.last_temp_c, Some(21.5));
    }

    #[test]
    fn errors_in_last_24h_excludes_stale_entries() {
        let mut st = DiagnosticsState::new();
        st.record_error(0, "old".to_string());
        st.record_error(90_000, "recent".to_string());
        assert_eq!(st.errors_in_last_24h(90_000), 1);
    }

    #[test]
    fn error_ring_buffer_caps_at_max() {
        let mut st = DiagnosticsState::new();
        for i in 0..(MAX_ERRORS + 20) {
            st.record_error(i as i64, format!("err {i}"));
        }
        assert_eq!(st.errors.len(), MAX_ERRORS);
    }

    #[test]
    fn to_response_computes_failure_rate_and_calibration_label() {
        let mut st = DiagnosticsState::new();
        st.record_reading(0, 600, 20.0, true, BTreeSet::new());
        st.record_reading(1, 600, 20.0, true, BTreeSet::new());
        st.record_reading(2, 600, 20.0, false, BTreeSet::from([QcFlag::OutOfBounds]));
        let resp = st.to_response(2, "NORMAL_OPERATION", 0.8, 5, 10.0, 1024);
        assert!((resp.sensors.failure_rate_percent - 100.0 / 3.0).abs() < 1e-9);
        assert_eq!(resp.calibration.status, "Calibrated");
        assert_eq!(resp.calibration.events_captured, 5);
        assert_eq!(resp.sensors.soil_status, "fault");
    }

    #[test]
    fn calibration_status_labels_follow_confidence_thresholds() {
        assert_eq!(DiagnosticsState::calibration_status_label(0.1), "Learning");
        assert_eq!(DiagnosticsState::calibration_status_label(0.5), "Calibrating");
        assert_eq!(DiagnosticsState::calibration_status_label(0.9), "Calibrated");
    }

    #[test]
    fn to_response_zero_qc_total_has_zero_failure_rate() {
        let st = DiagnosticsState::new();
        let resp = st.to_response(0, "INIT", 0.0, 0, 0.0, 0);
        assert_eq!(resp.sensors.failure_rate_percent, 0.0);
        assert_eq!(resp.calibration.status, "Learning");
    }
}
