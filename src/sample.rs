//! The canonical record shared by every component: acquisition produces it,
//! the state machine and status engine decorate it, persistence stores it,
//! and the HTTP layer serializes it. One shape, one serializer, no
//! duck-typed records crossing module boundaries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QcFlag {
    OutOfBounds,
    Spike,
    Stuck,
    TempOutOfRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Wetting,
    Drainage,
    Drydown,
    Stable,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Full,
    Optimal,
    Monitor,
    Refill,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    None,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Wetting,
    Drainage,
    Drydown,
}

/// Immutable once stored. `theta_fc`/`theta_refill` are denormalised: the
/// value in effect at the moment of this sample, not the current one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: i64,
    pub raw: i64,
    pub temp_c: f64,
    pub theta: f64,
    pub theta_fc: f64,
    pub theta_refill: Option<f64>,
    pub psi_kpa: f64,
    pub aw_mm: f64,
    pub fraction_depleted: f64,
    pub drying_rate: Option<f64>,
    pub regime: Regime,
    pub status: Status,
    pub urgency: Urgency,
    pub confidence: f64,
    pub qc_valid: bool,
    pub qc_flags: BTreeSet<QcFlag>,
    pub seq: i64,
}

/// A versioned snapshot of the auto-calibration state, appended whenever
/// `theta_fc*`, `theta_refill*`, or the fitted dynamics parameters change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationVersion {
    pub version: i64,
    pub timestamp: i64,
    pub state: String,
    pub theta_fc: f64,
    pub theta_refill: Option<f64>,
    pub n_events: i64,
    pub confidence: f64,
    pub params_json: String,
}

/// Opaque fitted-parameter payload persisted as `calibration.params_json`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DrainageDrydownParams {
    pub k_d: Option<f64>,
    pub k_u: Option<f64>,
    pub beta: Option<f64>,
    pub theta_min: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub ts_start: i64,
    pub ts_end: i64,
    pub event_type: EventType,
    pub delta_theta: f64,
    pub metadata: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qc_flag_serializes_screaming_snake_case() {
        let v = serde_json::to_value(QcFlag::TempOutOfRange).unwrap();
        assert_eq!(v, "TEMP_OUT_OF_RANGE");
    }

    #[test]
    fn status_serializes_uppercase() {
        assert_eq!(serde_json::to_value(Status::Refill).unwrap(), "REFILL");
    }

    #[test]
    fn regime_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Regime::Drydown).unwrap(), "drydown");
    }
}
