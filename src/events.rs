//! Wetting-event detection, drying-rate slope fits, FC-plateau detection,
//! and regime classification. All decisions use the trailing ring buffer
//! only — no persistence access.

use crate::config::Config;
use crate::ringbuffer::{self, RingBuffer};
use crate::sample::Regime;

const WETTING_WINDOW_S: i64 = 2 * 3_600;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WettingOutcome {
    Accepted { delta_theta: f64 },
    TooSoonAfterLastEvent,
    BelowThreshold,
}

/// Checks the trailing 2h window for a wetting event relative to
/// `last_event_ts` (the timestamp of the last *accepted* event, if any).
pub fn detect_wetting(
    ring: &RingBuffer,
    now_ts: i64,
    last_event_ts: Option<i64>,
    cfg: &Config,
) -> WettingOutcome {
    let window = ring.since_valid(now_ts - WETTING_WINDOW_S);
    let (Some(first), Some(last)) = (window.first(), window.last()) else {
        return WettingOutcome::BelowThreshold;
    };
    let delta_theta = last.theta - first.theta;

    // Simulation mode additionally accepts a smaller delta if the trailing
    // 5-sample trend clearly exceeds 0.03 — exists so commissioning/testing
    // converges quickly; it does not change the physics.
    let sim_trend_override = cfg.simulation_mode && {
        let last5: Vec<f64> = ring.last_n(5).iter().map(|s| s.theta).collect();
        last5.len() >= 2 && last5[last5.len() - 1] - last5[0] > 0.03
    };

    if delta_theta < cfg.wet_jump_thresh && !sim_trend_override {
        return WettingOutcome::BelowThreshold;
    }

    if let Some(last_ts) = last_event_ts {
        if now_ts - last_ts < cfg.min_event_separation_s {
            return WettingOutcome::TooSoonAfterLastEvent;
        }
    }

    WettingOutcome::Accepted { delta_theta }
}

/// OLS slope of theta vs elapsed hours over the trailing `window_s` window.
/// `None` with fewer than 3 points, per spec.
pub fn drying_rate(ring: &RingBuffer, now_ts: i64, window_s: i64) -> Option<f64> {
    let window = ring.since_valid(now_ts - window_s);
    if window.len() < 3 {
        return None;
    }
    let t0 = window[0].timestamp as f64;
    let points: Vec<(f64, f64)> = window
        .iter()
        .map(|s| ((s.timestamp as f64 - t0) / 3600.0, s.theta))
        .collect();
    ringbuffer::ols_slope(&points)
}

/// FC-plateau candidate: sustained `|drying_rate| < s_min` over a hold
/// window of `hold_hours` with at least 10 samples. Returns the plateau
/// median theta.
pub fn fc_plateau_candidate(ring: &RingBuffer, now_ts: i64, cfg: &Config) -> Option<f64> {
    let hold_s = (cfg.hold_hours * 3600.0) as i64;
    let hold = ring.since_valid(now_ts - hold_s);
    if hold.len() < 10 {
        return None;
    }
    let slope = drying_rate(ring, now_ts, hold_s)?;
    if slope.abs() >= cfg.s_min {
        return None;
    }
    let thetas: Vec<f64> = hold.iter().map(|s| s.theta).collect();
    Some(ringbuffer::median(&thetas))
}

/// Regime classification from the current theta and last slope.
pub fn classify_regime(slope: Option<f64>, theta: f64, theta_fc: f64, cfg: &Config) -> Regime {
    let Some(slope) = slope else {
        return Regime::Unknown;
    };
    if slope > 0.001 {
        Regime::Wetting
    } else if slope.abs() < cfg.s_min {
        Regime::Stable
    } else if theta > theta_fc {
        Regime::Drainage
    } else {
        Regime::Drydown
    }
}
