//! Raw ADC -> volumetric water content, site/temperature corrections, and
//! quality control flags computed against the trailing ring buffer.

use crate::config::Config;
use crate::ringbuffer::{self, RingBuffer};
use crate::sample::QcFlag;
use std::collections::BTreeSet;

/// Factory raw->theta breakpoints for a capacitive soil-moisture probe.
pub const FACTORY_CURVE: [(f64, f64); 5] = [
    (250.0, 0.00),
    (450.0, 0.10),
    (650.0, 0.25),
    (850.0, 0.40),
    (1000.0, 0.50),
];

/// Piecewise-linear interpolation over `FACTORY_CURVE`, clamped outside the
/// endpoints.
pub fn raw_to_theta(raw: i64) -> f64 {
    let raw = raw as f64;
    let curve = FACTORY_CURVE;
    if raw <= curve[0].0 {
        return curve[0].1;
    }
    if raw >= curve[curve.len() - 1].0 {
        return curve[curve.len() - 1].1;
    }
    for w in curve.windows(2) {
        let (x0, y0) = w[0];
        let (x1, y1) = w[1];
        if raw >= x0 && raw <= x1 {
            let frac = (raw - x0) / (x1 - x0);
            return y0 + frac * (y1 - y0);
        }
    }
    unreachable!("raw within curve bounds must hit a segment")
}

/// Site correction `theta' = gain*theta + offset`, then temperature
/// correction `theta'' = theta' + a*(T - T_ref)`. Returns the *unclamped*
/// value — callers clamp to `[min, max]` for the stored sample, but must
/// run [`compute_qc_flags`] against this value first: the factory curve
/// already clamps to its own endpoints, so `OUT_OF_BOUNDS` can only ever
/// fire on what gain/offset/temperature correction push outside bounds,
/// which a final clamp would silently hide.
pub fn apply_corrections(theta: f64, temp_c: f64, cfg: &Config) -> f64 {
    let corrected = cfg.gain * theta + cfg.offset;
    corrected + cfg.a_temp * (temp_c - cfg.t_ref)
}

/// Quality control flags against the trailing history. `theta`/`temp_c` are
/// the candidate sample's *pre-clamp* corrected values; `ring` is the
/// buffer *before* this sample is pushed.
pub fn compute_qc_flags(theta: f64, temp_c: f64, ring: &RingBuffer, cfg: &Config) -> BTreeSet<QcFlag> {
    let mut flags = BTreeSet::new();

    if theta < cfg.theta_min_bound || theta > cfg.theta_max_bound {
        flags.insert(QcFlag::OutOfBounds);
    }
    if !(-10.0..=60.0).contains(&temp_c) {
        flags.insert(QcFlag::TempOutOfRange);
    }

    let last5: Vec<f64> = ring.last_n(5).iter().map(|s| s.theta).collect();
    if !last5.is_empty() {
        let m = ringbuffer::mean(&last5);
        let sd = ringbuffer::std_dev(&last5);
        let z = (theta - m).abs() / (sd + 1e-9);
        if z > cfg.spike_z_thresh {
            flags.insert(QcFlag::Spike);
        }
    }

    // STUCK: the last 10 *stored* samples plus this candidate show no
    // movement at all over a sustained window.
    let last10: Vec<f64> = ring.last_n(10).iter().map(|s| s.theta).collect();
    if last10.len() >= 9 {
        let mut window = last10.clone();
        window.push(theta);
        if ringbuffer::range(&window) < cfg.stuck_eps {
            flags.insert(QcFlag::Stuck);
        }
    }

    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ringbuffer::RingBuffer;
    use crate::sample::{Regime, Status, Urgency};

    fn sample_with_theta(ts: i64, theta: f64) -> crate::sample::Sample {
        crate::sample::Sample {
            timestamp: ts,
            raw: 0,
            temp_c: 20.0,
            theta,
            theta_fc: 0.3,
            theta_refill: None,
            psi_kpa: 10.0,
            aw_mm: 0.0,
            fraction_depleted: 0.0,
            drying_rate: None,
            regime: Regime::Unknown,
            status: Status::Unknown,
            urgency: Urgency::None,
            confidence: 0.0,
            qc_valid: true,
            qc_flags: BTreeSet::new(),
            seq: ts,
        }
    }

    #[test]
    fn raw_to_theta_at_breakpoints() {
        assert!((raw_to_theta(250) - 0.00).abs() < 1e-9);
        assert!((raw_to_theta(650) - 0.25).abs() < 1e-9);
        assert!((raw_to_theta(1000) - 0.50).abs() < 1e-9);
    }

    #[test]
    fn raw_to_theta_midpoint_interpolates() {
        // Midway between (450,0.10) and (650,0.25).
        let v = raw_to_theta(550);
        assert!((v - 0.175).abs() < 1e-9);
    }

    #[test]
    fn raw_to_theta_clamps_outside_endpoints() {
        assert_eq!(raw_to_theta(0), 0.0);
        assert_eq!(raw_to_theta(5000), 0.50);
    }

    #[test]
    fn corrections_identity_with_default_gain_offset() {
        let cfg = Config::default();
        let theta = apply_corrections(0.25, 20.0, &cfg);
        assert!((theta - 0.25).abs() < 1e-9);
    }

    #[test]
    fn corrections_apply_gain_and_offset() {
        let mut cfg = Config::default();
        cfg.gain = 1.1;
        cfg.offset = 0.02;
        let theta = apply_corrections(0.20, 20.0, &cfg);
        assert!((theta - (1.1 * 0.20 + 0.02)).abs() < 1e-9);
    }

    #[test]
    fn corrections_are_not_clamped_so_qc_can_see_out_of_bounds() {
        let mut cfg = Config::default();
        cfg.offset = 10.0;
        let theta = apply_corrections(0.25, 20.0, &cfg);
        assert!(theta > cfg.theta_max_bound);
    }

    #[test]
    fn qc_flags_out_of_bounds_on_unclamped_corrected_theta() {
        let mut cfg = Config::default();
        cfg.offset = 10.0;
        let ring = RingBuffer::new(100);
        let corrected = apply_corrections(0.25, 20.0, &cfg);
        let flags = compute_qc_flags(corrected, 20.0, &ring, &cfg);
        assert!(flags.contains(&QcFlag::OutOfBounds));
    }

    #[test]
    fn qc_flags_temp_out_of_range() {
        let ring = RingBuffer::new(100);
        let cfg = Config::default();
        let flags = compute_qc_flags(0.25, 65.0, &ring, &cfg);
        assert!(flags.contains(&QcFlag::TempOutOfRange));
    }

    #[test]
    fn qc_flags_spike_detected_against_stable_history() {
        let mut ring = RingBuffer::new(100);
        let cfg = Config::default();
        for i in 0..5 {
            ring.push(sample_with_theta(i, 0.25));
        }
        let flags = compute_qc_flags(0.01, 20.0, &ring, &cfg);
        assert!(flags.contains(&QcFlag::Spike) || flags.contains(&QcFlag::OutOfBounds));
    }

    #[test]
    fn qc_flags_stuck_after_sustained_flat_series() {
        let mut ring = RingBuffer::new(100);
        let cfg = Config::default();
        for i in 0..10 {
            ring.push(sample_with_theta(i, 0.20));
        }
        let flags = compute_qc_flags(0.20, 20.0, &ring, &cfg);
        assert!(flags.contains(&QcFlag::Stuck));
    }

    #[test]
    fn qc_flags_empty_for_plausible_reading_with_no_history() {
        let ring = RingBuffer::new(100);
        let cfg = Config::default();
        let flags = compute_qc_flags(0.25, 20.0, &ring, &cfg);
        assert!(flags.is_empty());
    }
}
