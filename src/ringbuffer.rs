//! Bounded trailing window of recent samples kept in RAM. Supports the
//! slope fits, plateau detection, and percentile queries the event
//! detector and auto-calibration state machine need. Never touches disk —
//! older samples live only in the persistence layer.

use crate::sample::Sample;
use std::collections::VecDeque;

/// Default target: ~30 days at a 15-minute cadence.
pub const DEFAULT_CAPACITY: usize = 2880;

pub struct RingBuffer {
    buf: VecDeque<Sample>,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, sample: Sample) {
        if self.buf.len() >= self.capacity {
            self.buf.pop_front();
        }
        self.buf.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn latest(&self) -> Option<&Sample> {
        self.buf.back()
    }

    /// Most recent `n` samples, oldest first.
    pub fn last_n(&self, n: usize) -> Vec<&Sample> {
        let len = self.buf.len();
        let skip = len.saturating_sub(n);
        self.buf.iter().skip(skip).collect()
    }

    /// Samples with `timestamp >= since`, oldest first.
    pub fn since(&self, since: i64) -> Vec<&Sample> {
        self.buf.iter().filter(|s| s.timestamp >= since).collect()
    }

    /// QC-valid samples with `timestamp >= since`, oldest first.
    pub fn since_valid(&self, since: i64) -> Vec<&Sample> {
        self.buf
            .iter()
            .filter(|s| s.timestamp >= since && s.qc_valid)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.buf.iter()
    }
}

// ---------------------------------------------------------------------------
// Hand-rolled statistics — small enough not to warrant a stats crate.
// ---------------------------------------------------------------------------

/// OLS slope of `y` against `x`. Returns `None` for fewer than 2 points or a
/// degenerate (zero-variance) `x`.
pub fn ols_slope(points: &[(f64, f64)]) -> Option<f64> {
    let n = points.len() as f64;
    if points.len() < 2 {
        return None;
    }
    let mean_x = points.iter().map(|(x, _)| x).sum::<f64>() / n;
    let mean_y = points.iter().map(|(_, y)| y).sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (x, y) in points {
        let dx = x - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den.abs() < 1e-12 {
        return None;
    }
    Some(num / den)
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Linear-interpolated percentile (`p` in `[0, 100]`) over `values`.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (p / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] + frac * (sorted[hi] - sorted[lo])
    }
}

pub fn range(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let max = values.iter().cloned().fold(f64::MIN, f64::max);
    let min = values.iter().cloned().fold(f64::MAX, f64::min);
    max - min
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Regime, Status, Urgency};
    use std::collections::BTreeSet;

    fn sample_at(ts: i64, theta: f64) -> Sample {
        Sample {
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
    fn ring_buffer_evicts_oldest_past_capacity() {
        let mut rb = RingBuffer::new(3);
        for i in 0..5 {
            rb.push(sample_at(i, 0.1));
        }
        assert_eq!(rb.len(), 3);
        assert_eq!(rb.iter().next().unwrap().timestamp, 2);
    }

    #[test]
    fn ols_slope_perfect_line() {
        let pts: Vec<(f64, f64)> = (0..10).map(|i| (i as f64, 2.0 * i as f64 + 1.0)).collect();
        let slope = ols_slope(&pts).unwrap();
        assert!((slope - 2.0).abs() < 1e-9);
    }

    #[test]
    fn ols_slope_needs_two_points() {
        assert!(ols_slope(&[(1.0, 1.0)]).is_none());
    }

    #[test]
    fn median_even_and_odd() {
        assert_eq!(median(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
    }

    #[test]
    fn percentile_matches_min_max_at_bounds() {
        let v = vec![5.0, 1.0, 3.0, 2.0, 4.0];
        assert_eq!(percentile(&v, 0.0), 1.0);
        assert_eq!(percentile(&v, 100.0), 5.0);
    }

    #[test]
    fn std_dev_of_constant_series_is_zero() {
        assert_eq!(std_dev(&[0.2, 0.2, 0.2]), 0.0);
    }
}
