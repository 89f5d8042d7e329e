//! Stateful soil-moisture + temperature simulator for development and the
//! test scenarios. Models temporal coherence via random walk with mean
//! reversion, gradual drying drift, electronic noise, occasional spikes,
//! a diurnal cycle, and self-triggered wetting pulses so the
//! auto-calibration state machine has events to learn from without a
//! human in the loop.

use super::{RawReading, SensorBackend};
use crate::error::Result;

/// Approximate a sample from N(0,1) using the Irwin-Hall method: sum of 12
/// uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

pub struct SimBackend {
    raw_dry: f64,
    raw_wet: f64,
    base: f64,
    drift_per_sample: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    center: f64,
    spike_prob: f32,
    spike_sigma: f64,
    tick: u64,

    wetting_ticks_remaining: u32,
    wetting_rate: f64,
    wetting_pulse_prob: f32,

    temp_base: f64,
    temp_sigma: f64,
}

impl SimBackend {
    /// `raw_dry`/`raw_wet` are the factory-curve endpoints (low raw = dry,
    /// high raw = wet, matching `calibration::FACTORY_CURVE`).
    pub fn new(raw_dry: f64, raw_wet: f64) -> Self {
        let center = (raw_dry + raw_wet) / 2.0;
        Self {
            raw_dry,
            raw_wet,
            base: center,
            drift_per_sample: -1.5, // gentle drying: raw trends down
            walk_sigma: 2.0,
            mean_reversion: 0.01,
            center,
            spike_prob: 0.01,
            spike_sigma: 40.0,
            tick: 0,
            wetting_ticks_remaining: 0,
            wetting_rate: 12.0,
            wetting_pulse_prob: 0.0015,
            temp_base: 20.0,
            temp_sigma: 0.3,
        }
    }

    /// Manually trigger a wetting pulse lasting `ticks` samples. Exposed for
    /// scenario tests and interactive commissioning against the simulator;
    /// the acquisition task owns the live backend, so `/api/log_event` only
    /// records the event and cannot reach into it.
    pub fn trigger_wetting(&mut self, ticks: u32) {
        self.wetting_ticks_remaining = self.wetting_ticks_remaining.max(ticks);
    }

    fn sample_raw(&mut self) -> f64 {
        self.tick += 1;

        if self.wetting_ticks_remaining == 0 && fastrand::f32() < self.wetting_pulse_prob {
            self.wetting_ticks_remaining = 6;
        }

        let wet = if self.wetting_ticks_remaining > 0 {
            self.wetting_ticks_remaining -= 1;
            self.wetting_rate
        } else {
            0.0
        };

        let pull = self.mean_reversion * (self.center - self.base);
        let walk = gaussian(0.0, self.walk_sigma);
        let spike = if fastrand::f32() < self.spike_prob {
            gaussian(0.0, self.spike_sigma)
        } else {
            0.0
        };

        self.base = (self.base + self.drift_per_sample + pull + walk + wet + spike)
            .clamp(self.raw_wet - 50.0, self.raw_dry + 50.0);

        self.base.round()
    }

    fn sample_temp(&mut self) -> f64 {
        let phase = 2.0 * std::f64::consts::PI * (self.tick as f64 / 96.0);
        let diurnal = 3.0 * phase.sin();
        self.temp_base += gaussian(0.0, 0.05);
        self.temp_base = self.temp_base.clamp(10.0, 35.0);
        self.temp_base + diurnal + gaussian(0.0, self.temp_sigma)
    }
}

impl Default for SimBackend {
    /// Matches `calibration::FACTORY_CURVE`'s endpoints.
    fn default() -> Self {
        Self::new(1000.0, 250.0)
    }
}

impl SensorBackend for SimBackend {
    fn read(&mut self) -> Result<RawReading> {
        let raw = self.sample_raw() as i64;
        let temp_c = self.sample_temp();
        Ok(RawReading { raw, temp_c })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_stay_within_extended_range() {
        let mut sim = SimBackend::default();
        for _ in 0..500 {
            let r = sim.read().unwrap();
            assert!(r.raw >= 150 && r.raw <= 1100, "raw out of range: {}", r.raw);
        }
    }

    #[test]
    fn temporal_coherence_between_consecutive_readings() {
        let mut sim = SimBackend::default();
        let readings: Vec<i64> = (0..100).map(|_| sim.read().unwrap().raw).collect();
        let max_jump = readings.windows(2).map(|w| (w[1] - w[0]).abs()).max().unwrap();
        assert!(max_jump < 200, "max consecutive jump too large: {max_jump}");
    }

    #[test]
    fn manual_wetting_trigger_raises_raw_over_time() {
        let mut sim = SimBackend::default();
        for _ in 0..20 {
            sim.read().unwrap();
        }
        let before: f64 = (0..10).map(|_| sim.read().unwrap().raw as f64).sum::<f64>() / 10.0;

        sim.trigger_wetting(20);
        for _ in 0..20 {
            sim.read().unwrap();
        }
        let after: f64 = (0..10).map(|_| sim.read().unwrap().raw as f64).sum::<f64>() / 10.0;

        assert!(after > before, "wetting pulse should raise raw: before={before} after={after}");
    }

    #[test]
    fn temperature_stays_in_plausible_band() {
        let mut sim = SimBackend::default();
        for _ in 0..200 {
            let r = sim.read().unwrap();
            assert!(r.temp_c > 0.0 && r.temp_c < 45.0);
        }
    }
}
