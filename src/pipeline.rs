//! Orchestration context: ties acquisition -> calibration -> hydraulics ->
//! auto-calibration -> status engine -> persistence into one place. Owned
//! by `main.rs`'s acquisition task and shared with the web layer behind a
//! single async lock, per the single-writer/many-reader concurrency model.

use crate::autocal::AutoCal;
use crate::calibration;
use crate::config::Config;
use crate::db::Db;
use crate::dynamics;
use crate::error::Result;
use crate::hydraulics::{available_water, VanGenuchtenParams};
use crate::ringbuffer::RingBuffer;
use crate::sample::{Regime, Sample, Status};
use crate::sensors::{RawReading, SensorBackend};
use crate::state::SharedState;
use std::collections::VecDeque;

/// Bounded RAM batch: samples accumulate here between flushes. Oldest
/// entries are dropped on overflow rather than blocking acquisition —
/// the backpressure policy for a single-threaded cooperative runtime
/// where the DB write lags behind the sample cadence.
const MAX_PENDING_BATCH: usize = 64;

pub struct Pipeline {
    pub ring: RingBuffer,
    pub autocal: AutoCal,
    pub cfg: Config,
    vg: VanGenuchtenParams,
    pending: VecDeque<Sample>,
    prev_status: Status,
    seq: i64,
}

impl Pipeline {
    pub fn new(cfg: Config, vg: VanGenuchtenParams) -> Self {
        Self {
            ring: RingBuffer::new(crate::ringbuffer::DEFAULT_CAPACITY),
            autocal: AutoCal::new(vg),
            cfg,
            vg,
            pending: VecDeque::new(),
            prev_status: Status::Unknown,
            seq: 0,
        }
    }

    /// Runs one acquisition cycle: read the sensor, calibrate, compute QC,
    /// update hydraulics/regime/status, advance auto-calibration, and
    /// queue the resulting sample for the next DB flush.
    pub async fn acquire(
        &mut self,
        backend: &mut dyn SensorBackend,
        now_ts: i64,
        db: &Db,
        shared: &SharedState,
    ) -> Result<Sample> {
        let RawReading { raw, temp_c } = backend.read()?;

        let raw_theta = calibration::raw_to_theta(raw);
        let corrected_theta = calibration::apply_corrections(raw_theta, temp_c, &self.cfg);
        let qc_flags = calibration::compute_qc_flags(corrected_theta, temp_c, &self.ring, &self.cfg);
        let qc_valid = qc_flags.is_empty();
        let theta = corrected_theta.clamp(self.cfg.theta_min_bound, self.cfg.theta_max_bound);

        let theta_fc = self.autocal.theta_fc;
        let theta_pwp = self.vg.permanent_wilting_point();
        let (_taw_mm, aw_mm, _d_r_mm, fraction_depleted) =
            available_water(theta, theta_fc, theta_pwp, self.cfg.root_depth_cm);
        let psi_kpa = self.vg.psi_kpa_from_theta(theta);

        let drying_rate = crate::events::drying_rate(&self.ring, now_ts, self.cfg.slope_window_s);
        let regime = if qc_valid {
            crate::events::classify_regime(drying_rate, theta, theta_fc, &self.cfg)
        } else {
            Regime::Unknown
        };

        let (status, urgency) = if qc_valid {
            dynamics::classify_status(
                theta,
                theta_fc,
                self.autocal.theta_refill,
                drying_rate,
                self.prev_status,
            )
        } else {
            (Status::Unknown, crate::sample::Urgency::None)
        };
        self.prev_status = status;

        self.seq += 1;
        let sample = Sample {
            timestamp: now_ts,
            raw,
            temp_c,
            theta,
            theta_fc,
            theta_refill: self.autocal.theta_refill,
            psi_kpa,
            aw_mm,
            fraction_depleted,
            drying_rate,
            regime,
            status,
            urgency,
            confidence: self.autocal.confidence(&self.cfg),
            qc_valid,
            qc_flags,
            seq: self.seq,
        };

        let outcome = self.autocal.tick(&self.ring, now_ts, theta, qc_valid, &self.cfg);
        self.ring.push(sample.clone());

        {
            let mut st = shared.write().await;
            st.record_reading(now_ts, raw, temp_c, qc_valid, sample.qc_flags.clone());
            st.sensor_ok = qc_valid || !sample.qc_flags.contains(&crate::sample::QcFlag::OutOfBounds);
            if !qc_valid {
                st.record_error(now_ts, format!("qc flags: {:?}", sample.qc_flags));
            }
        }

        if let Some(cal) = outcome.calibration {
            db.insert_calibration(&cal).await?;
        }
        if let Some(ev) = outcome.event {
            db.insert_event(ev.ts_start, ev.ts_end, ev.event_type, ev.delta_theta, "{}")
                .await?;
        }

        self.enqueue(sample.clone());
        if self.pending.len() >= self.cfg.batch_size {
            self.flush(db, shared, now_ts).await?;
        }

        Ok(sample)
    }

    /// Rebuilds the ring buffer from persisted history after a restart.
    /// `samples` is expected newest-first (as `Db::recent_samples` returns
    /// it); pushes oldest-first so the ring's ordering and trailing-window
    /// statistics come out the same as if the process had never restarted.
    pub fn rehydrate(&mut self, mut samples: Vec<Sample>) {
        samples.reverse();
        for sample in samples {
            self.seq = self.seq.max(sample.seq);
            self.prev_status = sample.status;
            self.ring.push(sample);
        }
    }

    fn enqueue(&mut self, sample: Sample) {
        if self.pending.len() >= MAX_PENDING_BATCH {
            self.pending.pop_front();
            tracing::warn!(
                event = "persistence_backpressure",
                pending = self.pending.len(),
                "store lagging sample cadence — dropping oldest pending sample"
            );
        }
        self.pending.push_back(sample);
    }

    /// Flushes whatever is pending as one atomic batch write, regardless of
    /// whether `batch_size` has been reached — used for periodic forced
    /// flushes and graceful shutdown.
    pub async fn flush(&mut self, db: &Db, shared: &SharedState, now_ts: i64) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch: Vec<Sample> = self.pending.drain(..).collect();
        db.insert_samples_batch(&batch).await?;
        let mut st = shared.write().await;
        st.record_write(now_ts);
        Ok(())
    }

    pub fn forecast(&self, horizon_hours: f64) -> Vec<dynamics::ForecastPoint> {
        let theta0 = self.ring.latest().map(|s| s.theta).unwrap_or(self.autocal.theta_fc);
        dynamics::simulate(theta0, self.autocal.theta_fc, &self.autocal.params, horizon_hours)
    }

    /// Same forward simulation as [`Pipeline::forecast`], but starting from
    /// the theta a candidate irrigation depth would produce — lets callers
    /// compare several depths against each other before scheduling one.
    pub fn forecast_with_irrigation(
        &self,
        depth_mm: f64,
        horizon_hours: f64,
    ) -> Vec<dynamics::ForecastPoint> {
        let theta0 = self.ring.latest().map(|s| s.theta).unwrap_or(self.autocal.theta_fc);
        let delta = dynamics::irrigation_delta_theta(
            depth_mm,
            self.cfg.root_depth_cm,
            theta0,
            self.vg.theta_s,
        );
        dynamics::simulate(
            theta0 + delta,
            self.autocal.theta_fc,
            &self.autocal.params,
            horizon_hours,
        )
    }
}
