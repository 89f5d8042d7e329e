//! Forward simulation of drainage/drydown dynamics for day-ahead and
//! 7-day outlooks, and the hysteresis-banded status/urgency engine that
//! turns a theta reading into an actionable state.

use crate::sample::{DrainageDrydownParams, Status, Urgency};

const HYSTERESIS: f64 = 0.01;
const STEP_HOURS: f64 = 6.0;

/// One point of a forward-simulated outlook.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastPoint {
    pub hours_ahead: f64,
    pub theta: f64,
}

/// Explicit-Euler forward simulation from `theta0` at `Delta t = 6h` steps
/// out to `horizon_hours`. Uses the drainage ODE `dtheta/dt = -k_d*(theta -
/// theta_fc)` while `theta > theta_fc`, and the drydown ODE `dtheta/dt =
/// -k_u*(theta - theta_min)^beta` once at or below it. Falls back to a flat
/// projection (no change) when the relevant rate constant hasn't been
/// fitted yet.
pub fn simulate(
    theta0: f64,
    theta_fc: f64,
    params: &DrainageDrydownParams,
    horizon_hours: f64,
) -> Vec<ForecastPoint> {
    let mut out = Vec::new();
    let mut theta = theta0;
    let mut t = 0.0;
    out.push(ForecastPoint {
        hours_ahead: t,
        theta,
    });

    while t < horizon_hours {
        let dtheta_dt = if theta > theta_fc {
            match params.k_d {
                Some(k_d) => -k_d * (theta - theta_fc),
                None => 0.0,
            }
        } else {
            match (params.k_u, params.theta_min) {
                (Some(k_u), Some(theta_min)) => {
                    let beta = params.beta.unwrap_or(1.0);
                    let depth = (theta - theta_min).max(0.0);
                    -k_u * depth.powf(beta)
                }
                _ => 0.0,
            }
        };

        theta = (theta + dtheta_dt * STEP_HOURS).max(0.0);
        t += STEP_HOURS;
        out.push(ForecastPoint {
            hours_ahead: t,
            theta,
        });
    }

    out
}

/// Status/urgency engine with a hysteresis band of width `HYSTERESIS`
/// around `theta_refill` to prevent chattering near the refill threshold.
/// `prev_status` is the status assigned to the previous sample, or
/// `Status::Unknown` if none. `drying_rate` is signed m3/m3/hr (positive =
/// wetting), or `None` when there weren't enough trailing points to fit a
/// slope.
pub fn classify_status(
    theta: f64,
    theta_fc: f64,
    theta_refill: Option<f64>,
    drying_rate: Option<f64>,
    prev_status: Status,
) -> (Status, Urgency) {
    let Some(theta_refill) = theta_refill else {
        return (Status::Unknown, Urgency::None);
    };

    // Hysteresis: once in REFILL, re-entry into OPTIMAL/MONITOR requires
    // theta to climb back above theta_refill + H, not just theta_refill.
    if prev_status == Status::Refill && theta <= theta_refill + HYSTERESIS {
        return (Status::Refill, Urgency::High);
    }

    if theta < theta_refill - HYSTERESIS {
        return (Status::Refill, Urgency::High);
    }

    let rate = drying_rate.unwrap_or(0.0);

    if theta < theta_fc * 0.9 && rate < -0.002 {
        return (Status::Monitor, Urgency::Medium);
    }
    if theta < theta_fc && rate < -0.0005 {
        return (Status::Monitor, Urgency::Medium);
    }
    if theta < theta_fc {
        return (Status::Optimal, Urgency::Low);
    }

    // theta >= theta_fc: FULL is always non-actionable, even during rapid
    // drying above field capacity (see DESIGN.md open-question decision).
    (Status::Full, Urgency::None)
}

/// Converts an irrigation depth `depth_mm` applied over root depth
/// `root_depth_cm` into the theta bump `Delta theta = d / (Z * 10)`,
/// capped so `theta0 + Delta theta` never exceeds saturation `theta_s` —
/// used to compare candidate irrigation depths against the forward
/// simulation before scheduling one.
pub fn irrigation_delta_theta(depth_mm: f64, root_depth_cm: f64, theta0: f64, theta_s: f64) -> f64 {
    if root_depth_cm <= 0.0 {
        return 0.0;
    }
    let raw = depth_mm / (root_depth_cm * 10.0);
    raw.min((theta_s - theta0).max(0.0))
}

/// Qualitative label for a fitted drainage rate, used in diagnostics.
pub fn drainage_quality_label(k_d: Option<f64>) -> &'static str {
    match k_d {
        None => "unfitted",
        Some(k) if k < 0.01 => "poor",
        Some(k) if k > 0.15 => "excessive",
        Some(_) => "good",
    }
}
