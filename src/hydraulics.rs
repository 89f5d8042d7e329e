//! Van Genuchten soil-water retention and Mualem–van Genuchten hydraulic
//! conductivity, plus the available-water accounting derived from them.
//! Pure, allocation-free functions — no access to the ring buffer or store.

#[derive(Debug, Clone, Copy)]
pub struct VanGenuchtenParams {
    pub theta_r: f64,
    pub theta_s: f64,
    pub alpha: f64,
    pub n: f64,
    pub k_s: f64,
}

impl Default for VanGenuchtenParams {
    /// Loam defaults.
    fn default() -> Self {
        Self {
            theta_r: 0.078,
            theta_s: 0.43,
            alpha: 0.036,
            n: 1.56,
            k_s: 25.0,
        }
    }
}

impl VanGenuchtenParams {
    fn m(&self) -> f64 {
        1.0 - 1.0 / self.n
    }

    /// `theta(psi)`, psi in cm H2O (magnitude; psi<=0 is saturation).
    pub fn theta_from_psi(&self, psi_cm: f64) -> f64 {
        if psi_cm <= 0.0 {
            return self.theta_s;
        }
        let m = self.m();
        let se = (1.0 + (self.alpha * psi_cm).powf(self.n)).powf(-m);
        self.theta_r + (self.theta_s - self.theta_r) * se
    }

    /// Inverse: psi (cm H2O, positive) that produces `theta`. Clamps theta
    /// into `(theta_r+0.001, theta_s-0.001)` first per the retention curve's
    /// open domain.
    pub fn psi_from_theta(&self, theta: f64) -> f64 {
        let lo = self.theta_r + 0.001;
        let hi = self.theta_s - 0.001;
        let theta = theta.clamp(lo, hi);
        let m = self.m();
        let se = (theta - self.theta_r) / (self.theta_s - self.theta_r);
        (1.0 / self.alpha) * (se.powf(-1.0 / m) - 1.0).powf(1.0 / self.n)
    }

    pub fn psi_kpa_from_theta(&self, theta: f64) -> f64 {
        self.psi_from_theta(theta) / 10.0
    }

    /// Mualem–van Genuchten hydraulic conductivity, L=0.5.
    pub fn conductivity(&self, theta: f64) -> f64 {
        const L: f64 = 0.5;
        let se = ((theta - self.theta_r) / (self.theta_s - self.theta_r)).clamp(0.0, 1.5);
        if se >= 1.0 {
            return self.k_s;
        }
        if se <= 0.01 {
            return self.k_s * 1e-10;
        }
        let m = self.m();
        let inner = 1.0 - (1.0 - se.powf(1.0 / m)).powf(m);
        self.k_s * se.powf(L) * inner.powi(2)
    }

    pub fn field_capacity(&self) -> f64 {
        self.theta_from_psi(330.0)
    }

    pub fn permanent_wilting_point(&self) -> f64 {
        self.theta_from_psi(15_000.0)
    }
}

/// `(taw_mm, aw_mm, d_r_mm, fraction_depleted)` for root depth `z_cm`.
pub fn available_water(
    theta: f64,
    theta_fc: f64,
    theta_pwp: f64,
    z_cm: f64,
) -> (f64, f64, f64, f64) {
    let taw = (theta_fc - theta_pwp) * z_cm * 10.0;
    let aw = ((theta - theta_pwp) * z_cm * 10.0).max(0.0);
    let d_r = taw - aw;
    let fraction_depleted = if taw > 0.0 {
        (d_r / taw).clamp(0.0, 1.0)
    } else {
        0.0
    };
    (taw, aw, d_r, fraction_depleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturation_at_zero_tension() {
        let p = VanGenuchtenParams::default();
        assert_eq!(p.theta_from_psi(0.0), p.theta_s);
    }

    #[test]
    fn round_trip_theta_psi() {
        let p = VanGenuchtenParams::default();
        for i in 1..20 {
            let theta = p.theta_r + 0.001 + (i as f64 / 20.0) * (p.theta_s - p.theta_r - 0.002);
            let psi = p.psi_from_theta(theta);
            let back = p.theta_from_psi(psi);
            assert!(
                (back - theta).abs() < 1e-4,
                "theta={theta} back={back} psi={psi}"
            );
        }
    }

    #[test]
    fn field_capacity_between_residual_and_saturation() {
        let p = VanGenuchtenParams::default();
        let fc = p.field_capacity();
        assert!(fc > p.theta_r && fc < p.theta_s);
    }

    #[test]
    fn pwp_is_drier_than_field_capacity() {
        let p = VanGenuchtenParams::default();
        assert!(p.permanent_wilting_point() < p.field_capacity());
    }

    #[test]
    fn conductivity_at_saturation_is_ks() {
        let p = VanGenuchtenParams::default();
        assert_eq!(p.conductivity(p.theta_s), p.k_s);
    }

    #[test]
    fn conductivity_near_residual_is_tiny() {
        let p = VanGenuchtenParams::default();
        let k = p.conductivity(p.theta_r + 0.0005);
        assert!(k <= p.k_s * 1e-9);
    }

    #[test]
    fn conductivity_is_monotonic_in_theta() {
        let p = VanGenuchtenParams::default();
        let k_low = p.conductivity(0.15);
        let k_high = p.conductivity(0.35);
        assert!(k_high > k_low);
    }

    #[test]
    fn available_water_accounting() {
        let (taw, aw, d_r, frac) = available_water(0.25, 0.35, 0.12, 30.0);
        assert!((taw - 69.0).abs() < 1e-9);
        assert!((aw - 39.0).abs() < 1e-9);
        assert!((d_r - 30.0).abs() < 1e-9);
        assert!((frac - d_r / taw).abs() < 1e-9);
    }

    #[test]
    fn available_water_clamps_negative_aw_to_zero() {
        let (_, aw, _, _) = available_water(0.05, 0.35, 0.12, 30.0);
        assert_eq!(aw, 0.0);
    }

    #[test]
    fn fraction_depleted_clamped_to_unit_interval() {
        let (_, _, _, frac) = available_water(0.50, 0.35, 0.12, 30.0);
        assert!((0.0..=1.0).contains(&frac));
    }
}
