use super::dual::Dual;
use std::fmt;
use std::ops::{Add, Div, Mul, Neg, Sub};

/// A value with its 1-sigma uncertainty.
///
/// Arithmetic between two measurements assumes independent errors and propagates them to
/// first order. Correlated quantities should go through [`Measurement::map`] on a single
/// variable or through an explicit covariance.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct Measurement {
    pub value: f64,
    pub uncertainty: f64,
}

impl Measurement {
    pub fn new(value: f64, uncertainty: f64) -> Self {
        Self {
            value,
            uncertainty: uncertainty.abs(),
        }
    }

    pub fn exact(value: f64) -> Self {
        Self {
            value,
            uncertainty: 0.0,
        }
    }

    pub fn nan() -> Self {
        Self {
            value: f64::NAN,
            uncertainty: f64::NAN,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.value.is_finite() && self.uncertainty.is_finite()
    }

    pub fn relative_uncertainty(&self) -> f64 {
        (self.uncertainty / self.value).abs()
    }

    pub fn variance(&self) -> f64 {
        self.uncertainty * self.uncertainty
    }

    /// Pushes the measurement through a nonlinear function using its derivative.
    pub fn map<F>(&self, f: F) -> Measurement
    where
        F: Fn(Dual) -> Dual,
    {
        let out = f(Dual::var(self.value));
        Measurement::new(out.val, out.dot * self.uncertainty)
    }

    pub fn sqrt(&self) -> Measurement {
        self.map(Dual::sqrt)
    }

    pub fn ln(&self) -> Measurement {
        self.map(Dual::ln)
    }

    /// Weighted mean of independent measurements (inverse-variance weights).
    pub fn weighted_mean(values: &[Measurement]) -> Option<Measurement> {
        let mut sum_w = 0.0;
        let mut sum_wx = 0.0;
        for m in values {
            if m.uncertainty > 0.0 && m.is_finite() {
                let w = 1.0 / m.variance();
                sum_w += w;
                sum_wx += w * m.value;
            }
        }
        if sum_w > 0.0 {
            Some(Measurement::new(sum_wx / sum_w, (1.0 / sum_w).sqrt()))
        } else {
            None
        }
    }
}

impl From<f64> for Measurement {
    fn from(value: f64) -> Self {
        Measurement::exact(value)
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match f.precision() {
            Some(p) => write!(f, "{:.*} ± {:.*}", p, self.value, p, self.uncertainty),
            None => write!(f, "{} ± {}", self.value, self.uncertainty),
        }
    }
}

impl Add for Measurement {
    type Output = Measurement;
    fn add(self, rhs: Measurement) -> Measurement {
        Measurement::new(
            self.value + rhs.value,
            self.uncertainty.hypot(rhs.uncertainty),
        )
    }
}

impl Sub for Measurement {
    type Output = Measurement;
    fn sub(self, rhs: Measurement) -> Measurement {
        Measurement::new(
            self.value - rhs.value,
            self.uncertainty.hypot(rhs.uncertainty),
        )
    }
}

impl Mul for Measurement {
    type Output = Measurement;
    fn mul(self, rhs: Measurement) -> Measurement {
        let value = self.value * rhs.value;
        let uncertainty = (rhs.value * self.uncertainty).hypot(self.value * rhs.uncertainty);
        Measurement::new(value, uncertainty)
    }
}

impl Div for Measurement {
    type Output = Measurement;
    fn div(self, rhs: Measurement) -> Measurement {
        let value = self.value / rhs.value;
        let uncertainty = (self.uncertainty / rhs.value)
            .hypot(self.value * rhs.uncertainty / (rhs.value * rhs.value));
        Measurement::new(value, uncertainty)
    }
}

impl Neg for Measurement {
    type Output = Measurement;
    fn neg(self) -> Measurement {
        Measurement {
            value: -self.value,
            uncertainty: self.uncertainty,
        }
    }
}

impl Add<f64> for Measurement {
    type Output = Measurement;
    fn add(self, rhs: f64) -> Measurement {
        Measurement::new(self.value + rhs, self.uncertainty)
    }
}

impl Sub<f64> for Measurement {
    type Output = Measurement;
    fn sub(self, rhs: f64) -> Measurement {
        Measurement::new(self.value - rhs, self.uncertainty)
    }
}

impl Mul<f64> for Measurement {
    type Output = Measurement;
    fn mul(self, rhs: f64) -> Measurement {
        Measurement::new(self.value * rhs, self.uncertainty * rhs)
    }
}

impl Div<f64> for Measurement {
    type Output = Measurement;
    fn div(self, rhs: f64) -> Measurement {
        Measurement::new(self.value / rhs, self.uncertainty / rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sums_add_in_quadrature() {
        let a = Measurement::new(10.0, 3.0);
        let b = Measurement::new(5.0, 4.0);
        let s = a + b;
        assert_relative_eq!(s.value, 15.0);
        assert_relative_eq!(s.uncertainty, 5.0);
        let d = a - b;
        assert_relative_eq!(d.value, 5.0);
        assert_relative_eq!(d.uncertainty, 5.0);
    }

    #[test]
    fn ratios_add_relative_errors_in_quadrature() {
        let a = Measurement::new(100.0, 3.0);
        let b = Measurement::new(50.0, 2.0);
        let r = a / b;
        assert_relative_eq!(r.value, 2.0);
        let expected = 2.0 * (0.03_f64.powi(2) + 0.04_f64.powi(2)).sqrt();
        assert_relative_eq!(r.uncertainty, expected, epsilon = 1e-12);
    }

    #[test]
    fn map_uses_derivative() {
        let x = Measurement::new(4.0, 0.2);
        let root = x.sqrt();
        assert_relative_eq!(root.value, 2.0);
        assert_relative_eq!(root.uncertainty, 0.05, epsilon = 1e-12);

        let squared = x.map(|d| d * d);
        assert_relative_eq!(squared.uncertainty, 1.6, epsilon = 1e-12);
    }

    #[test]
    fn weighted_mean_prefers_precise_values() {
        let mean = Measurement::weighted_mean(&[
            Measurement::new(1.0, 1.0),
            Measurement::new(3.0, 1.0),
        ])
        .unwrap();
        assert_relative_eq!(mean.value, 2.0);
        assert_relative_eq!(mean.uncertainty, 1.0 / 2.0_f64.sqrt(), epsilon = 1e-12);
        assert!(Measurement::weighted_mean(&[Measurement::exact(1.0)]).is_none());
    }

    #[test]
    fn display_honours_precision() {
        let m = Measurement::new(1.23456, 0.01234);
        assert_eq!(format!("{m:.2}"), "1.23 ± 0.01");
    }
}
