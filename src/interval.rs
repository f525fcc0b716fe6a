//! Confidence intervals for the interval-identified effect `betax`, and the
//! hypothesis test obtained by inverting the Imbens-Manski interval.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RcrError, Result};
use crate::identification::Extended;
use crate::inference::{normal_cdf, normal_quantile};
use crate::options::check_level;

/// Construction used for the `betax` confidence interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CiMethod {
    /// Two one-sided intervals at `(1+a)/2` around the bounds; covers the whole
    /// identified set with probability at least `a`.
    Conservative,
    /// Imbens and Manski (2004): covers the true effect with probability `a`,
    /// with a critical value that shrinks toward `z_a` as the set widens.
    ImbensManski,
    /// `[betaxL - z_a SE_L, +inf)`.
    Upper,
    /// `(-inf, betaxH + z_a SE_H]`.
    Lower,
}

impl CiMethod {
    /// Every method, in display order.
    pub const ALL: [CiMethod; 4] = [
        CiMethod::Conservative,
        CiMethod::ImbensManski,
        CiMethod::Upper,
        CiMethod::Lower,
    ];

    /// The conventional name of the method.
    pub fn label(self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::ImbensManski => "Imbens-Manski",
            Self::Upper => "upper",
            Self::Lower => "lower",
        }
    }
}

impl fmt::Display for CiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for CiMethod {
    type Err = RcrError;

    fn from_str(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|method| method.label().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| RcrError::UnknownCiMethod { name: name.into() })
    }
}

/// A confidence interval for `betax`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub lower: Extended,
    pub upper: Extended,
    pub method: CiMethod,
    pub level: f64,
}

impl Interval {
    /// Returns `true` when `value` lies in the closed interval.
    pub fn contains(&self, value: f64) -> bool {
        self.lower.value() <= value && value <= self.upper.value()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let precision = f.precision().unwrap_or(6);
        write!(
            f,
            "[{:.p$}, {:.p$}] ({}, {}%)",
            self.lower,
            self.upper,
            self.method,
            self.level,
            p = precision
        )
    }
}

/// Estimated bounds of the identified set with their standard errors.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct IdentifiedSet {
    pub lower: Extended,
    pub upper: Extended,
    pub se_lower: f64,
    pub se_upper: f64,
}

impl IdentifiedSet {
    /// Confidence interval at `level` percent.
    ///
    /// For Imbens-Manski, an endpoint whose bound has a zero (or undefined)
    /// standard error is infinite, whether or not the bound itself is finite.
    pub fn confidence_interval(&self, method: CiMethod, level: f64) -> Result<Interval> {
        check_level(level)?;
        let a = level / 100.0;
        let (low, high) = match method {
            CiMethod::Conservative => {
                let crit = normal_quantile((1.0 + a) / 2.0);
                (
                    self.lower.value() - crit * self.se_lower,
                    self.upper.value() + crit * self.se_upper,
                )
            }
            CiMethod::ImbensManski => {
                let crit = self.imbens_manski_critical_value(a);
                (
                    self.shift_lower(crit),
                    self.shift_upper(crit),
                )
            }
            CiMethod::Upper => {
                let crit = normal_quantile(a);
                (self.lower.value() - crit * self.se_lower, f64::INFINITY)
            }
            CiMethod::Lower => {
                let crit = normal_quantile(a);
                (f64::NEG_INFINITY, self.upper.value() + crit * self.se_upper)
            }
        };
        let extend = |value: f64| {
            Extended::from_f64(value).ok_or(RcrError::NumericalError {
                context: "betax confidence interval",
            })
        };
        Ok(Interval {
            lower: extend(low)?,
            upper: extend(high)?,
            method,
            level,
        })
    }

    /// A bound without a positive standard error gives an infinite endpoint.
    fn shift_lower(&self, crit: f64) -> f64 {
        if self.se_lower > 0.0 {
            self.lower.value() - crit * self.se_lower
        } else {
            f64::NEG_INFINITY
        }
    }

    fn shift_upper(&self, crit: f64) -> f64 {
        if self.se_upper > 0.0 {
            self.upper.value() + crit * self.se_upper
        } else {
            f64::INFINITY
        }
    }

    /// Solves `Phi(c + Delta) - Phi(-c) = a` for `c` in `[z_a, z_{(1+a)/2}]`.
    fn imbens_manski_critical_value(&self, a: f64) -> f64 {
        let mut cv_min = normal_quantile(a);
        let mut cv_max = normal_quantile((1.0 + a) / 2.0);
        let mut cv_mid = cv_min;
        let delta =
            (self.upper.value() - self.lower.value()) / self.se_lower.max(self.se_upper);
        if delta.is_finite() {
            while cv_max - cv_min > 1e-6 {
                cv_mid = 0.5 * (cv_min + cv_max);
                if normal_cdf(cv_mid + delta) - normal_cdf(-cv_mid) < a {
                    cv_min = cv_mid;
                } else {
                    cv_max = cv_mid;
                }
            }
        }
        cv_mid
    }

    /// p-value for `H0: betax = h0`, from the highest level at which `h0` lies
    /// outside the Imbens-Manski interval.
    pub fn test(&self, h0: f64) -> Result<f64> {
        if self.lower.value() <= h0 && h0 <= self.upper.value() {
            return Ok(1.0);
        }
        let (mut low, mut high) = (0.0f64, 100.0f64);
        while high - low > 1e-5 {
            let mid = 0.5 * (low + high);
            let interval = self.confidence_interval(CiMethod::ImbensManski, mid)?;
            if interval.contains(h0) {
                high = mid;
            } else {
                low = mid;
            }
        }
        Ok(1.0 - low / 100.0)
    }
}
