//! Delta-method covariance and normal-approximation inference.

use std::f64::consts::SQRT_2;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::function::erf::{erfc, erfc_inv};

use crate::error::{RcrError, Result};
use crate::identification::Extended;

/// Standard normal CDF.
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

/// Standard normal quantile function; infinite at 0 and 1.
pub fn normal_quantile(p: f64) -> f64 {
    if p <= 0.0 {
        f64::NEG_INFINITY
    } else if p >= 1.0 {
        f64::INFINITY
    } else {
        -SQRT_2 * erfc_inv(2.0 * p)
    }
}

/// Two-sided critical value for a confidence level in percent.
pub fn critical_value(level: f64) -> f64 {
    normal_quantile((100.0 + level) / 200.0)
}

/// `vceadj * G Σ G'` for a `p × m` gradient matrix and `m × m` moment covariance.
pub fn delta_method(
    gradients: &DMatrix<f64>,
    moment_covariance: &DMatrix<f64>,
    vce_adjustment: f64,
) -> Result<DMatrix<f64>> {
    if gradients.ncols() != moment_covariance.nrows() {
        return Err(RcrError::dimension_mismatch(
            "gradient columns",
            moment_covariance.nrows(),
            gradients.ncols(),
        ));
    }
    let covariance = gradients * moment_covariance * gradients.transpose() * vce_adjustment;
    if covariance.iter().any(|value| value.is_nan()) {
        return Err(RcrError::NumericalError {
            context: "delta-method covariance",
        });
    }
    Ok(covariance)
}

/// One row of a coefficient table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub name: String,
    pub estimate: Extended,
    pub std_error: f64,
    pub z: f64,
    pub p_value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

impl Coefficient {
    /// Normal-approximation inference for an estimate with the given variance.
    pub fn new(name: impl Into<String>, estimate: Extended, variance: f64, level: f64) -> Self {
        let b = estimate.value();
        let std_error = variance.max(0.0).sqrt();
        let z = b / std_error;
        let p_value = 2.0 * (1.0 - normal_cdf(z.abs()));
        let half_width = critical_value(level) * std_error;
        Self {
            name: name.into(),
            estimate,
            std_error,
            z,
            p_value,
            ci_lower: b - half_width,
            ci_upper: b + half_width,
        }
    }
}

/// Coefficient rows for every parameter in `estimates`.
pub fn coefficients(
    names: &[&str],
    estimates: &[Extended],
    covariance: &DMatrix<f64>,
    level: f64,
) -> Vec<Coefficient> {
    names
        .iter()
        .zip(estimates)
        .enumerate()
        .map(|(i, (name, estimate))| Coefficient::new(*name, *estimate, covariance[(i, i)], level))
        .collect()
}

/// Correlation matrix implied by a covariance matrix; NaN where a variance is zero.
pub fn correlation(covariance: &DMatrix<f64>) -> DMatrix<f64> {
    let sd = DVector::from_iterator(
        covariance.nrows(),
        covariance.diagonal().iter().map(|v| v.max(0.0).sqrt()),
    );
    DMatrix::from_fn(covariance.nrows(), covariance.ncols(), |i, j| {
        if i == j && sd[i] > 0.0 {
            1.0
        } else {
            covariance[(i, j)] / (sd[i] * sd[j])
        }
    })
}
