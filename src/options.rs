//! Configuration structures for RCR estimation.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::Weights;
use crate::error::{RcrError, Result};
use crate::interval::CiMethod;
use crate::solving::SolverOptions;

/// Range `[lambdaL, lambdaH]` assumed for the relative correlation `lambda`.
///
/// A missing bound is unbounded in that direction.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LambdaRange {
    pub lower: Option<f64>,
    pub upper: Option<f64>,
}

impl Default for LambdaRange {
    fn default() -> Self {
        Self::bounded(0.0, 1.0)
    }
}

impl LambdaRange {
    /// A range from optional bounds; `None` leaves that side unbounded.
    pub fn new(lower: Option<f64>, upper: Option<f64>) -> Self {
        Self { lower, upper }
    }

    /// A range with both bounds present.
    pub fn bounded(lower: f64, upper: f64) -> Self {
        Self::new(Some(lower), Some(upper))
    }

    /// Bounds as IEEE values, with missing bounds mapped to infinities.
    pub fn as_f64(&self) -> (f64, f64) {
        (
            self.lower.unwrap_or(f64::NEG_INFINITY),
            self.upper.unwrap_or(f64::INFINITY),
        )
    }

    /// Checks that present bounds are finite and ordered.
    pub fn validate(&self) -> Result<()> {
        for value in [self.lower, self.upper].into_iter().flatten() {
            if !value.is_finite() {
                return Err(RcrError::InvalidLambdaBound { value });
            }
        }
        if let (Some(lower), Some(upper)) = (self.lower, self.upper) {
            if lower > upper {
                return Err(RcrError::InvertedLambdaRange { lower, upper });
            }
        }
        Ok(())
    }
}

impl fmt::Display for LambdaRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.lower {
            Some(lower) => write!(f, "[{lower}, ")?,
            None => f.write_str("(-inf, ")?,
        }
        match self.upper {
            Some(upper) => write!(f, "{upper}]"),
            None => f.write_str("+inf)"),
        }
    }
}

/// Options controlling a single RCR estimation run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EstimationOptions {
    /// Assumed range for `lambda`.
    pub lambda: LambdaRange,
    /// Default interval method for `betax`.
    pub ci_method: CiMethod,
    /// Confidence level in percent.
    pub level: f64,
    /// Scalar applied to the whole parameter covariance matrix.
    pub vce_adjustment: f64,
    /// Variable whose values identify clusters for the robust covariance.
    pub cluster: Option<String>,
    /// Observation weights.
    pub weights: Option<Weights>,
    /// Row filter; `false` rows are excluded before estimation.
    pub sample: Option<Vec<bool>>,
    /// Numerical solver configuration.
    pub solver: SolverOptions,
}

impl Default for EstimationOptions {
    fn default() -> Self {
        Self {
            lambda: LambdaRange::default(),
            ci_method: CiMethod::Conservative,
            level: 95.0,
            vce_adjustment: 1.0,
            cluster: None,
            weights: None,
            sample: None,
            solver: SolverOptions::default(),
        }
    }
}

impl EstimationOptions {
    /// Overrides the lambda range.
    pub fn with_lambda(mut self, lower: Option<f64>, upper: Option<f64>) -> Self {
        self.lambda = LambdaRange::new(lower, upper);
        self
    }

    /// Sets the default `betax` confidence interval method.
    pub fn with_ci_method(mut self, method: CiMethod) -> Self {
        self.ci_method = method;
        self
    }

    /// Sets the confidence level in percent, e.g. `95.0`.
    pub fn with_level(mut self, level: f64) -> Self {
        self.level = level;
        self
    }

    /// Scales the estimated covariance matrix by `factor`.
    pub fn with_vce_adjustment(mut self, factor: f64) -> Self {
        self.vce_adjustment = factor;
        self
    }

    /// Requests a cluster-robust covariance keyed on `variable`.
    pub fn with_cluster<S: Into<String>>(mut self, variable: S) -> Self {
        self.cluster = Some(variable.into());
        self
    }

    /// Weights observations by a variable of the given kind.
    pub fn with_weights(mut self, weights: Weights) -> Self {
        self.weights = Some(weights);
        self
    }

    /// Restricts estimation to rows where `mask` is `true`.
    pub fn with_sample(mut self, mask: Vec<bool>) -> Self {
        self.sample = Some(mask);
        self
    }

    /// Replaces the numerical solver settings.
    pub fn with_solver(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }

    /// Checks the options that do not depend on the data.
    pub fn validate(&self) -> Result<()> {
        self.lambda.validate()?;
        check_level(self.level)?;
        if !(self.vce_adjustment.is_finite() && self.vce_adjustment > 0.0) {
            return Err(RcrError::InvalidVarianceAdjustment {
                factor: self.vce_adjustment,
            });
        }
        Ok(())
    }
}

/// Checks that a confidence level in percent lies strictly inside `(0, 100)`.
pub fn check_level(level: f64) -> Result<()> {
    if level.is_finite() && level > 0.0 && level < 100.0 {
        Ok(())
    } else {
        Err(RcrError::InvalidConfidenceLevel { level })
    }
}
