//! High-level RCR estimation pipeline.

use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data::{Dataset, EstimationSample, Weights};
use crate::error::{RcrError, Result};
use crate::formulation::Formulation;
use crate::identification::{
    bound_gradient, estimate_parameter, identified_set, lambda_star, lambda_zero, theta_star,
    Extended, LambdaCurve, ThetaSegments,
};
use crate::inference::delta_method;
use crate::interval::{CiMethod, IdentifiedSet};
use crate::moments::MomentSet;
use crate::options::{EstimationOptions, LambdaRange};
use crate::postestimation::SampleSummary;
use crate::solving::SolverSummary;

/// The five RCR parameters, in reporting order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Parameter {
    /// Limit of `lambda(betax)` as `|betax|` grows.
    LambdaInf,
    /// Effect at which `lambda(betax)` diverges.
    BetaxInf,
    /// `lambda` implied by a zero effect.
    Lambda0,
    /// Lower bound of the identified set.
    BetaxL,
    /// Upper bound of the identified set.
    BetaxH,
}

impl Parameter {
    pub const ALL: [Parameter; 5] = [
        Parameter::LambdaInf,
        Parameter::BetaxInf,
        Parameter::Lambda0,
        Parameter::BetaxL,
        Parameter::BetaxH,
    ];

    /// Name used in tables and restriction expressions.
    pub fn name(self) -> &'static str {
        match self {
            Self::LambdaInf => "lambdaInf",
            Self::BetaxInf => "betaxInf",
            Self::Lambda0 => "lambda0",
            Self::BetaxL => "betaxL",
            Self::BetaxH => "betaxH",
        }
    }

    /// Position in the parameter vector and covariance matrix.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Parameter {
    type Err = RcrError;

    fn from_str(name: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|parameter| parameter.name() == name)
            .ok_or_else(|| RcrError::UnknownVariable { name: name.into() })
    }
}

/// Point estimates, covariance, and diagnostics computed from one moment set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RcrEstimate {
    /// Estimates in [`Parameter::ALL`] order.
    pub params: [Extended; 5],
    /// Gradients of the parameters with respect to the moment vector (5 × m).
    pub gradients: DMatrix<f64>,
    /// Asymptotic covariance of the parameters, including the variance adjustment.
    pub covariance: DMatrix<f64>,
    /// `lambda(betax)` over the segment search grid.
    pub curve: LambdaCurve,
    pub solver: SolverSummary,
}

impl RcrEstimate {
    /// Estimates the RCR parameters from a moment set.
    ///
    /// This is the part of [`RcrProblem::estimate`] that runs after sample
    /// selection, so moments computed elsewhere can be used directly. An
    /// undefined `lambda0` (for example `cov(yhat, zhat) = 0`) is reported as
    /// not identified.
    pub fn from_moments(moments: &MomentSet, options: &EstimationOptions) -> Result<Self> {
        options.validate()?;
        let sm = moments.simplified()?;
        sm.check()?;

        let mv = moments.vector().as_slice();
        let solver_options = &options.solver;

        let lambda_inf = estimate_parameter("lambdaInf", lambda_star, mv, solver_options);
        let betax_inf = estimate_parameter("betaxInf", theta_star, mv, solver_options);
        let lambda0 = estimate_parameter("lambda0", lambda_zero, mv, solver_options);
        if lambda0.value.is_nan() {
            return Err(RcrError::not_identified("lambda0 is undefined"));
        }

        let segments = ThetaSegments::locate(&sm, solver_options);
        let (betax_l, betax_h, roots) =
            identified_set(&sm, &options.lambda, &segments, solver_options)?;
        let (grad_l, accurate_l) = bound_gradient(betax_l, mv, solver_options);
        let (grad_h, accurate_h) = bound_gradient(betax_h, mv, solver_options);

        let closed_form = [&lambda_inf, &betax_inf, &lambda0];
        let mut params = [Extended::Finite(0.0); 5];
        for (slot, parameter) in params.iter_mut().zip(closed_form.iter()) {
            *slot = Extended::from_f64(parameter.value).ok_or(RcrError::NumericalError {
                context: "RCR parameter estimation",
            })?;
        }
        params[Parameter::BetaxL.index()] = betax_l;
        params[Parameter::BetaxH.index()] = betax_h;

        let m = mv.len();
        let mut gradients = DMatrix::<f64>::zeros(5, m);
        let rows: [&DVector<f64>; 5] = [
            &lambda_inf.gradient,
            &betax_inf.gradient,
            &lambda0.gradient,
            &grad_l,
            &grad_h,
        ];
        for (i, row) in rows.iter().enumerate() {
            gradients.row_mut(i).copy_from(&row.transpose());
        }
        let covariance = delta_method(&gradients, moments.covariance(), options.vce_adjustment)?;

        let solver = SolverSummary {
            grid_points: segments.curve().theta.len(),
            segment_points: segments.points().len(),
            roots,
            derivatives_accurate: closed_form.iter().all(|p| p.accurate) && accurate_l && accurate_h,
        };
        log::debug!(
            "betax identified set [{}, {}] for lambda in {}",
            betax_l,
            betax_h,
            options.lambda
        );

        Ok(Self {
            params,
            gradients,
            covariance,
            curve: segments.curve().clone(),
            solver,
        })
    }

    /// Estimate of one parameter.
    pub fn param(&self, parameter: Parameter) -> Extended {
        self.params[parameter.index()]
    }

    /// Standard error of a parameter.
    pub fn std_error(&self, parameter: Parameter) -> f64 {
        let i = parameter.index();
        self.covariance[(i, i)].max(0.0).sqrt()
    }

    /// Bounds of the identified set with their standard errors.
    pub fn identified_set(&self) -> IdentifiedSet {
        IdentifiedSet {
            lower: self.param(Parameter::BetaxL),
            upper: self.param(Parameter::BetaxH),
            se_lower: self.std_error(Parameter::BetaxL),
            se_upper: self.std_error(Parameter::BetaxH),
        }
    }
}

/// An RCR model bound to a dataset.
#[derive(Clone, Debug)]
pub struct RcrProblem {
    data: Dataset,
    formulation: Formulation,
}

impl RcrProblem {
    /// Constructs a new RCR estimation problem.
    pub fn new(data: Dataset, formulation: Formulation) -> Result<Self> {
        for name in formulation.variables() {
            data.column(name)?;
        }
        Ok(Self { data, formulation })
    }

    /// Accessor for the dataset.
    pub fn data(&self) -> &Dataset {
        &self.data
    }

    /// Accessor for the model formulation.
    pub fn formulation(&self) -> &Formulation {
        &self.formulation
    }

    /// Estimates the model. Either every step succeeds and a complete result is
    /// returned, or nothing is.
    pub fn estimate(&self, options: &EstimationOptions) -> Result<EstimationResult> {
        options.validate()?;
        self.check_roles(options)?;

        let sample = EstimationSample::select(
            &self.data,
            &self.formulation,
            options.sample.as_deref(),
            options.weights.as_ref(),
            options.cluster.as_deref(),
        )?;
        let moments = MomentSet::from_sample(&sample)?;
        let estimate = RcrEstimate::from_moments(&moments, options)?;
        let summary = SampleSummary::from_sample(&sample, &self.formulation);

        Ok(EstimationResult {
            formulation: self.formulation.clone(),
            estimate,
            observations: sample.observations(),
            clusters: sample.clusters().map(|c| c.count()),
            lambda: options.lambda,
            level: options.level,
            ci_method: options.ci_method,
            vce_adjustment: options.vce_adjustment,
            cluster_variable: options.cluster.clone(),
            weights: options.weights.clone(),
            sample: sample.mask().to_vec(),
            summary,
            moments,
        })
    }

    fn check_roles(&self, options: &EstimationOptions) -> Result<()> {
        if let Some(weights) = &options.weights {
            if self.formulation.contains(&weights.variable) {
                return Err(RcrError::ConflictingOptions {
                    reason: format!("weight variable `{}` is a model variable", weights.variable),
                });
            }
        }
        if let Some(cluster) = &options.cluster {
            if cluster == self.formulation.outcome() || cluster == self.formulation.treatment() {
                return Err(RcrError::ConflictingOptions {
                    reason: format!("cluster variable `{cluster}` is the outcome or treatment"),
                });
            }
        }
        Ok(())
    }
}

/// Everything an RCR estimation produced; owned by the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EstimationResult {
    pub formulation: Formulation,
    pub estimate: RcrEstimate,
    /// Number of observations (`N`).
    pub observations: usize,
    /// Number of clusters when a cluster-robust covariance was requested.
    pub clusters: Option<usize>,
    pub lambda: LambdaRange,
    /// Default confidence level in percent.
    pub level: f64,
    /// Default `betax` interval method.
    pub ci_method: CiMethod,
    pub vce_adjustment: f64,
    pub cluster_variable: Option<String>,
    pub weights: Option<Weights>,
    /// `true` for dataset rows in the estimation sample.
    pub sample: Vec<bool>,
    pub summary: SampleSummary,
    pub moments: MomentSet,
}

impl EstimationResult {
    /// Estimates in [`Parameter::ALL`] order.
    pub fn params(&self) -> &[Extended; 5] {
        &self.estimate.params
    }

    /// Estimate of one parameter.
    pub fn param(&self, parameter: Parameter) -> Extended {
        self.estimate.param(parameter)
    }

    /// Standard error of one parameter; zero when it is unbounded.
    pub fn std_error(&self, parameter: Parameter) -> f64 {
        self.estimate.std_error(parameter)
    }

    /// Names of the parameters, in order.
    pub fn param_names(&self) -> [&'static str; 5] {
        Parameter::ALL.map(Parameter::name)
    }

    /// Diagnostics from the numerical solver.
    pub fn solver_summary(&self) -> &SolverSummary {
        &self.estimate.solver
    }

    /// `lambda(betax)` over the segment search grid.
    pub fn details(&self) -> &LambdaCurve {
        &self.estimate.curve
    }
}
