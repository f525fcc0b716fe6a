//! Numerical solver configuration, diagnostics, and the scalar routines behind
//! the RCR parameter solver: Brent minimization, Brent root finding, and
//! Ridders' extrapolated central differences.

use argmin::core::{CostFunction, Executor, State, TerminationReason, TerminationStatus};
use argmin::solver::brent::{BrentOpt, BrentRoot};
use serde::{Deserialize, Serialize};

use crate::error::{RcrError, Result};

/// Configuration for the segment search, root finding, and numerical derivatives.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SolverOptions {
    /// Number of points in the theta grid used to locate monotonic segments of `lambda(theta)`.
    pub grid_size: usize,
    /// The evenly spaced part of the grid covers `[-grid_half_width, grid_half_width]`.
    pub grid_half_width: f64,
    /// Relative tolerance for Brent refinement of local optima.
    pub optimum_tolerance: f64,
    /// Absolute tolerance passed to Brent root finding.
    pub root_tolerance: f64,
    /// Maximum iterations for either Brent routine.
    pub max_iterations: usize,
    /// Slack applied to the lambda bounds when classifying candidate thetas.
    pub lambda_slack: f64,
    /// Number of initial derivative step sizes tried (`0.1, 0.01, ...`).
    pub derivative_attempts: usize,
    /// Largest acceptable estimated error of a numerical derivative.
    pub derivative_tolerance: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            grid_size: 30_000,
            grid_half_width: 50.0,
            optimum_tolerance: 1e-10,
            root_tolerance: 1e-200,
            max_iterations: 1_000,
            lambda_slack: 0.001,
            derivative_attempts: 10,
            derivative_tolerance: 0.01,
        }
    }
}

/// Diagnostics returned alongside the RCR parameter estimates.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SolverSummary {
    /// Number of theta values at which `lambda(theta)` was tabulated.
    pub grid_points: usize,
    /// Number of segment endpoints (critical points plus the outer limits).
    pub segment_points: usize,
    /// Number of lambda bounds inverted by root finding.
    pub roots: usize,
    /// `false` when some numerical derivative never met its error tolerance.
    pub derivatives_accurate: bool,
}

const NTAB: usize = 10;
const CON: f64 = 1.4;
const CON2: f64 = CON * CON;
const SAFE: f64 = 2.0;

/// Derivative of `f` at `x` by Ridders' method with initial step `h`.
///
/// Returns the derivative and an estimate of its error.
pub fn ridders<F>(mut f: F, x: f64, h: f64) -> (f64, f64)
where
    F: FnMut(f64) -> f64,
{
    let mut a = [[0.0f64; NTAB]; NTAB];
    let mut hh = h;
    a[0][0] = (f(x + hh) - f(x - hh)) / (2.0 * hh);
    let mut answer = a[0][0];
    let mut err = f64::MAX;
    for i in 1..NTAB {
        hh /= CON;
        a[0][i] = (f(x + hh) - f(x - hh)) / (2.0 * hh);
        let mut fac = CON2;
        for j in 1..=i {
            // Neville extrapolation toward zero step size.
            a[j][i] = (a[j - 1][i] * fac - a[j - 1][i - 1]) / (fac - 1.0);
            fac *= CON2;
            let errt = (a[j][i] - a[j - 1][i])
                .abs()
                .max((a[j][i] - a[j - 1][i - 1]).abs());
            if errt <= err {
                err = errt;
                answer = a[j][i];
            }
        }
        if (a[i][i] - a[i - 1][i - 1]).abs() >= SAFE * err {
            break;
        }
    }
    (answer, err)
}

/// Repeats `attempt` with initial steps `0.1^n` until its reported error is acceptable.
///
/// Returns the last value and whether the tolerance was met.
pub fn search_step<T, F>(options: &SolverOptions, mut attempt: F) -> (T, bool)
where
    F: FnMut(f64) -> (T, f64),
{
    let attempts = options.derivative_attempts.max(1);
    let mut n = 1;
    loop {
        let h = 0.1f64.powi(n as i32);
        let (value, errmax) = attempt(h);
        if errmax < options.derivative_tolerance {
            return (value, true);
        }
        if n == attempts {
            return (value, false);
        }
        n += 1;
    }
}

/// Gradient of `f` at `x` by Ridders' method, coordinate by coordinate.
pub fn gradient<F>(f: F, x: &[f64], options: &SolverOptions) -> (Vec<f64>, bool)
where
    F: Fn(&[f64]) -> f64,
{
    let mut point = x.to_vec();
    search_step(options, |h| {
        let mut errmax = 0.0f64;
        let mut grad = vec![0.0; x.len()];
        for i in 0..x.len() {
            let (d, err) = ridders(
                |t| {
                    point[i] = x[i] + t;
                    let value = f(point.as_slice());
                    point[i] = x[i];
                    value
                },
                0.0,
                h,
            );
            errmax = errmax.max(err);
            grad[i] = d;
        }
        (grad, errmax)
    })
}

/// Adapts a scalar closure to an argmin cost function.
struct ScalarFunction<F>(F);

impl<F> CostFunction for ScalarFunction<F>
where
    F: Fn(f64) -> f64,
{
    type Param = f64;
    type Output = f64;

    fn cost(&self, x: &Self::Param) -> std::result::Result<Self::Output, argmin::core::Error> {
        Ok((self.0)(*x))
    }
}

fn hit_iteration_cap(status: &TerminationStatus) -> bool {
    matches!(status, TerminationStatus::Terminated(TerminationReason::MaxItersReached))
}

/// Minimizes `f` on `[lower, upper]` by Brent's method.
///
/// The stopping tolerance at `x` is `tol * |x| + 1e-3 * EPSILON`.
pub fn brent_minimize<F>(
    f: F,
    lower: f64,
    upper: f64,
    tol: f64,
    max_iterations: usize,
) -> Result<f64>
where
    F: Fn(f64) -> f64,
{
    let solver = BrentOpt::new(lower.min(upper), lower.max(upper))
        .set_tolerance(tol, 1.0e-3 * f64::EPSILON);
    let res = Executor::new(ScalarFunction(f), solver)
        .configure(|state| state.max_iters(max_iterations as u64))
        .run()
        .map_err(|err| {
            log::warn!("Brent minimization on [{lower}, {upper}] failed: {err}");
            RcrError::NumericalError {
                context: "Brent minimization",
            }
        })?;
    let state = res.state();
    if hit_iteration_cap(state.get_termination_status()) {
        log::warn!("Brent minimization exceeded {max_iterations} iterations");
    }
    state.get_best_param().copied().ok_or(RcrError::NumericalError {
        context: "Brent minimization",
    })
}

/// Finds a root of `f` between `x1` and `x2` by Brent's method.
///
/// `f(x1)` and `f(x2)` must have opposite signs.
pub fn brent_root<F>(f: F, x1: f64, x2: f64, tol: f64, max_iterations: usize) -> Result<f64>
where
    F: Fn(f64) -> f64,
{
    let solver = BrentRoot::new(x1.min(x2), x1.max(x2), tol);
    let res = Executor::new(ScalarFunction(f), solver)
        .configure(|state| state.max_iters(max_iterations as u64))
        .run()
        .map_err(|err| {
            log::warn!("Brent root finding on [{x1}, {x2}] failed: {err}");
            RcrError::NumericalError {
                context: "Brent root finding",
            }
        })?;
    let state = res.state();
    if hit_iteration_cap(state.get_termination_status()) {
        log::warn!("Brent root finding exceeded {max_iterations} iterations");
    }
    // The cost is a signed residual; the current iterate is the root.
    state.get_param().copied().ok_or(RcrError::NumericalError {
        context: "Brent root finding",
    })
}
