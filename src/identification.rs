//! The RCR parameter solver.
//!
//! Under the relative correlation restriction, each candidate effect `theta`
//! implies a value `lambda(theta)` of the selection ratio. The identified set
//! for the effect is the set of `theta` whose `lambda(theta)` falls inside the
//! assumed `[lambdaL, lambdaH]`. `lambda(theta)` has a closed form, but its
//! inverse does not, so the real line is split into segments on which it is
//! monotonic and each lambda bound is inverted segment by segment.

use std::fmt;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::error::{RcrError, Result};
use crate::moments::SimplifiedMoments;
use crate::options::LambdaRange;
use crate::solving::{brent_minimize, brent_root, gradient, ridders, search_step, SolverOptions};

/// An extended real number: finite, or unbounded in either direction.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Extended {
    NegInfinity,
    Finite(f64),
    PosInfinity,
}

impl Extended {
    /// Converts an IEEE value; NaN has no extended-real counterpart.
    pub fn from_f64(value: f64) -> Option<Self> {
        if value.is_nan() {
            None
        } else if value == f64::INFINITY {
            Some(Self::PosInfinity)
        } else if value == f64::NEG_INFINITY {
            Some(Self::NegInfinity)
        } else {
            Some(Self::Finite(value))
        }
    }

    /// The IEEE value, with exact infinities for the unbounded cases.
    pub fn value(self) -> f64 {
        match self {
            Self::NegInfinity => f64::NEG_INFINITY,
            Self::Finite(value) => value,
            Self::PosInfinity => f64::INFINITY,
        }
    }

    /// The finite value, if any.
    pub fn finite(self) -> Option<f64> {
        match self {
            Self::Finite(value) => Some(value),
            _ => None,
        }
    }

    /// Returns `true` for [`Extended::Finite`].
    pub fn is_finite(self) -> bool {
        matches!(self, Self::Finite(_))
    }

    /// Substitutes `±big` for an unbounded value, for targets without infinities.
    pub fn display_value(self, big: f64) -> f64 {
        match self {
            Self::NegInfinity => -big,
            Self::Finite(value) => value,
            Self::PosInfinity => big,
        }
    }
}

impl fmt::Display for Extended {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NegInfinity => "-inf".to_string(),
            Self::PosInfinity => "+inf".to_string(),
            Self::Finite(value) => match f.precision() {
                Some(precision) => format!("{value:.precision$}"),
                None => value.to_string(),
            },
        };
        match f.width() {
            Some(width) => write!(f, "{text:>width$}"),
            None => f.write_str(&text),
        }
    }
}

/// `lambda(theta)`: the selection ratio implied by an effect of `theta`.
///
/// NaN where the formula is undefined.
pub fn lambda_of_theta(theta: f64, sm: &SimplifiedMoments) -> f64 {
    let num0 = sm.var_yhat - 2.0 * theta * sm.cov_yzhat + theta * theta * sm.var_zhat;
    let den0 = sm.var_y - sm.var_yhat - 2.0 * theta * (sm.cov_yz - sm.cov_yzhat)
        + theta * theta * (sm.var_z - sm.var_zhat);
    let num1 = sm.cov_yz - sm.cov_yzhat - theta * (sm.var_z - sm.var_zhat);
    let den1 = sm.cov_yzhat - theta * sm.var_zhat;
    if den0 != 0.0 && den1 != 0.0 && sign(num0) == sign(den0) {
        (num1 / den1) * (num0 / den0).sqrt()
    } else {
        f64::NAN
    }
}

fn sign(value: f64) -> f64 {
    if value > 0.0 {
        1.0
    } else if value < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// `lambdaInf = sqrt(var(z)/var(zhat) - 1)`, the limit of `lambda(theta)` as
/// `|theta|` grows; infinite when `var(zhat) = 0`.
pub fn lambda_star(sm: &SimplifiedMoments) -> f64 {
    if sm.var_zhat == 0.0 {
        f64::INFINITY
    } else {
        ((sm.var_z / sm.var_zhat).max(1.0) - 1.0).sqrt()
    }
}

/// `betaxInf = cov(yhat,zhat)/var(zhat)`, where `lambda(theta)` diverges.
pub fn theta_star(sm: &SimplifiedMoments) -> f64 {
    if sm.var_zhat == 0.0 {
        f64::NAN
    } else {
        sm.cov_yzhat / sm.var_zhat
    }
}

/// `lambda0 = lambda(0)`, the selection ratio implied by a zero effect.
pub fn lambda_zero(sm: &SimplifiedMoments) -> f64 {
    let resid = sm.var_y - sm.var_yhat;
    if resid != 0.0 && sm.cov_yzhat != 0.0 && sign(sm.var_yhat) == sign(resid) {
        ((sm.cov_yz - sm.cov_yzhat) / sm.cov_yzhat) * (sm.var_yhat / resid).sqrt()
    } else {
        f64::NAN
    }
}

fn simplified_or_nan(mv: &[f64], f: impl Fn(&SimplifiedMoments) -> f64) -> f64 {
    SimplifiedMoments::from_moment_vector(mv).map_or(f64::NAN, |sm| f(&sm))
}

/// `lambda(theta)` tabulated over the search grid.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LambdaCurve {
    pub theta: Vec<f64>,
    pub lambda: Vec<f64>,
}

/// Endpoints of the segments on which `lambda(theta)` is monotonic.
#[derive(Clone, Debug)]
pub struct ThetaSegments {
    points: Vec<f64>,
    curve: LambdaCurve,
}

impl ThetaSegments {
    /// Sorted segment endpoints.
    pub fn points(&self) -> &[f64] {
        &self.points
    }

    /// The grid on which the segments were located.
    pub fn curve(&self) -> &LambdaCurve {
        &self.curve
    }

    /// Locates the critical points of `lambda(theta)`.
    ///
    /// The grid is evenly spaced on `[-w, w]` plus the two outer limits
    /// `±thetamax`; the pair of grid points around `betaxInf` is tightened so
    /// that `lambda` is finite on both sides, and grid local optima are refined
    /// with Brent's method.
    pub fn locate(sm: &SimplifiedMoments, options: &SolverOptions) -> Self {
        let imax = options.grid_size.max(8);
        let theta_star = theta_star(sm);
        let thetamax = (f64::MAX / 1.0f64.max(sm.var_zhat).max(sm.var_z - sm.var_zhat))
            .sqrt()
            .min(1.0e100);

        let mut thetavec = linspace(-options.grid_half_width, options.grid_half_width, imax - 2);
        thetavec.push(thetamax);
        thetavec.push(-thetamax);
        thetavec.sort_by(f64::total_cmp);

        let count_below = |grid: &[f64]| grid.iter().filter(|t| **t < theta_star).count();
        if theta_star.is_finite() {
            let i = count_below(&thetavec);
            if 0 < i && i < imax {
                let i = i.clamp(2, imax - 2);
                if let Some(bracket) = bracket_theta_star(sm) {
                    thetavec[i - 1] = bracket[0];
                    thetavec[i] = bracket[1];
                }
            } else {
                log::warn!("betaxInf = {theta_star} lies outside [-{thetamax}, {thetamax}]");
            }
        }
        thetavec.sort_by(f64::total_cmp);
        let lambdavec: Vec<f64> = thetavec.iter().map(|t| lambda_of_theta(*t, sm)).collect();

        let mut localmin = vec![false; imax];
        let mut localmax = vec![false; imax];
        for c in 1..imax - 1 {
            localmin[c] = lambdavec[c] < lambdavec[c - 1] && lambdavec[c] < lambdavec[c + 1];
            localmax[c] = lambdavec[c] > lambdavec[c - 1] && lambdavec[c] > lambdavec[c + 1];
        }

        let mut bracket_index = None;
        if theta_star.is_finite() {
            let i = count_below(&thetavec);
            if 0 < i && i < imax {
                // The values around theta_star are never optima.
                localmin[i - 1] = false;
                localmin[i] = false;
                localmax[i - 1] = false;
                localmax[i] = false;
                bracket_index = Some(i);
            }
        }

        let mut refined = thetavec.clone();
        for c in 1..imax - 1 {
            let direction = if localmin[c] {
                1.0
            } else if localmax[c] {
                -1.0
            } else {
                continue;
            };
            let optimum = brent_minimize(
                |t| direction * lambda_of_theta(t, sm),
                refined[c - 1],
                refined[c + 1],
                options.optimum_tolerance,
                options.max_iterations,
            );
            // A failed refinement keeps the grid point.
            if let Ok(theta) = optimum {
                refined[c] = theta;
            }
        }

        let mut points = vec![-thetamax, thetamax];
        if let Some(i) = bracket_index {
            points.push(refined[i - 1]);
            points.push(refined[i]);
        }
        for c in 0..imax {
            if localmin[c] || localmax[c] {
                points.push(refined[c]);
            }
        }
        points.sort_by(f64::total_cmp);
        log::debug!(
            "lambda(theta) has {} segment endpoints over {} grid points",
            points.len(),
            imax
        );

        Self {
            points,
            curve: LambdaCurve {
                theta: thetavec,
                lambda: lambdavec,
            },
        }
    }
}

fn linspace(start: f64, stop: f64, count: usize) -> Vec<f64> {
    if count == 1 {
        return vec![start];
    }
    let step = (stop - start) / (count - 1) as f64;
    (0..count).map(|i| start + step * i as f64).collect()
}

/// The narrowest symmetric bracket around `betaxInf` on which `lambda` is
/// finite, nonzero, and has the sign of its one-sided limits.
fn bracket_theta_star(sm: &SimplifiedMoments) -> Option<[f64; 2]> {
    let theta_star = theta_star(sm);
    let gap = sm.cov_yz - sm.cov_yzhat * sm.var_z / sm.var_zhat;
    if gap == 0.0 {
        return None;
    }
    let limit_sign = [sign(gap), -sign(gap)];
    let scale = theta_star.abs().max(1.0);
    let mut bracket = None;
    for i in 1..=100 {
        let eps = scale * 0.1f64.powi(i);
        let candidate = [theta_star - eps, theta_star + eps];
        if !(candidate[0] < theta_star && theta_star < candidate[1]) {
            continue;
        }
        let lo = lambda_of_theta(candidate[0], sm);
        let hi = lambda_of_theta(candidate[1], sm);
        if lo.is_finite() && hi.is_finite() && lo * limit_sign[0] > 0.0 && hi * limit_sign[1] > 0.0
        {
            bracket = Some(candidate);
        }
    }
    if bracket.is_none() {
        log::warn!("unable to find a good bracket for theta_star");
    }
    bracket
}

/// The identified set `[betaxL, betaxH]` for a lambda range.
pub fn identified_set(
    sm: &SimplifiedMoments,
    range: &LambdaRange,
    segments: &ThetaSegments,
    options: &SolverOptions,
) -> Result<(Extended, Extended, usize)> {
    let (low, high) = range.as_f64();
    if low > high {
        return Err(RcrError::InvertedLambdaRange {
            lower: low,
            upper: high,
        });
    }
    let lambda_star = lambda_star(sm);
    if low <= lambda_star && lambda_star <= high {
        return Ok((Extended::NegInfinity, Extended::PosInfinity, 0));
    }

    let theta_star = theta_star(sm);
    let points = segments.points();
    let mut important = Vec::new();
    for pair in points.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if theta_star.is_finite() && a < theta_star && theta_star < b {
            continue;
        }
        let (la, lb) = (lambda_of_theta(a, sm), lambda_of_theta(b, sm));
        if la.is_nan() || lb.is_nan() {
            continue;
        }
        for bound in [low, high] {
            if bound > la.min(lb) && bound < la.max(lb) {
                let root = brent_root(
                    |t| lambda_of_theta(t, sm) - bound,
                    a,
                    b,
                    options.root_tolerance,
                    options.max_iterations,
                )?;
                important.push(root);
            }
        }
    }
    let roots = important.len();
    important.extend_from_slice(points);

    let slack = options.lambda_slack;
    let inrange: Vec<bool> = important
        .iter()
        .enumerate()
        .map(|(index, theta)| {
            if index < roots {
                return true;
            }
            let lambda = lambda_of_theta(*theta, sm);
            lambda >= low - slack && lambda <= high + slack
        })
        .collect();

    if !inrange.iter().any(|keep| *keep) {
        return Err(RcrError::EmptyIdentifiedSet {
            range: range.to_string(),
        });
    }

    let argmin = argmin_by(&important, |a, b| a < b);
    let argmax = argmin_by(&important, |a, b| a > b);
    let in_range_values = || {
        important
            .iter()
            .zip(inrange.iter())
            .filter(|(_, keep)| **keep)
            .map(|(theta, _)| *theta)
    };
    let lower = if inrange[argmin] {
        Extended::NegInfinity
    } else {
        Extended::Finite(in_range_values().fold(f64::INFINITY, f64::min))
    };
    let upper = if inrange[argmax] {
        Extended::PosInfinity
    } else {
        Extended::Finite(in_range_values().fold(f64::NEG_INFINITY, f64::max))
    };
    Ok((lower, upper, roots))
}

fn argmin_by(values: &[f64], better: impl Fn(f64, f64) -> bool) -> usize {
    let mut best = 0;
    for (index, value) in values.iter().enumerate() {
        if better(*value, values[best]) {
            best = index;
        }
    }
    best
}

/// A point-identified parameter and its gradient with respect to the moment vector.
#[derive(Clone, Debug)]
pub struct ParameterGradient {
    pub value: f64,
    pub gradient: DVector<f64>,
    pub accurate: bool,
}

/// Evaluates a closed-form parameter and differentiates it numerically.
pub fn estimate_parameter<F>(
    name: &str,
    f: F,
    moment_vector: &[f64],
    options: &SolverOptions,
) -> ParameterGradient
where
    F: Fn(&SimplifiedMoments) -> f64,
{
    let value = simplified_or_nan(moment_vector, &f);
    if !value.is_finite() {
        return ParameterGradient {
            value,
            gradient: DVector::zeros(moment_vector.len()),
            accurate: true,
        };
    }
    let (grad, accurate) = gradient(|mv| simplified_or_nan(mv, &f), moment_vector, options);
    if !accurate {
        log::warn!("Inaccurate SE for {name}. Try normalizing variables.");
    }
    ParameterGradient {
        value,
        gradient: DVector::from_vec(grad),
        accurate,
    }
}

/// Gradient of a bound `theta` of the identified set with respect to the moment
/// vector, by the implicit function theorem applied to `lambda(theta; m) = const`.
pub fn bound_gradient(
    theta: Extended,
    moment_vector: &[f64],
    options: &SolverOptions,
) -> (DVector<f64>, bool) {
    let Some(theta) = theta.finite() else {
        return (DVector::zeros(moment_vector.len()), true);
    };
    let Ok(sm) = SimplifiedMoments::from_moment_vector(moment_vector) else {
        return (DVector::zeros(moment_vector.len()), false);
    };
    let mut point = moment_vector.to_vec();
    let ((dtheta, dmoments), accurate) = search_step(options, |h| {
        let (dtheta, mut errmax) = ridders(|t| lambda_of_theta(theta + t, &sm), 0.0, h);
        let mut dmoments = vec![0.0; moment_vector.len()];
        for i in 0..moment_vector.len() {
            let (d, err) = ridders(
                |t| {
                    point[i] = moment_vector[i] + t;
                    let value = simplified_or_nan(&point, |sm| lambda_of_theta(theta, sm));
                    point[i] = moment_vector[i];
                    value
                },
                0.0,
                h,
            );
            errmax = errmax.max(err);
            dmoments[i] = d;
        }
        ((dtheta, dmoments), errmax)
    });
    if !accurate {
        log::warn!("Inaccurate SE for betaxL/H. Try normalizing variables.");
    }
    let grad = DVector::from_iterator(dmoments.len(), dmoments.iter().map(|d| -d / dtheta));
    (grad, accurate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Simplified moments of the Project STAR example (SAT on Small_Class).
    fn star_moments() -> SimplifiedMoments {
        SimplifiedMoments::new(
            5.42538313e+02,
            2.05839484e-01,
            1.07467966e+00,
            4.47643916e+01,
            1.34931719e-03,
            1.10235301e-02,
        )
    }

    fn solve(range: LambdaRange) -> (Extended, Extended) {
        let sm = star_moments();
        let options = SolverOptions::default();
        let segments = ThetaSegments::locate(&sm, &options);
        let (lower, upper, _) = identified_set(&sm, &range, &segments, &options).unwrap();
        (lower, upper)
    }

    #[test]
    fn closed_form_parameters_match_reference() {
        let sm = star_moments();
        assert_relative_eq!(lambda_star(&sm), 12.31059909, epsilon = 1e-5);
        assert_relative_eq!(theta_star(&sm), 8.16970997, epsilon = 1e-5);
        assert_relative_eq!(lambda_zero(&sm), 28.93548917, epsilon = 1e-4);
        assert_relative_eq!(lambda_of_theta(0.0, &sm), lambda_zero(&sm), epsilon = 1e-12);
    }

    #[test]
    fn lambda_is_zero_at_upper_bound_for_default_range() {
        let sm = star_moments();
        let root = (sm.cov_yz - sm.cov_yzhat) / (sm.var_z - sm.var_zhat);
        assert_relative_eq!(lambda_of_theta(root, &sm), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn default_range_reproduces_reference_bounds() {
        let (lower, upper) = solve(LambdaRange::default());
        assert_relative_eq!(lower.finite().unwrap(), 5.13504376, epsilon = 1e-5);
        assert_relative_eq!(upper.finite().unwrap(), 5.20150257, epsilon = 1e-5);
    }

    #[test]
    fn wider_range_relaxes_lower_bound_only() {
        let (lower, upper) = solve(LambdaRange::bounded(0.0, 2.0));
        assert_relative_eq!(lower.finite().unwrap(), 5.065541, epsilon = 1e-4);
        assert_relative_eq!(upper.finite().unwrap(), 5.20150257, epsilon = 1e-5);
    }

    #[test]
    fn degenerate_range_gives_point_identification() {
        let (lower, upper) = solve(LambdaRange::bounded(0.0, 0.0));
        assert_relative_eq!(lower.finite().unwrap(), 5.20150257, epsilon = 1e-5);
        assert_relative_eq!(upper.finite().unwrap(), 5.20150257, epsilon = 1e-5);
    }

    #[test]
    fn range_containing_lambda_star_is_unbounded() {
        let (lower, upper) = solve(LambdaRange::new(Some(0.0), None));
        assert_eq!(lower, Extended::NegInfinity);
        assert_eq!(upper, Extended::PosInfinity);
    }

    #[test]
    fn no_lower_lambda_bound_stops_at_theta_star() {
        let (lower, upper) = solve(LambdaRange::new(None, Some(1.0)));
        assert_relative_eq!(lower.finite().unwrap(), 5.13504376, epsilon = 1e-5);
        assert_relative_eq!(upper.finite().unwrap(), 8.16970997, epsilon = 1e-4);
    }

    #[test]
    fn inverted_range_is_an_identification_error() {
        let sm = star_moments();
        let options = SolverOptions::default();
        let segments = ThetaSegments::locate(&sm, &options);
        let range = LambdaRange {
            lower: Some(2.0),
            upper: Some(1.0),
        };
        let err = identified_set(&sm, &range, &segments, &options).unwrap_err();
        assert!(matches!(err, RcrError::InvertedLambdaRange { .. }));
    }

    /// Moment vector for `w = [1, x1, x2, y, z]` with orthonormal controls that
    /// reduces to [`star_moments`].
    fn star_moment_vector() -> Vec<f64> {
        let sm = star_moments();
        let b1 = sm.var_zhat.sqrt();
        let a1 = sm.cov_yzhat / b1;
        let a2 = (sm.var_yhat - a1 * a1).sqrt();
        vec![
            0.0, 0.0, 0.0, 0.0, 1.0, 0.0, a1, b1, 1.0, a2, 0.0, sm.var_y, sm.cov_yz, sm.var_z,
        ]
    }

    #[test]
    fn bound_gradient_matches_finite_differences_of_resolved_bounds() {
        let mv = star_moment_vector();
        let options = SolverOptions::default();
        let bounds_at = |point: &[f64], range: &LambdaRange| {
            let sm = SimplifiedMoments::from_moment_vector(point).unwrap();
            let segments = ThetaSegments::locate(&sm, &options);
            let (lower, upper, _) = identified_set(&sm, range, &segments, &options).unwrap();
            [lower.finite().unwrap(), upper.finite().unwrap()]
        };
        let h = 1e-5;
        for range in [LambdaRange::bounded(0.0, 1.0), LambdaRange::bounded(0.0, 2.0)] {
            let bounds = bounds_at(mv.as_slice(), &range);
            let analytic = bounds.map(|theta| bound_gradient(Extended::Finite(theta), &mv, &options).0);
            for k in 0..mv.len() {
                let mut up = mv.clone();
                let mut down = mv.clone();
                up[k] += h;
                down[k] -= h;
                let high = bounds_at(up.as_slice(), &range);
                let low = bounds_at(down.as_slice(), &range);
                for side in 0..2 {
                    let numeric = (high[side] - low[side]) / (2.0 * h);
                    assert_relative_eq!(
                        analytic[side][k],
                        numeric,
                        epsilon = 1e-4,
                        max_relative = 1e-4
                    );
                }
            }
        }
    }

    #[test]
    fn extended_values_keep_infinities_until_display() {
        assert_eq!(Extended::from_f64(f64::INFINITY), Some(Extended::PosInfinity));
        assert_eq!(Extended::from_f64(f64::NAN), None);
        assert_eq!(Extended::NegInfinity.value(), f64::NEG_INFINITY);
        assert_eq!(Extended::NegInfinity.display_value(8.0e307), -8.0e307);
        assert_eq!(format!("{:.2}", Extended::Finite(1.234)), "1.23");
    }
}
