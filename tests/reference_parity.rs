use approx::assert_relative_eq;
use nalgebra::{DMatrix, DVector};
use rcrs::estimation::{Parameter, RcrEstimate};
use rcrs::identification::Extended;
use rcrs::interval::CiMethod;
use rcrs::moments::{MomentSet, SimplifiedMoments};
use rcrs::options::EstimationOptions;
use rcrs::ErrorKind;

const VAR_Y: f64 = 5.42538313e+02;
const VAR_Z: f64 = 2.05839484e-01;
const COV_YZ: f64 = 1.07467966e+00;
const VAR_YHAT: f64 = 4.47643916e+01;
const VAR_ZHAT: f64 = 1.34931719e-03;
const COV_YZHAT: f64 = 1.10235301e-02;

/// A moment vector for `w = [1, x1, x2, y, z]` with orthonormal controls whose
/// simplified moments equal those of the Project STAR example.
fn star_moment_vector() -> DVector<f64> {
    let b1 = VAR_ZHAT.sqrt();
    let a1 = COV_YZHAT / b1;
    let a2 = (VAR_YHAT - a1 * a1).sqrt();
    DVector::from_vec(vec![
        // E[x1], E[x2], E[y], E[z]
        0.0, 0.0, 0.0, 0.0, //
        // E[x1 x1], E[x1 x2], E[x1 y], E[x1 z]
        1.0, 0.0, a1, b1, //
        // E[x2 x2], E[x2 y], E[x2 z]
        1.0, a2, 0.0, //
        // E[y y], E[y z]
        VAR_Y, COV_YZ, //
        // E[z z]
        VAR_Z,
    ])
}

fn star_moments() -> MomentSet {
    let mv = star_moment_vector();
    let m = mv.len();
    MomentSet::from_parts(mv, DMatrix::identity(m, m) * 1e-4).unwrap()
}

fn estimate(options: &EstimationOptions) -> RcrEstimate {
    RcrEstimate::from_moments(&star_moments(), options).unwrap()
}

#[test]
fn constructed_moments_simplify_to_star_values() {
    let sm = star_moments().simplified().unwrap();
    let expected = SimplifiedMoments::new(VAR_Y, VAR_Z, COV_YZ, VAR_YHAT, VAR_ZHAT, COV_YZHAT);
    assert_relative_eq!(sm.var_y, expected.var_y, max_relative = 1e-12);
    assert_relative_eq!(sm.var_yhat, expected.var_yhat, max_relative = 1e-12);
    assert_relative_eq!(sm.var_zhat, expected.var_zhat, max_relative = 1e-12);
    assert_relative_eq!(sm.cov_yzhat, expected.cov_yzhat, max_relative = 1e-12);
}

/// Values reported for `rcr SAT Small_Class White_Asian Girl ...` with the default lambda range.
#[test]
fn default_range_matches_published_estimates() {
    let fit = estimate(&EstimationOptions::default());
    assert_relative_eq!(fit.param(Parameter::LambdaInf).value(), 12.31059909, epsilon = 1e-5);
    assert_relative_eq!(fit.param(Parameter::BetaxInf).value(), 8.16970997, epsilon = 1e-5);
    assert_relative_eq!(fit.param(Parameter::Lambda0).value(), 28.93548917, epsilon = 1e-4);
    assert_relative_eq!(fit.param(Parameter::BetaxL).value(), 5.13504376, epsilon = 1e-5);
    assert_relative_eq!(fit.param(Parameter::BetaxH).value(), 5.20150257, epsilon = 1e-5);
    assert_eq!(fit.covariance.shape(), (5, 5));
    for i in 0..5 {
        assert!(fit.covariance[(i, i)] >= 0.0);
        for j in 0..5 {
            assert_relative_eq!(fit.covariance[(i, j)], fit.covariance[(j, i)], epsilon = 1e-12);
        }
    }
    assert!(fit.solver.roots >= 1);
    assert_eq!(fit.curve.theta.len(), fit.solver.grid_points);
}

#[test]
fn alternative_ranges_match_published_estimates() {
    let wide = estimate(&EstimationOptions::default().with_lambda(Some(0.0), Some(2.0)));
    assert_relative_eq!(wide.param(Parameter::BetaxL).value(), 5.065541, epsilon = 1e-4);

    let point = estimate(&EstimationOptions::default().with_lambda(Some(0.0), Some(0.0)));
    assert_relative_eq!(point.param(Parameter::BetaxL).value(), 5.20150257, epsilon = 1e-5);
    assert_relative_eq!(point.param(Parameter::BetaxH).value(), 5.20150257, epsilon = 1e-5);

    let open_below = estimate(&EstimationOptions::default().with_lambda(None, Some(1.0)));
    assert_relative_eq!(open_below.param(Parameter::BetaxL).value(), 5.13504376, epsilon = 1e-5);
    assert_relative_eq!(open_below.param(Parameter::BetaxH).value(), 8.16970997, epsilon = 1e-4);
}

#[test]
fn unbounded_range_gives_infinite_bounds_with_zero_variance() {
    let fit = estimate(&EstimationOptions::default().with_lambda(Some(0.0), None));
    assert_eq!(fit.param(Parameter::BetaxL), Extended::NegInfinity);
    assert_eq!(fit.param(Parameter::BetaxH), Extended::PosInfinity);
    for i in 0..5 {
        assert_eq!(fit.covariance[(3, i)], 0.0);
        assert_eq!(fit.covariance[(4, i)], 0.0);
    }
    assert!(fit.param(Parameter::LambdaInf).is_finite());
}

#[test]
fn variance_adjustment_scales_covariance_exactly() {
    let base = estimate(&EstimationOptions::default());
    let scaled = estimate(&EstimationOptions::default().with_vce_adjustment(3.0));
    assert_relative_eq!(scaled.covariance, base.covariance * 3.0, max_relative = 1e-12);
    assert_eq!(scaled.params, base.params);
}

#[test]
fn inverted_range_is_rejected() {
    let err = RcrEstimate::from_moments(
        &star_moments(),
        &EstimationOptions::default().with_lambda(Some(1.0), Some(0.0)),
    )
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Identification);
}

#[test]
fn delta_method_standard_errors_match_closed_form_derivatives() {
    // Sampling noise only in E[x1 y] and E[z z].
    let mut sigma = DMatrix::<f64>::zeros(14, 14);
    sigma[(6, 6)] = 4.0e-4;
    sigma[(13, 13)] = 9.0e-4;
    let moments = MomentSet::from_parts(star_moment_vector(), sigma).unwrap();
    let options = EstimationOptions::default().with_vce_adjustment(2.0);
    let fit = RcrEstimate::from_moments(&moments, &options).unwrap();

    // betaxInf = E[x1 y] / E[x1 z] here, so its derivative in E[x1 y] is 1/sqrt(var(zhat)).
    let se_betax_inf = (2.0 * 4.0e-4 / VAR_ZHAT).sqrt();
    // lambdaInf = sqrt(var(z)/var(zhat) - 1) depends on E[z z] only through var(z).
    let lambda_inf = fit.param(Parameter::LambdaInf).value();
    let se_lambda_inf = (2.0 * 9.0e-4f64).sqrt() / (2.0 * lambda_inf * VAR_ZHAT);

    assert_relative_eq!(fit.std_error(Parameter::BetaxInf), se_betax_inf, max_relative = 1e-6);
    assert_relative_eq!(fit.std_error(Parameter::LambdaInf), se_lambda_inf, max_relative = 1e-6);
    assert_relative_eq!(fit.covariance[(0, 1)], 0.0, epsilon = 1e-12);
}

#[test]
fn conservative_interval_widens_with_the_lambda_range() {
    let intervals: Vec<_> = [Some(1.0), Some(2.0), None]
        .into_iter()
        .map(|upper| {
            estimate(&EstimationOptions::default().with_lambda(Some(0.0), upper))
                .identified_set()
                .confidence_interval(CiMethod::Conservative, 95.0)
                .unwrap()
        })
        .collect();
    for pair in intervals.windows(2) {
        assert!(pair[1].lower.value() <= pair[0].lower.value());
        assert!(pair[1].upper.value() >= pair[0].upper.value());
    }
    assert!(intervals[1].lower.is_finite());
    assert_eq!(intervals[2].lower, Extended::NegInfinity);
    assert_eq!(intervals[2].upper, Extended::PosInfinity);
}

#[test]
fn zero_covariance_of_fitted_values_leaves_lambda0_undefined() {
    let b1 = VAR_ZHAT.sqrt();
    let a2 = VAR_YHAT.sqrt();
    let mv = DVector::from_vec(vec![
        0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, b1, 1.0, a2, 0.0, VAR_Y, COV_YZ, VAR_Z,
    ]);
    let moments = MomentSet::from_parts(mv, DMatrix::identity(14, 14) * 1e-4).unwrap();
    assert_eq!(moments.simplified().unwrap().cov_yzhat, 0.0);
    let err = RcrEstimate::from_moments(&moments, &EstimationOptions::default()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Identification);
}
