//! Queries against a completed estimation: coefficient tables, covariance
//! matrices, sample summaries, Wald tests, nonlinear combinations, and the
//! interval hypothesis test for `betax`.

use std::fmt;
use std::iter::Peekable;
use std::str::FromStr;

use nalgebra::{linalg::Cholesky, DMatrix, DVector};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};

use crate::data::{EstimationSample, WeightKind};
use crate::error::{RcrError, Result};
use crate::estimation::{EstimationResult, Parameter};
use crate::formulation::Formulation;
use crate::identification::{lambda_of_theta, Extended, LambdaCurve};
use crate::inference::{coefficients, correlation, Coefficient};
use crate::interval::{CiMethod, Interval};
use crate::solving::{gradient, SolverOptions};

/// Descriptive statistics of one variable over the estimation sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableSummary {
    pub name: String,
    pub observations: usize,
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

/// Observations per cluster.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub count: usize,
    pub min: usize,
    pub mean: f64,
    pub max: usize,
}

/// Summary of the estimation sample, computed when the model is estimated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleSummary {
    pub variables: Vec<VariableSummary>,
    pub clusters: Option<ClusterSummary>,
}

impl SampleSummary {
    /// Summarizes the outcome, treatment, and controls; weighted when the sample is.
    pub fn from_sample(sample: &EstimationSample, formulation: &Formulation) -> Self {
        let mut columns = vec![
            (formulation.outcome(), sample.outcome.clone()),
            (formulation.treatment(), sample.treatment.clone()),
        ];
        for (j, name) in formulation.controls().iter().enumerate() {
            columns.push((name.as_str(), sample.controls.column(j).into_owned()));
        }
        let v = sample.normalized_weights();
        let variables = columns
            .into_iter()
            .map(|(name, column)| summarize_column(name, &column, sample, &v))
            .collect();

        let clusters = sample.clusters().map(|assignment| {
            let sizes = assignment.sizes();
            ClusterSummary {
                count: assignment.count(),
                min: sizes.iter().copied().min().unwrap_or(0),
                mean: sizes.iter().sum::<usize>() as f64 / sizes.len().max(1) as f64,
                max: sizes.iter().copied().max().unwrap_or(0),
            }
        });
        Self {
            variables,
            clusters,
        }
    }
}

fn summarize_column(
    name: &str,
    column: &DVector<f64>,
    sample: &EstimationSample,
    v: &DVector<f64>,
) -> VariableSummary {
    let n = column.len() as f64;
    let mean = column.dot(v);
    let sq: f64 = column
        .iter()
        .zip(v.iter())
        .map(|(x, vi)| vi * (x - mean).powi(2))
        .sum();
    let variance = match sample.weights() {
        Some((WeightKind::Frequency, w)) => {
            let total: f64 = w.iter().sum();
            sq * total / (total - 1.0)
        }
        _ => sq * n / (n - 1.0),
    };
    VariableSummary {
        name: name.to_string(),
        observations: sample.observations(),
        mean,
        std_dev: variance.sqrt(),
        min: column.min(),
        max: column.max(),
    }
}

impl fmt::Display for SampleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>14} {:>10} {:>12} {:>12} {:>12} {:>12}",
            "Variable", "Obs", "Mean", "Std. Dev.", "Min", "Max"
        )?;
        for row in &self.variables {
            writeln!(
                f,
                "{:>14} {:>10} {:>12.6} {:>12.6} {:>12.6} {:>12.6}",
                row.name, row.observations, row.mean, row.std_dev, row.min, row.max
            )?;
        }
        if let Some(clusters) = &self.clusters {
            writeln!(
                f,
                "{} clusters; observations per cluster: min {}, avg {:.1}, max {}",
                clusters.count, clusters.min, clusters.mean, clusters.max
            )?;
        }
        Ok(())
    }
}

/// Coefficient table for the five parameters plus the `betax` interval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoefficientTable {
    pub rows: Vec<Coefficient>,
    pub betax: Interval,
    pub observations: usize,
    pub clusters: Option<usize>,
}

impl fmt::Display for CoefficientTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RCR model{:>50}", format!("Number of obs = {}", self.observations))?;
        if let Some(clusters) = self.clusters {
            write!(f, "\n{:>59}", format!("Number of clusters = {clusters}"))?;
        }
        writeln!(f)?;
        let ci_header = format!("[{}% Conf. Interval]", self.betax.level);
        writeln!(
            f,
            "{:>10} {:>12} {:>12} {:>8} {:>8} {:>25}",
            "", "Coef.", "Std. Err.", "z", "P>|z|", ci_header
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{:>10} {:>12.6} {:>12.6} {:>8.2} {:>8.3} {:>12.6} {:>12.6}",
                row.name, row.estimate, row.std_error, row.z, row.p_value, row.ci_lower, row.ci_upper
            )?;
        }
        writeln!(
            f,
            "{:>10} {:>56} {:>12.6} {:>12.6}",
            "betax",
            format!("({})", self.betax.method),
            self.betax.lower,
            self.betax.upper
        )
    }
}

/// Result of a Wald test.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaldTest {
    pub statistic: f64,
    pub df: usize,
    pub p_value: f64,
}

impl WaldTest {
    fn from_quadratic_form(diff: &DVector<f64>, covariance: DMatrix<f64>) -> Result<Self> {
        let df = diff.len();
        let cholesky = Cholesky::new(covariance)
            .ok_or_else(|| RcrError::singular("covariance of the restrictions"))?;
        let statistic = diff.dot(&cholesky.solve(diff));
        let distribution = ChiSquared::new(df as f64).map_err(|_| RcrError::NumericalError {
            context: "chi-squared distribution",
        })?;
        Ok(Self {
            statistic,
            df,
            p_value: 1.0 - distribution.cdf(statistic),
        })
    }
}

/// A linear restriction `sum_j c_j b_j = value` on the parameter vector.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearRestriction {
    pub coefficients: [f64; 5],
    pub value: f64,
}

impl LinearRestriction {
    /// An empty restriction `0 = 0`; add terms with [`coefficient`](Self::coefficient).
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `weight` to the coefficient on `parameter`.
    pub fn coefficient(mut self, parameter: Parameter, weight: f64) -> Self {
        self.coefficients[parameter.index()] += weight;
        self
    }

    /// Sets the right-hand side.
    pub fn equals(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    /// Parses `"betaxL = betaxH"`, `"2*lambda0 - betaxInf = 3"`, or `"lambda0"` (`= 0`).
    pub fn parse(expression: &str) -> Result<Self> {
        let mut sides = expression.split('=');
        let lhs = sides.next().unwrap_or_default();
        let rhs = sides.next();
        if sides.next().is_some() {
            return Err(RcrError::invalid_restriction(expression, "more than one `=`"));
        }
        let (left, left_constant) = parse_linear(lhs, expression)?;
        let (right, right_constant) = match rhs {
            Some(rhs) => parse_linear(rhs, expression)?,
            None => ([0.0; 5], 0.0),
        };
        let mut coefficients = [0.0; 5];
        for (c, (l, r)) in coefficients.iter_mut().zip(left.iter().zip(right.iter())) {
            *c = l - r;
        }
        if coefficients.iter().all(|c| *c == 0.0) {
            return Err(RcrError::invalid_restriction(
                expression,
                "no parameter is restricted",
            ));
        }
        Ok(Self {
            coefficients,
            value: right_constant - left_constant,
        })
    }
}

impl FromStr for LinearRestriction {
    type Err = RcrError;

    fn from_str(expression: &str) -> Result<Self> {
        Self::parse(expression)
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Number(f64),
    Name(String),
    Plus,
    Minus,
    Star,
}

fn tokenize(side: &str, expression: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = side.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            c if c.is_ascii_digit() || c == '.' => {
                let text = take_number(&mut chars);
                let value = text.parse::<f64>().map_err(|_| {
                    RcrError::invalid_restriction(expression, format!("bad number `{text}`"))
                })?;
                tokens.push(Token::Number(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(c) = chars.next_if(|c| c.is_alphanumeric() || *c == '_') {
                    name.push(c);
                }
                tokens.push(Token::Name(name));
            }
            other => {
                return Err(RcrError::invalid_restriction(
                    expression,
                    format!("unexpected character `{other}`"),
                ))
            }
        }
    }
    Ok(tokens)
}

fn take_number(chars: &mut Peekable<std::str::Chars<'_>>) -> String {
    let mut text = String::new();
    while let Some(c) = chars.next_if(|c| c.is_ascii_digit() || *c == '.' || *c == 'e' || *c == 'E')
    {
        let exponent = c == 'e' || c == 'E';
        text.push(c);
        if exponent {
            if let Some(sign) = chars.next_if(|c| *c == '+' || *c == '-') {
                text.push(sign);
            }
        }
    }
    text
}

/// Parses `term (+|- term)*` where a term is `number`, `name`, or `number * name`.
fn parse_linear(side: &str, expression: &str) -> Result<([f64; 5], f64)> {
    let mut tokens = tokenize(side, expression)?.into_iter().peekable();
    if tokens.peek().is_none() {
        return Err(RcrError::invalid_restriction(expression, "empty expression"));
    }
    let lookup = |name: &str| {
        name.parse::<Parameter>().map_err(|_| {
            RcrError::invalid_restriction(expression, format!("unknown parameter `{name}`"))
        })
    };

    let mut coefficients = [0.0; 5];
    let mut constant = 0.0;
    let mut sign = 1.0;
    loop {
        while let Some(token) = tokens.next_if(|t| matches!(t, Token::Plus | Token::Minus)) {
            if token == Token::Minus {
                sign = -sign;
            }
        }
        match tokens.next() {
            Some(Token::Number(value)) => {
                if tokens.next_if_eq(&Token::Star).is_some() {
                    match tokens.next() {
                        Some(Token::Name(name)) => {
                            coefficients[lookup(&name)?.index()] += sign * value;
                        }
                        _ => {
                            return Err(RcrError::invalid_restriction(
                                expression,
                                "expected a parameter name after `*`",
                            ))
                        }
                    }
                } else {
                    constant += sign * value;
                }
            }
            Some(Token::Name(name)) => coefficients[lookup(&name)?.index()] += sign,
            _ => {
                return Err(RcrError::invalid_restriction(
                    expression,
                    "expected a number or parameter name",
                ))
            }
        }
        match tokens.next() {
            None => break,
            Some(Token::Plus) => sign = 1.0,
            Some(Token::Minus) => sign = -1.0,
            Some(_) => {
                return Err(RcrError::invalid_restriction(
                    expression,
                    "expected `+` or `-` between terms",
                ))
            }
        }
    }
    Ok((coefficients, constant))
}

/// A scalar function of the parameter vector, for `testnl` and `nlcom`.
pub type ParameterFunction<'a> = &'a dyn Fn(&[f64]) -> f64;

impl EstimationResult {
    /// Coefficient table at the stored confidence level and CI method.
    pub fn table(&self) -> Result<CoefficientTable> {
        let names = self.param_names();
        Ok(CoefficientTable {
            rows: coefficients(&names, self.params(), &self.estimate.covariance, self.level),
            betax: self.betax_ci(self.ci_method, self.level)?,
            observations: self.observations,
            clusters: self.clusters,
        })
    }

    /// Asymptotic covariance matrix of the parameters.
    pub fn variance_matrix(&self) -> &DMatrix<f64> {
        &self.estimate.covariance
    }

    /// Correlation matrix of the parameters; NaN rows for unbounded parameters.
    pub fn correlation_matrix(&self) -> DMatrix<f64> {
        correlation(&self.estimate.covariance)
    }

    /// Descriptive statistics of the estimation sample.
    pub fn summarize(&self) -> &SampleSummary {
        &self.summary
    }

    /// Confidence interval for `betax` by any method at any level.
    pub fn betax_ci(&self, method: CiMethod, level: f64) -> Result<Interval> {
        self.estimate
            .identified_set()
            .confidence_interval(method, level)
    }

    /// p-value for `H0: betax = h0`; exactly 1 when `h0` is in the identified set.
    pub fn test_interval(&self, h0: f64) -> Result<f64> {
        self.estimate.identified_set().test(h0)
    }

    /// Joint Wald test of linear restrictions `R b = r`.
    pub fn test(&self, restrictions: &[LinearRestriction]) -> Result<WaldTest> {
        if restrictions.is_empty() {
            return Err(RcrError::invalid_restriction("", "no restrictions given"));
        }
        let b = self.finite_params_for(restrictions.iter().flat_map(|r| {
            Parameter::ALL
                .into_iter()
                .filter(move |p| r.coefficients[p.index()] != 0.0)
        }))?;
        let q = restrictions.len();
        let r_matrix = DMatrix::from_fn(q, 5, |i, j| restrictions[i].coefficients[j]);
        let r_vector = DVector::from_iterator(q, restrictions.iter().map(|r| r.value));
        let diff = &r_matrix * b - r_vector;
        let covariance = &r_matrix * &self.estimate.covariance * r_matrix.transpose();
        WaldTest::from_quadratic_form(&diff, covariance)
    }

    /// Parses each expression with [`LinearRestriction::parse`] and tests them jointly.
    pub fn test_expressions(&self, expressions: &[&str]) -> Result<WaldTest> {
        let restrictions = expressions
            .iter()
            .map(|expression| LinearRestriction::parse(expression))
            .collect::<Result<Vec<_>>>()?;
        self.test(&restrictions)
    }

    /// Joint Wald test of `g_k(b) = 0` by the delta method.
    pub fn testnl(&self, functions: &[ParameterFunction<'_>]) -> Result<WaldTest> {
        if functions.is_empty() {
            return Err(RcrError::invalid_restriction("", "no restrictions given"));
        }
        let q = functions.len();
        let mut values = DVector::<f64>::zeros(q);
        let mut jacobian = DMatrix::<f64>::zeros(q, 5);
        for (k, function) in functions.iter().enumerate() {
            let (value, grad) = self.evaluate_with_gradient(*function)?;
            values[k] = value;
            jacobian.row_mut(k).copy_from(&grad.transpose());
        }
        let covariance = &jacobian * &self.estimate.covariance * jacobian.transpose();
        WaldTest::from_quadratic_form(&values, covariance)
    }

    /// Estimate and delta-method inference for a nonlinear combination of the parameters.
    pub fn nlcom(&self, name: &str, function: ParameterFunction<'_>) -> Result<Coefficient> {
        let (value, grad) = self.evaluate_with_gradient(function)?;
        let variance = grad.dot(&(&self.estimate.covariance * &grad));
        let estimate = Extended::from_f64(value).ok_or(RcrError::NumericalError {
            context: "nonlinear combination",
        })?;
        Ok(Coefficient::new(name, estimate, variance, self.level))
    }

    /// `lambda(betax)` at the given values. With `add_betax_inf`, `betaxInf` is
    /// inserted (with an undefined `lambda`) when it lies inside their range.
    pub fn lambda_curve(&self, thetas: &[f64], add_betax_inf: bool) -> Result<LambdaCurve> {
        let sm = self.moments.simplified()?;
        let mut theta = thetas.to_vec();
        if add_betax_inf {
            let betax_inf = self.param(Parameter::BetaxInf).value();
            let min = theta.iter().copied().fold(f64::INFINITY, f64::min);
            let max = theta.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            if min <= betax_inf && betax_inf <= max {
                theta.push(betax_inf);
                theta.sort_by(f64::total_cmp);
            }
        }
        let betax_inf = self.param(Parameter::BetaxInf).value();
        let lambda = theta
            .iter()
            .map(|t| {
                if add_betax_inf && *t == betax_inf {
                    f64::NAN
                } else {
                    lambda_of_theta(*t, &sm)
                }
            })
            .collect();
        Ok(LambdaCurve { theta, lambda })
    }

    /// Parameter vector with infinite values replaced by `±big`.
    pub fn export(&self, big: f64) -> [f64; 5] {
        self.estimate.params.map(|p| p.display_value(big))
    }

    fn finite_params_for(&self, used: impl Iterator<Item = Parameter>) -> Result<DVector<f64>> {
        for parameter in used {
            if !self.param(parameter).is_finite() {
                return Err(RcrError::invalid_restriction(
                    parameter.name(),
                    "parameter is unbounded",
                ));
            }
        }
        Ok(DVector::from_iterator(
            5,
            self.params().iter().map(|p| p.finite().unwrap_or(0.0)),
        ))
    }

    /// Value and gradient of `function` at the estimates. Unbounded parameters
    /// are held fixed; their variances are zero.
    fn evaluate_with_gradient(&self, function: ParameterFunction<'_>) -> Result<(f64, DVector<f64>)> {
        let full: Vec<f64> = self.params().iter().map(|p| p.value()).collect();
        let value = function(full.as_slice());
        if !value.is_finite() {
            return Err(RcrError::NumericalError {
                context: "nonlinear function of the parameters",
            });
        }
        let free: Vec<usize> = (0..5).filter(|i| full[*i].is_finite()).collect();
        let start: Vec<f64> = free.iter().map(|i| full[*i]).collect();
        let (partials, accurate) = gradient(
            |x: &[f64]| {
                let mut point = full.clone();
                for (slot, value) in free.iter().zip(x) {
                    point[*slot] = *value;
                }
                function(point.as_slice())
            },
            &start,
            &SolverOptions::default(),
        );
        if !accurate {
            log::warn!("Inaccurate derivative of a nonlinear combination");
        }
        let mut grad = DVector::<f64>::zeros(5);
        for (slot, d) in free.iter().zip(partials) {
            grad[*slot] = d;
        }
        Ok((value, grad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn parses_equality_between_parameters() {
        let r = LinearRestriction::parse("betaxL = betaxH").unwrap();
        assert_eq!(r.coefficients, [0.0, 0.0, 0.0, 1.0, -1.0]);
        assert_eq!(r.value, 0.0);
    }

    #[test]
    fn parses_scaled_terms_and_constants() {
        let r: LinearRestriction = "2*lambda0 - betaxInf + 1 = 3".parse().unwrap();
        assert_eq!(r.coefficients, [0.0, -1.0, 2.0, 0.0, 0.0]);
        assert_relative_eq!(r.value, 2.0);

        let r = LinearRestriction::parse("-lambda0").unwrap();
        assert_eq!(r.coefficients, [0.0, 0.0, -1.0, 0.0, 0.0]);

        let r = LinearRestriction::parse("1.5e-1*lambdaInf = 0").unwrap();
        assert_relative_eq!(r.coefficients[0], 0.15);
    }

    #[test]
    fn builder_matches_parser() {
        let built = LinearRestriction::new()
            .coefficient(Parameter::BetaxL, 1.0)
            .coefficient(Parameter::BetaxH, -1.0)
            .equals(0.0);
        assert_eq!(built, LinearRestriction::parse("betaxL - betaxH").unwrap());
    }

    #[test]
    fn rejects_malformed_restrictions() {
        for expression in ["", "betax = 1", "lambda0 = = 1", "3 = 3", "lambda0 * 2", "lambda0 +"] {
            let err = LinearRestriction::parse(expression).unwrap_err();
            assert!(
                matches!(err, RcrError::InvalidRestriction { .. }),
                "{expression}: {err}"
            );
        }
    }
}
