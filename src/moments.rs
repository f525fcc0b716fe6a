//! Sample moments of `W = [1 X Y Z]` and their sampling covariance.
//!
//! The RCR estimator depends on the data only through the moment vector: the
//! upper triangle (row by row) of the sample average of `w w'`, without the
//! leading constant `E[1] = 1`. Every parameter is a smooth function of that
//! vector, so its covariance is all the delta method needs.

use nalgebra::{linalg::Cholesky, DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::data::{EstimationSample, WeightKind};
use crate::error::{RcrError, Result};

/// The moment vector of an estimation sample together with its covariance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MomentSet {
    vector: DVector<f64>,
    covariance: DMatrix<f64>,
}

impl MomentSet {
    /// Computes moments and their covariance from an estimation sample.
    pub fn from_sample(sample: &EstimationSample) -> Result<Self> {
        let n = sample.row_count();
        let columns = sample.controls.ncols() + 3;
        if sample.observations() <= columns || n < 2 {
            return Err(RcrError::InsufficientObservations {
                observations: sample.observations(),
                parameters: columns,
            });
        }

        let m = moment_count(columns);
        let mut rows = DMatrix::zeros(n, m);
        for i in 0..n {
            let products = upper_products(&sample.design_row(i));
            rows.row_mut(i).copy_from(&products.transpose());
        }

        let v = sample.normalized_weights();
        let vector = rows.tr_mul(&v);
        let mean = vector.transpose();
        let mut resid = rows;
        for mut row in resid.row_iter_mut() {
            row -= &mean;
        }

        let covariance = match (sample.clusters(), sample.weights()) {
            (Some(clusters), _) => {
                if clusters.count() < 2 {
                    return Err(RcrError::TooFewClusters {
                        clusters: clusters.count(),
                    });
                }
                let g = clusters.count();
                let mut sums = DMatrix::zeros(g, m);
                for (i, cluster) in clusters.index.iter().enumerate() {
                    let mut target = sums.row_mut(*cluster);
                    target += resid.row(i) * v[i];
                }
                sums.tr_mul(&sums) * (g as f64 / (g as f64 - 1.0))
            }
            (None, None) => {
                let nf = n as f64;
                resid.tr_mul(&resid) / ((nf - 1.0) * nf)
            }
            (None, Some((WeightKind::Frequency, w))) => {
                let total: f64 = w.iter().sum();
                weighted_cross_product(&resid, w) / ((total - 1.0) * total)
            }
            (None, Some((_, w))) => {
                let v1: f64 = w.iter().sum();
                let v2: f64 = w.iter().map(|wi| wi * wi).sum();
                let fac: f64 = v.iter().map(|vi| vi * vi).sum();
                weighted_cross_product(&resid, w) * (fac / (v1 - v2 / v1))
            }
        };

        log::debug!("moment vector of length {m} built from {n} rows");
        Ok(Self { vector, covariance })
    }

    /// Creates a moment set from precomputed parts.
    pub fn from_parts(vector: DVector<f64>, covariance: DMatrix<f64>) -> Result<Self> {
        dimension_from_moment_count(vector.len())?;
        if covariance.nrows() != vector.len() || covariance.ncols() != vector.len() {
            return Err(RcrError::dimension_mismatch(
                "moment covariance",
                vector.len(),
                covariance.nrows(),
            ));
        }
        Ok(Self { vector, covariance })
    }

    /// The moment vector.
    pub fn vector(&self) -> &DVector<f64> {
        &self.vector
    }

    /// Sampling covariance of the moment vector.
    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    /// The six moments the RCR formulas use.
    pub fn simplified(&self) -> Result<SimplifiedMoments> {
        SimplifiedMoments::from_moment_vector(self.vector.as_slice())
    }
}

fn weighted_cross_product(resid: &DMatrix<f64>, w: &DVector<f64>) -> DMatrix<f64> {
    let mut scaled = resid.clone();
    for (mut row, wi) in scaled.row_iter_mut().zip(w.iter()) {
        row *= *wi;
    }
    scaled.tr_mul(resid)
}

fn moment_count(columns: usize) -> usize {
    columns * (columns + 1) / 2 - 1
}

fn dimension_from_moment_count(m: usize) -> Result<usize> {
    let k = (((9 + 8 * m) as f64).sqrt() - 1.0) / 2.0;
    let k = k.round() as usize;
    if k < 4 || moment_count(k) != m {
        return Err(RcrError::dimension_mismatch(
            "moment vector length",
            moment_count(k.max(4)),
            m,
        ));
    }
    Ok(k)
}

/// Upper triangle of `w w'`, row by row, without the leading `1 * 1` element.
fn upper_products(w: &DVector<f64>) -> DVector<f64> {
    let k = w.len();
    let mut out = Vec::with_capacity(moment_count(k));
    for i in 0..k {
        for j in i..k {
            if i == 0 && j == 0 {
                continue;
            }
            out.push(w[i] * w[j]);
        }
    }
    DVector::from_vec(out)
}

/// Full matrix `E[w w']` from a moment vector.
fn second_moment_matrix(mv: &[f64], k: usize) -> DMatrix<f64> {
    let mut xtmp = DMatrix::zeros(k, k);
    let mut h = 0usize;
    for i in 0..k {
        for j in i..k {
            let value = if h == 0 { 1.0 } else { mv[h - 1] };
            xtmp[(i, j)] = value;
            xtmp[(j, i)] = value;
            h += 1;
        }
    }
    xtmp
}

/// Variances and covariances of the outcome `y`, the treatment `z`, and their
/// linear projections `yhat`, `zhat` on the controls.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimplifiedMoments {
    pub var_y: f64,
    pub var_z: f64,
    pub cov_yz: f64,
    pub var_yhat: f64,
    pub var_zhat: f64,
    pub cov_yzhat: f64,
}

impl SimplifiedMoments {
    /// Creates simplified moments directly.
    pub fn new(
        var_y: f64,
        var_z: f64,
        cov_yz: f64,
        var_yhat: f64,
        var_zhat: f64,
        cov_yzhat: f64,
    ) -> Self {
        Self {
            var_y,
            var_z,
            cov_yz,
            var_yhat,
            var_zhat,
            cov_yzhat,
        }
    }

    /// Reduces a moment vector to the six simplified moments.
    ///
    /// When the controls' second-moment matrix is singular the projection
    /// moments are NaN; [`check`](Self::check) reports that case.
    pub fn from_moment_vector(mv: &[f64]) -> Result<Self> {
        let k = dimension_from_moment_count(mv.len())?;
        let m = mv.len();
        let xtmp = second_moment_matrix(mv, k);
        let ey = mv[k - 3];
        let ez = mv[k - 2];

        let var_y = mv[m - 3] - ey * ey;
        let var_z = mv[m - 1] - ez * ez;
        let cov_yz = mv[m - 2] - ez * ey;

        let p = k - 2;
        let xx = xtmp.view((0, 0), (p, p)).into_owned();
        let xy = xtmp.view((p, 0), (1, p)).transpose();
        let xz = xtmp.view((p + 1, 0), (1, p)).transpose();

        let (mut var_yhat, mut var_zhat, mut cov_yzhat) = (f64::NAN, f64::NAN, f64::NAN);
        if let Some(chol) = Cholesky::new(xx) {
            let inv_xy = chol.solve(&xy);
            let inv_xz = chol.solve(&xz);
            var_yhat = xy.dot(&inv_xy) - ey * ey;
            var_zhat = xz.dot(&inv_xz) - ez * ez;
            cov_yzhat = xy.dot(&inv_xz) - ez * ey;
        }

        // With a single control yhat and zhat are perfectly correlated; rounding
        // can push the correlation past one.
        if k == 4 {
            cov_yzhat = cov_yzhat.signum() * (var_yhat * var_zhat).sqrt();
        }

        Ok(Self {
            var_y,
            var_z,
            cov_yz,
            var_yhat,
            var_zhat,
            cov_yzhat,
        })
    }

    /// Checks that the moments describe a valid covariance structure and
    /// identify the RCR model.
    ///
    /// An exact `var(zhat) = 0` is rejected as not identified instead of
    /// yielding an infinite `lambdaInf` and an undefined `betaxInf`.
    pub fn check(&self) -> Result<()> {
        let all = [
            self.var_y,
            self.var_z,
            self.cov_yz,
            self.var_yhat,
            self.var_zhat,
            self.cov_yzhat,
        ];
        if !all.iter().all(|value| value.is_finite()) {
            if all[..3].iter().all(|value| value.is_finite()) && all[3..].iter().any(|v| v.is_nan())
            {
                return Err(RcrError::singular("X'X of the controls"));
            }
            return Err(RcrError::NumericalError {
                context: "moment simplification",
            });
        }
        for (name, value) in [
            ("var(y)", self.var_y),
            ("var(z)", self.var_z),
            ("var(yhat)", self.var_yhat),
            ("var(zhat)", self.var_zhat),
        ] {
            if value < 0.0 {
                return Err(RcrError::invalid_moments(format!("{name} = {value} < 0")));
            }
        }
        let sd_yz = (self.var_y * self.var_z).sqrt();
        if self.cov_yz.abs() > sd_yz {
            return Err(RcrError::invalid_moments(format!(
                "|cov(y,z)| = {} > {sd_yz} = sqrt(var(y)*var(z))",
                self.cov_yz.abs()
            )));
        }
        let sd_yzhat = (self.var_yhat * self.var_zhat).sqrt();
        if self.cov_yzhat.abs() > sd_yzhat {
            return Err(RcrError::invalid_moments(format!(
                "|cov(yhat,zhat)| = {} > {sd_yzhat} = sqrt(var(yhat)*var(zhat))",
                self.cov_yzhat.abs()
            )));
        }
        if self.var_z > 0.0 && self.var_z - self.var_zhat <= 1e-12 * self.var_z {
            return Err(RcrError::invalid_moments(
                "treatment is collinear with the controls",
            ));
        }

        if self.var_y == 0.0 {
            return Err(RcrError::not_identified("var(y) = 0"));
        }
        if self.var_z == 0.0 {
            return Err(RcrError::not_identified("var(z) = 0"));
        }
        if self.var_yhat == 0.0 {
            return Err(RcrError::not_identified("var(yhat) = 0"));
        }
        if self.var_zhat == 0.0 {
            return Err(RcrError::not_identified(
                "var(zhat) = 0, the controls are uncorrelated with the treatment",
            ));
        }
        if self.var_yhat == self.var_y {
            return Err(RcrError::not_identified(
                "y is an exact linear function of X",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Dataset, Weights};
    use crate::error::ErrorKind;
    use crate::formulation::Formulation;
    use approx::assert_relative_eq;

    #[test]
    fn simplifies_unit_moment_vector() {
        // E[x]=E[y]=E[z]=0, unit variances, all pairwise covariances 0.5.
        let mv = [0.0, 0.0, 0.0, 1.0, 0.5, 0.5, 1.0, 0.5, 1.0];
        let sm = SimplifiedMoments::from_moment_vector(&mv).unwrap();
        assert_relative_eq!(sm.var_y, 1.0);
        assert_relative_eq!(sm.var_z, 1.0);
        assert_relative_eq!(sm.cov_yz, 0.5);
        assert_relative_eq!(sm.var_yhat, 0.25);
        assert_relative_eq!(sm.var_zhat, 0.25);
        assert_relative_eq!(sm.cov_yzhat, 0.25);
        assert!(sm.check().is_ok());
    }

    #[test]
    fn controls_uncorrelated_with_treatment_are_not_identified() {
        let mv = [0.0, 0.0, 0.0, 1.0, 0.5, 0.0, 1.0, 0.5, 1.0];
        let sm = SimplifiedMoments::from_moment_vector(&mv).unwrap();
        assert_eq!(sm.var_zhat, 0.0);
        let err = sm.check().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Identification);
    }

    #[test]
    fn rejects_moment_vectors_of_impossible_length() {
        assert!(SimplifiedMoments::from_moment_vector(&[0.0; 10]).is_err());
    }

    #[test]
    fn moment_vector_matches_sample_averages() {
        let data = Dataset::builder()
            .column("y", vec![1.0, 2.0, 4.0, 3.0, 0.0, 5.0])
            .column("z", vec![0.0, 1.0, 1.0, 0.0, 1.0, 0.0])
            .column("x", vec![2.0, 1.0, 3.0, 5.0, 4.0, 0.0])
            .build()
            .unwrap();
        let f = Formulation::parse("y z x").unwrap();
        let sample = EstimationSample::select(&data, &f, None, None, None).unwrap();
        let moments = MomentSet::from_sample(&sample).unwrap();

        // Order: E[x], E[y], E[z], E[xx], E[xy], E[xz], E[yy], E[yz], E[zz].
        let mv = moments.vector();
        assert_eq!(mv.len(), 9);
        assert_relative_eq!(mv[0], 2.5, epsilon = 1e-12);
        assert_relative_eq!(mv[1], 2.5, epsilon = 1e-12);
        assert_relative_eq!(mv[2], 0.5, epsilon = 1e-12);
        assert_relative_eq!(mv[3], 55.0 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(mv[8], 0.5, epsilon = 1e-12);

        // Unweighted covariance is the sample covariance over n.
        let var_z_products: f64 = 0.25 * 6.0 / 5.0;
        assert_relative_eq!(moments.covariance()[(2, 2)], var_z_products / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn unit_analytic_weights_match_unweighted_covariance() {
        let values = [1.0, 2.0, 4.0, 3.0, 0.0, 5.0, 2.5];
        let data = Dataset::builder()
            .column("y", values.to_vec())
            .column("z", vec![0.0, 1.0, 1.0, 0.0, 1.0, 0.0, 1.0])
            .column("x", vec![2.0, 1.0, 3.0, 5.0, 4.0, 0.0, 1.0])
            .column("w", vec![1.0; 7])
            .build()
            .unwrap();
        let f = Formulation::parse("y z x").unwrap();
        let plain = EstimationSample::select(&data, &f, None, None, None).unwrap();
        let weights = Weights::new(WeightKind::Analytic, "w");
        let weighted = EstimationSample::select(&data, &f, None, Some(&weights), None).unwrap();

        let a = MomentSet::from_sample(&plain).unwrap();
        let b = MomentSet::from_sample(&weighted).unwrap();
        assert_relative_eq!(a.vector(), b.vector(), epsilon = 1e-12);
        assert_relative_eq!(a.covariance(), b.covariance(), epsilon = 1e-12);
    }

    #[test]
    fn single_cluster_is_rejected() {
        let data = Dataset::builder()
            .column("y", vec![1.0, 2.0, 4.0, 3.0, 0.0, 5.0])
            .column("z", vec![0.0, 1.0, 1.0, 0.0, 1.0, 0.0])
            .column("x", vec![2.0, 1.0, 3.0, 5.0, 4.0, 0.0])
            .column("g", vec![7.0; 6])
            .build()
            .unwrap();
        let f = Formulation::parse("y z x").unwrap();
        let sample = EstimationSample::select(&data, &f, None, None, Some("g")).unwrap();
        let err = MomentSet::from_sample(&sample).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Clustering);
    }

    #[test]
    fn too_few_rows_is_a_data_error() {
        let data = Dataset::builder()
            .column("y", vec![1.0, 2.0, 4.0])
            .column("z", vec![0.0, 1.0, 1.0])
            .column("x", vec![2.0, 1.0, 3.0])
            .build()
            .unwrap();
        let f = Formulation::parse("y z x").unwrap();
        let sample = EstimationSample::select(&data, &f, None, None, None).unwrap();
        let err = MomentSet::from_sample(&sample).unwrap_err();
        assert!(matches!(err, RcrError::InsufficientObservations { .. }));
    }
}
