//! Column-oriented datasets and the resolution of an estimation sample.

use std::collections::{BTreeMap, HashSet};

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::error::{RcrError, Result};
use crate::formulation::Formulation;

/// A set of equally long, named numeric columns.
///
/// Missing values are represented by NaN; rows with a missing value in any
/// variable used by a model are excluded from that model's estimation sample.
#[derive(Clone, Debug)]
pub struct Dataset {
    names: Vec<String>,
    columns: Vec<DVector<f64>>,
    rows: usize,
}

impl Dataset {
    /// Starts building a dataset.
    pub fn builder() -> DatasetBuilder {
        DatasetBuilder::new()
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.rows
    }

    /// Column names in insertion order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Returns a read-only view of the named column.
    pub fn column(&self, name: &str) -> Result<&DVector<f64>> {
        self.names
            .iter()
            .position(|candidate| candidate == name)
            .map(|index| &self.columns[index])
            .ok_or_else(|| RcrError::UnknownVariable {
                name: name.to_string(),
            })
    }

    /// Builds a row mask from a predicate on one column, e.g. to restrict the sample.
    ///
    /// Rows where the column is missing never satisfy the predicate.
    pub fn mask_where<P>(&self, name: &str, predicate: P) -> Result<Vec<bool>>
    where
        P: Fn(f64) -> bool,
    {
        let column = self.column(name)?;
        Ok(column
            .iter()
            .map(|value| !value.is_nan() && predicate(*value))
            .collect())
    }
}

/// Builder that validates column lengths and names before constructing a [`Dataset`].
#[derive(Debug, Default)]
pub struct DatasetBuilder {
    columns: Vec<(String, DVector<f64>)>,
}

impl DatasetBuilder {
    /// Starts an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a named column.
    pub fn column<S: Into<String>>(mut self, name: S, values: impl Into<Vec<f64>>) -> Self {
        self.columns
            .push((name.into(), DVector::from_vec(values.into())));
        self
    }

    /// Finalizes construction after validating shapes and names.
    pub fn build(self) -> Result<Dataset> {
        let rows = self.columns.first().map_or(0, |(_, values)| values.len());
        let mut seen = HashSet::new();
        let mut names = Vec::with_capacity(self.columns.len());
        let mut columns = Vec::with_capacity(self.columns.len());
        for (name, values) in self.columns {
            if !seen.insert(name.clone()) {
                return Err(RcrError::DuplicateVariable { name });
            }
            if values.len() != rows {
                return Err(RcrError::dimension_mismatch(
                    "column length",
                    rows,
                    values.len(),
                ));
            }
            names.push(name);
            columns.push(values);
        }
        Ok(Dataset {
            names,
            columns,
            rows,
        })
    }
}

/// The four conventional kinds of observation weights.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeightKind {
    /// Each row stands for `w` identical observations; `w` must be a whole number.
    Frequency,
    /// Weights inversely proportional to the variance of each observation.
    Analytic,
    /// Sampling weights (inverse selection probabilities).
    Probability,
    /// Weights with no statistical interpretation.
    Importance,
}

impl WeightKind {
    /// Short Stata-style label (`fweight`, `aweight`, `pweight`, `iweight`).
    pub fn label(self) -> &'static str {
        match self {
            Self::Frequency => "fweight",
            Self::Analytic => "aweight",
            Self::Probability => "pweight",
            Self::Importance => "iweight",
        }
    }
}

/// Weight specification: a kind plus the column holding the weights.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weights {
    pub kind: WeightKind,
    pub variable: String,
}

impl Weights {
    /// Creates a weight specification.
    pub fn new<S: Into<String>>(kind: WeightKind, variable: S) -> Self {
        Self {
            kind,
            variable: variable.into(),
        }
    }
}

/// Assignment of sample rows to clusters.
#[derive(Clone, Debug)]
pub struct ClusterAssignment {
    /// Cluster index (0-based, in order of first appearance) for each sample row.
    pub(crate) index: Vec<usize>,
    /// Number of distinct clusters.
    pub(crate) count: usize,
}

impl ClusterAssignment {
    fn from_keys(keys: &[f64]) -> Self {
        let mut lookup = BTreeMap::new();
        let index = keys
            .iter()
            .map(|key| {
                // -0.0 and 0.0 identify the same cluster.
                let bits = if *key == 0.0 { 0u64 } else { key.to_bits() };
                let next = lookup.len();
                *lookup.entry(bits).or_insert(next)
            })
            .collect();
        Self {
            index,
            count: lookup.len(),
        }
    }

    /// Number of distinct clusters.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of sample rows in each cluster.
    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes = vec![0usize; self.count];
        for cluster in &self.index {
            sizes[*cluster] += 1;
        }
        sizes
    }
}

/// The rows and columns that enter one estimation.
#[derive(Clone, Debug)]
pub struct EstimationSample {
    pub(crate) outcome: DVector<f64>,
    pub(crate) treatment: DVector<f64>,
    pub(crate) controls: DMatrix<f64>,
    pub(crate) weights: Option<(WeightKind, DVector<f64>)>,
    pub(crate) clusters: Option<ClusterAssignment>,
    pub(crate) mask: Vec<bool>,
    pub(crate) observations: usize,
}

impl EstimationSample {
    /// Selects the estimation sample for `formulation` from `data`.
    ///
    /// A row is kept when it passes `filter`, has finite values for every model,
    /// weight, and cluster variable, and has a positive weight.
    pub fn select(
        data: &Dataset,
        formulation: &Formulation,
        filter: Option<&[bool]>,
        weights: Option<&Weights>,
        cluster: Option<&str>,
    ) -> Result<Self> {
        let n = data.row_count();
        if let Some(filter) = filter {
            if filter.len() != n {
                return Err(RcrError::dimension_mismatch("sample filter", n, filter.len()));
            }
        }

        let outcome = data.column(formulation.outcome())?;
        let treatment = data.column(formulation.treatment())?;
        let controls = formulation
            .controls()
            .iter()
            .map(|name| data.column(name))
            .collect::<Result<Vec<_>>>()?;
        let weight_column = weights.map(|w| data.column(&w.variable)).transpose()?;
        let cluster_column = cluster.map(|name| data.column(name)).transpose()?;

        if let (Some(spec), Some(column)) = (weights, weight_column) {
            validate_weights(spec.kind, column, filter)?;
        }

        let mut mask = vec![false; n];
        let mut rows = Vec::with_capacity(n);
        for (row, keep) in mask.iter_mut().enumerate() {
            if filter.is_some_and(|filter| !filter[row]) {
                continue;
            }
            let finite = outcome[row].is_finite()
                && treatment[row].is_finite()
                && controls.iter().all(|column| column[row].is_finite())
                && cluster_column.map_or(true, |column| column[row].is_finite())
                && weight_column.map_or(true, |column| column[row].is_finite());
            if !finite {
                continue;
            }
            if weight_column.is_some_and(|column| column[row] == 0.0) {
                continue;
            }
            *keep = true;
            rows.push(row);
        }

        let k = formulation.controls().len();
        let sample_outcome = DVector::from_iterator(rows.len(), rows.iter().map(|&r| outcome[r]));
        let sample_treatment =
            DVector::from_iterator(rows.len(), rows.iter().map(|&r| treatment[r]));
        let sample_controls =
            DMatrix::from_fn(rows.len(), k, |i, j| controls[j][rows[i]]);
        let sample_weights = weights.zip(weight_column).map(|(spec, column)| {
            (
                spec.kind,
                DVector::from_iterator(rows.len(), rows.iter().map(|&r| column[r])),
            )
        });
        let clusters = cluster_column.map(|column| {
            let keys: Vec<f64> = rows.iter().map(|&r| column[r]).collect();
            ClusterAssignment::from_keys(&keys)
        });

        let observations = match &sample_weights {
            Some((WeightKind::Frequency, w)) => w.iter().sum::<f64>().round() as usize,
            _ => rows.len(),
        };

        log::debug!(
            "estimation sample: {} of {} rows kept, N = {}",
            rows.len(),
            n,
            observations
        );

        Ok(Self {
            outcome: sample_outcome,
            treatment: sample_treatment,
            controls: sample_controls,
            weights: sample_weights,
            clusters,
            mask,
            observations,
        })
    }

    /// Number of observations (sum of weights under frequency weighting).
    pub fn observations(&self) -> usize {
        self.observations
    }

    /// Number of data rows in the sample.
    pub fn row_count(&self) -> usize {
        self.outcome.len()
    }

    /// Row mask over the original dataset (`true` = in the estimation sample).
    pub fn mask(&self) -> &[bool] {
        &self.mask
    }

    /// Cluster assignment, if a cluster variable was requested.
    pub fn clusters(&self) -> Option<&ClusterAssignment> {
        self.clusters.as_ref()
    }

    /// Raw weights and their kind, if weights were requested.
    pub fn weights(&self) -> Option<(WeightKind, &DVector<f64>)> {
        self.weights.as_ref().map(|(kind, w)| (*kind, w))
    }

    /// Weights rescaled to sum to one; uniform when the sample is unweighted.
    pub fn normalized_weights(&self) -> DVector<f64> {
        let n = self.row_count();
        match &self.weights {
            Some((_, w)) => {
                let total: f64 = w.iter().sum();
                w / total
            }
            None => DVector::from_element(n, 1.0 / n as f64),
        }
    }

    /// Row `i` of `W = [1, controls, outcome, treatment]`.
    pub(crate) fn design_row(&self, i: usize) -> DVector<f64> {
        let k = self.controls.ncols();
        let mut row = DVector::zeros(k + 3);
        row[0] = 1.0;
        for j in 0..k {
            row[j + 1] = self.controls[(i, j)];
        }
        row[k + 1] = self.outcome[i];
        row[k + 2] = self.treatment[i];
        row
    }
}

fn validate_weights(kind: WeightKind, column: &DVector<f64>, filter: Option<&[bool]>) -> Result<()> {
    let mut total = 0.0;
    for (row, weight) in column.iter().enumerate() {
        if filter.is_some_and(|filter| !filter[row]) || weight.is_nan() {
            continue;
        }
        if !weight.is_finite() {
            return Err(RcrError::InvalidWeights {
                reason: format!("weight at row {row} is not finite"),
            });
        }
        if *weight < 0.0 {
            return Err(RcrError::InvalidWeights {
                reason: format!("weight at row {row} is negative ({weight})"),
            });
        }
        if kind == WeightKind::Frequency && weight.fract() != 0.0 {
            return Err(RcrError::InvalidWeights {
                reason: format!("frequency weight at row {row} is not a whole number ({weight})"),
            });
        }
        total += weight;
    }
    if total <= 0.0 {
        return Err(RcrError::InvalidWeights {
            reason: "weights must sum to a positive number".into(),
        });
    }
    Ok(())
}
