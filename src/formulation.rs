//! Model formulation: which columns play the outcome, treatment, and control roles.
//!
//! A formulation can be written as a Stata-style variable list, where the first
//! name is the outcome, the second the treatment, and the remaining names are
//! the controls: `"SAT Small_Class White_Asian Girl Free_Lunch"`.

use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{RcrError, Result};

/// Outcome, treatment, and ordered controls of an RCR model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Formulation {
    outcome: String,
    treatment: String,
    controls: Vec<String>,
}

impl Formulation {
    /// Creates a formulation after checking that the variable roles are disjoint.
    pub fn new<S, T, I, C>(outcome: S, treatment: T, controls: I) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        let formulation = Self {
            outcome: outcome.into(),
            treatment: treatment.into(),
            controls: controls.into_iter().map(Into::into).collect(),
        };
        formulation.validate()?;
        Ok(formulation)
    }

    /// Parses a whitespace-separated variable list: outcome, treatment, controls.
    pub fn parse(varlist: &str) -> Result<Self> {
        let mut names = varlist.split_whitespace();
        let outcome = names.next().ok_or_else(|| RcrError::InvalidFormulation {
            reason: "an outcome variable is required".into(),
        })?;
        let treatment = names.next().ok_or_else(|| RcrError::InvalidFormulation {
            reason: "a treatment variable is required".into(),
        })?;
        Self::new(outcome, treatment, names)
    }

    fn validate(&self) -> Result<()> {
        if self.controls.is_empty() {
            return Err(RcrError::InvalidFormulation {
                reason: "at least one control variable is required".into(),
            });
        }
        let mut seen = HashSet::new();
        for name in self.variables() {
            if name.is_empty() {
                return Err(RcrError::InvalidFormulation {
                    reason: "variable names cannot be empty".into(),
                });
            }
            if !seen.insert(name) {
                return Err(RcrError::InvalidFormulation {
                    reason: format!("variable `{name}` appears in more than one role"),
                });
            }
        }
        Ok(())
    }

    /// Name of the outcome (dependent) variable.
    pub fn outcome(&self) -> &str {
        &self.outcome
    }

    /// Name of the treatment variable whose effect is bounded.
    pub fn treatment(&self) -> &str {
        &self.treatment
    }

    /// Names of the control variables, in model order.
    pub fn controls(&self) -> &[String] {
        &self.controls
    }

    /// All model variables: outcome, treatment, then controls.
    pub fn variables(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.outcome.as_str())
            .chain(std::iter::once(self.treatment.as_str()))
            .chain(self.controls.iter().map(String::as_str))
    }

    /// Returns `true` when `name` is one of the model variables.
    pub fn contains(&self, name: &str) -> bool {
        self.variables().any(|variable| variable == name)
    }
}

impl FromStr for Formulation {
    type Err = RcrError;

    fn from_str(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}
