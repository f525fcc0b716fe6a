//! Relative correlation restriction (RCR) estimation for linear models.
//!
//! The RCR estimator of Krauth (2016) bounds the effect `betax` of a treatment
//! on an outcome when the treatment may be correlated with unobservables. The
//! researcher states how strongly the unobservables may be correlated with
//! the treatment relative to the observed controls, as a range
//! `lambda in [lambdaL, lambdaH]`, and the crate estimates the resulting
//! identified set `[betaxL, betaxH]` along with three point-identified
//! parameters (`lambdaInf`, `betaxInf`, `lambda0`). The crate offers tools to
//!
//! - hold named numeric columns and select the estimation sample (`data`),
//! - compute the moment vector and its covariance (`moments`),
//! - solve for the RCR parameters and their gradients (`identification`),
//! - derive standard errors and confidence intervals (`inference`, `interval`),
//! - run the whole pipeline (`estimation`), and
//! - query the result with tables, Wald tests and interval tests (`postestimation`).
//!
//! # Quick start
//!
//! ```no_run
//! use rcrs::data::Dataset;
//! use rcrs::estimation::{Parameter, RcrProblem};
//! use rcrs::formulation::Formulation;
//! use rcrs::interval::CiMethod;
//! use rcrs::options::EstimationOptions;
//!
//! let data = Dataset::builder()
//!     .column("SAT", vec![512.0, 480.0, 530.0, 495.0, 470.0, 540.0])
//!     .column("Small_Class", vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0])
//!     .column("White_Asian", vec![1.0, 0.0, 1.0, 1.0, 0.0, 1.0])
//!     .column("Girl", vec![0.0, 1.0, 1.0, 0.0, 1.0, 0.0])
//!     .build()
//!     .expect("well-formed dataset");
//!
//! let formulation = Formulation::parse("SAT Small_Class White_Asian Girl").expect("valid varlist");
//! let problem = RcrProblem::new(data, formulation).expect("known variables");
//! let options = EstimationOptions::default()
//!     .with_lambda(Some(0.0), Some(1.0))
//!     .with_ci_method(CiMethod::ImbensManski);
//!
//! let result = problem.estimate(&options).expect("identified model");
//! println!("{}", result.table().expect("valid level"));
//! println!("betaxL = {}", result.param(Parameter::BetaxL));
//! println!("p-value for betax = 0: {}", result.test_interval(0.0).expect("valid test"));
//! ```

pub mod data;
pub mod error;
pub mod estimation;
pub mod formulation;
pub mod identification;
pub mod inference;
pub mod interval;
pub mod moments;
pub mod options;
pub mod postestimation;
pub mod solving;

pub use data::{Dataset, WeightKind, Weights};
pub use error::{ErrorKind, RcrError, Result};
pub use estimation::{EstimationResult, Parameter, RcrEstimate, RcrProblem};
pub use formulation::Formulation;
pub use identification::{Extended, LambdaCurve};
pub use interval::{CiMethod, Interval};
pub use options::{EstimationOptions, LambdaRange};
pub use postestimation::{CoefficientTable, LinearRestriction, WaldTest};
pub use solving::{SolverOptions, SolverSummary};
