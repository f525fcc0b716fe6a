use thiserror::Error;

/// Broad classification of [`RcrError`] values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The data cannot support estimation (too few rows, singular moments, bad weights).
    Data,
    /// The moments do not identify the RCR parameters for the requested lambda range.
    Identification,
    /// The cluster structure cannot support a cluster-robust covariance.
    Clustering,
    /// The caller supplied an invalid or contradictory option.
    Config,
}

/// Unified error type for `rcrs` operations.
#[derive(Debug, Error)]
pub enum RcrError {
    /// Raised when provided columns or matrices have incompatible dimensions.
    #[error("dimension mismatch in {context}: expected {expected} but found {found}")]
    DimensionMismatch {
        /// Human-readable context describing the operation.
        context: &'static str,
        /// The required dimension.
        expected: usize,
        /// The dimension that was actually supplied.
        found: usize,
    },

    /// Raised when a variable name does not refer to a dataset column.
    #[error("variable `{name}` not found")]
    UnknownVariable { name: String },

    /// Raised when a dataset defines the same column twice.
    #[error("variable `{name}` defined more than once")]
    DuplicateVariable { name: String },

    /// Raised when the estimation sample is too small for the model.
    #[error("insufficient observations: {observations} available, more than {parameters} required")]
    InsufficientObservations {
        observations: usize,
        parameters: usize,
    },

    /// Raised when linear algebra operations encounter a singular system.
    #[error("matrix in {context} is singular")]
    SingularMatrix { context: &'static str },

    /// Raised when observation weights cannot be used.
    #[error("invalid weights: {reason}")]
    InvalidWeights { reason: String },

    /// Raised when the sample moments do not describe a valid covariance structure.
    #[error("invalid data: {reason}")]
    InvalidMoments { reason: String },

    /// Raised when numerical routines produce values that cannot be used.
    #[error("encountered NaN during {context}")]
    NumericalError { context: &'static str },

    /// Raised when the moments do not identify the model.
    #[error("model not identified: {reason}")]
    NotIdentified { reason: String },

    /// Raised when no value of betax is consistent with the lambda range.
    #[error("identified set for betax is empty for lambda range {range}")]
    EmptyIdentifiedSet { range: String },

    /// Raised when the lower lambda bound exceeds the upper bound.
    #[error("lambda range [{lower}, {upper}] must be in (weakly) ascending order")]
    InvertedLambdaRange { lower: f64, upper: f64 },

    /// Raised when a cluster-robust covariance is requested with too few clusters.
    #[error("cluster-robust covariance requires at least 2 clusters, found {clusters}")]
    TooFewClusters { clusters: usize },

    /// Raised when a confidence-interval method name is not recognized.
    #[error("unsupported CI type `{name}`; expected one of \"conservative\", \"Imbens-Manski\", \"upper\", \"lower\"")]
    UnknownCiMethod { name: String },

    /// Raised when the variance adjustment factor is not a positive number.
    #[error("vceadj = {factor}, must be a positive number")]
    InvalidVarianceAdjustment { factor: f64 },

    /// Raised when the confidence level is outside (0, 100).
    #[error("confidence level {level} must lie strictly between 0 and 100")]
    InvalidConfidenceLevel { level: f64 },

    /// Raised when a lambda bound is present but not finite.
    #[error("lambda bound {value} must be finite; leave the bound out to make it unbounded")]
    InvalidLambdaBound { value: f64 },

    /// Raised when two options cannot be used together.
    #[error("conflicting options: {reason}")]
    ConflictingOptions { reason: String },

    /// Raised when a model formulation is malformed.
    #[error("invalid formulation: {reason}")]
    InvalidFormulation { reason: String },

    /// Raised when a test restriction cannot be parsed or applied.
    #[error("invalid restriction `{expression}`: {reason}")]
    InvalidRestriction { expression: String, reason: String },
}

impl RcrError {
    /// Helper to format a [`DimensionMismatch`](RcrError::DimensionMismatch) error.
    pub fn dimension_mismatch(context: &'static str, expected: usize, found: usize) -> Self {
        Self::DimensionMismatch {
            context,
            expected,
            found,
        }
    }

    /// Helper to raise when a matrix factorization fails due to singularity.
    pub fn singular(context: &'static str) -> Self {
        Self::SingularMatrix { context }
    }

    /// Helper for invalid-moment errors.
    pub fn invalid_moments(reason: impl Into<String>) -> Self {
        Self::InvalidMoments {
            reason: reason.into(),
        }
    }

    /// Helper for identification failures.
    pub fn not_identified(reason: impl Into<String>) -> Self {
        Self::NotIdentified {
            reason: reason.into(),
        }
    }

    /// Helper for restriction parse failures.
    pub fn invalid_restriction(expression: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRestriction {
            expression: expression.into(),
            reason: reason.into(),
        }
    }

    /// Classifies the error into one of the four error kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DimensionMismatch { .. }
            | Self::InsufficientObservations { .. }
            | Self::SingularMatrix { .. }
            | Self::InvalidWeights { .. }
            | Self::InvalidMoments { .. }
            | Self::NumericalError { .. } => ErrorKind::Data,
            Self::NotIdentified { .. }
            | Self::EmptyIdentifiedSet { .. }
            | Self::InvertedLambdaRange { .. } => ErrorKind::Identification,
            Self::TooFewClusters { .. } => ErrorKind::Clustering,
            Self::UnknownVariable { .. }
            | Self::DuplicateVariable { .. }
            | Self::UnknownCiMethod { .. }
            | Self::InvalidVarianceAdjustment { .. }
            | Self::InvalidConfidenceLevel { .. }
            | Self::InvalidLambdaBound { .. }
            | Self::ConflictingOptions { .. }
            | Self::InvalidFormulation { .. }
            | Self::InvalidRestriction { .. } => ErrorKind::Config,
        }
    }
}

/// Type alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, RcrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_error_families() {
        assert_eq!(RcrError::singular("X'X").kind(), ErrorKind::Data);
        assert_eq!(
            RcrError::InvertedLambdaRange {
                lower: 2.0,
                upper: 1.0
            }
            .kind(),
            ErrorKind::Identification
        );
        assert_eq!(
            RcrError::TooFewClusters { clusters: 1 }.kind(),
            ErrorKind::Clustering
        );
        assert_eq!(
            RcrError::UnknownCiMethod {
                name: "wide".into()
            }
            .kind(),
            ErrorKind::Config
        );
    }

    #[test]
    fn unknown_ci_method_names_allowed_values() {
        let message = RcrError::UnknownCiMethod {
            name: "wide".into(),
        }
        .to_string();
        assert!(message.contains("conservative"));
        assert!(message.contains("Imbens-Manski"));
    }
}
