use thiserror::Error;

use crate::ir::verify::VerifyError;

/// Structural failures raised by the differentiation and loss-splice transforms.
///
/// Every variant names the function being transformed. No partial output is
/// produced when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AutodiffError {
    #[error("function @{name} not found in module")]
    FunctionNotFound { name: String },
    #[error("function @{function} has {regions} regions; exactly one is required")]
    MultiRegionFunction { function: String, regions: usize },
    #[error("function @{function} must return a rank-0 tensor, found {found}")]
    NonScalarTarget { function: String, found: String },
    #[error("`{value}` is not a parameter of function @{function}")]
    InvalidRequireGrads { function: String, value: String },
    #[error("no differentiation rule registered for operator `{op}` in function @{function}")]
    MissingGradientRule { function: String, op: String },
    #[error("gradient rule for `{op}` failed in function @{function}: {message}")]
    RuleFailed {
        function: String,
        op: String,
        message: String,
    },
    #[error("shape mismatch in function @{function}: {message}")]
    ShapeMismatch { function: String, message: String },
    #[error("function @{function} returns %{value}, which is not a declared output")]
    MalformedOutputSet { function: String, value: String },
    #[error("function @{function} is ill-formed: {source}")]
    IllFormed {
        function: String,
        #[source]
        source: VerifyError,
    },
}

impl AutodiffError {
    /// Name of the function the error refers to.
    pub fn function(&self) -> &str {
        match self {
            AutodiffError::FunctionNotFound { name } => name,
            AutodiffError::MultiRegionFunction { function, .. }
            | AutodiffError::NonScalarTarget { function, .. }
            | AutodiffError::InvalidRequireGrads { function, .. }
            | AutodiffError::MissingGradientRule { function, .. }
            | AutodiffError::RuleFailed { function, .. }
            | AutodiffError::ShapeMismatch { function, .. }
            | AutodiffError::MalformedOutputSet { function, .. }
            | AutodiffError::IllFormed { function, .. } => function,
        }
    }
}
