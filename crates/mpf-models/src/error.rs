//! Model error types.

use thiserror::Error;

/// Result type for model operations.
pub type ModelResult<T> = Result<T, ModelError>;

/// Errors raised while interpreting job properties.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Invalid value \"{value}\" for property {name}: {reason}")]
    InvalidProperty {
        name: String,
        value: String,
        reason: String,
    },
}

impl ModelError {
    pub fn invalid_property(
        name: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidProperty {
            name: name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}
