//! Meter error types

use thiserror::Error;

use crate::types::SourceId;

/// Errors reported by the metering configuration surface
#[derive(Error, Debug)]
pub enum MeterError {
    /// A meter already exists for this source
    #[error("{0} already has an attached meter")]
    AlreadyAttached(SourceId),

    /// A pushed block's channel count differs from the attached count
    #[error("block has {got} channels, meter attached with {expected}")]
    LayoutMismatch { expected: usize, got: usize },

    /// A ballistics field failed validation; the previous value is kept
    #[error("invalid ballistics config: {field} must be positive (got {value})")]
    InvalidConfig { field: &'static str, value: f32 },

    /// An unrecognized window-kind name; the default was applied instead
    #[error("unknown window kind \"{0}\", falling back to blackman-harris")]
    UnknownWindow(String),

    /// No meter exists for this source
    #[error("no meter attached for {0}")]
    NotAttached(SourceId),
}

/// Result type for metering operations
pub type MeterResult<T> = Result<T, MeterError>;
