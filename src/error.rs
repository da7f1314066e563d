use thiserror::Error;

/// Errors surfaced by the column layer.
///
/// Errors propagate from the call that triggered them; reductions surface
/// the first worker error and cancel siblings. Nothing is retried and no
/// error is swallowed. The type is `Clone` so that every waiter on a shared
/// merge result observes the same failure.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// Buffer value outside its valid domain (category index, nanos, seconds).
    #[error("RangeError: {0}")]
    Range(String),

    /// Dictionary violates the null-at-zero or boolean shape constraints.
    #[error("InvalidDictionaryShape: {0}")]
    InvalidDictionaryShape(String),

    /// Operation not available for this format, type or representation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Dictionary replacement would alias two indices to the same value.
    #[error("IllegalReplacement: {0}")]
    IllegalReplacement(String),

    /// Context inactive or cancelled, or a checked cause inside a task body.
    #[error("ExecutionAborted: {0}")]
    ExecutionAborted(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
