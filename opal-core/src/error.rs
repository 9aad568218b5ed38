use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid input: {0}")]
    BadInput(String),

    #[error("value out of range: {0}")]
    Overflow(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("operation interrupted")]
    Interrupted,

    #[error("insufficient maintenance memory: {0}")]
    Resource(String),

    #[error("page store error: {0}")]
    Page(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// True for errors caused by the statement's own input, which abort
    /// the statement rather than signal an internal fault.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Error::DimensionMismatch { .. }
                | Error::BadInput(_)
                | Error::Overflow(_)
                | Error::Unsupported(_)
        )
    }
}
