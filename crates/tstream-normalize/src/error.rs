use std::fmt;

/// Result type for tstream-normalize operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur in the normalizer layer
#[derive(Debug)]
pub enum Error {
    /// Input data did not have the shape the transform requires
    InvalidInput(String),

    /// Transform options are contradictory or malformed
    InvalidOptions(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::InvalidOptions(msg) => write!(f, "Invalid options: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
