use std::fmt;

/// Result type for tstream-types operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types shared across the agent's library crates
#[derive(Debug)]
pub enum Error {
    /// Declaration rejected during validation; nothing was applied
    Validation(String),

    /// Namespace or named object missing on lookup
    ObjectNotFound(String),

    /// Cipher-text could not be decrypted
    Secret(String),

    /// IO operation failed
    Io(std::io::Error),

    /// JSON (de)serialization failed
    Json(serde_json::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Validation(msg) => write!(f, "Validation error: {}", msg),
            Error::ObjectNotFound(msg) => write!(f, "Object not found in configuration: {}", msg),
            Error::Secret(msg) => write!(f, "Secret error: {}", msg),
            Error::Io(err) => write!(f, "IO error: {}", err),
            Error::Json(err) => write!(f, "JSON error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Json(err) => Some(err),
            Error::Validation(_) | Error::ObjectNotFound(_) | Error::Secret(_) => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err)
    }
}
