//! Error types shared across the rendering backend.

use thiserror::Error;

/// Core error type for configuration and host-level failures.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid renderer configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violated inside the backend.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using the core Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config("frames_in_flight must be at least 1".into());
        assert_eq!(
            err.to_string(),
            "Configuration error: frames_in_flight must be at least 1"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
