//! Error types for IL2CPP recovery

use thiserror::Error;

/// Main error type shared by the recovery pipeline
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("il2cpp file not supported (magic {0:#010x})")]
    UnsupportedFormat(u32),

    #[error("Unsupported metadata version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid magic number: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("Recovery path not supported: {0}")]
    UnsupportedRecoveryPath(String),

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Link error: {0}")]
    Link(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("An error occurred while processing: {0}")]
    SessionFailure(Box<Error>),
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn registration(msg: impl Into<String>) -> Self {
        Self::Registration(msg.into())
    }

    pub fn link(msg: impl Into<String>) -> Self {
        Self::Link(msg.into())
    }

    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Wrap a fault raised during search or linking. Already wrapped
    /// failures are returned unchanged so the boundary only applies once.
    pub fn session_failure(source: Error) -> Self {
        match source {
            Self::SessionFailure(_) => source,
            other => Self::SessionFailure(Box::new(other)),
        }
    }

    /// The innermost error behind any session failure wrapping
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::SessionFailure(inner) => inner.root_cause(),
            other => other,
        }
    }

    pub fn is_session_failure(&self) -> bool {
        matches!(self, Self::SessionFailure(_))
    }
}
