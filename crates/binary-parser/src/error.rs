//! Error types for binary parsing

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported container format (magic {magic:#010x})")]
    UnsupportedFormat { magic: u32 },

    #[error("Invalid magic number: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },

    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    #[error("Address out of bounds: {0:#x}")]
    AddressOutOfBounds(u64),

    #[error("Decompression failed: {0}")]
    Decompress(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Truncated data: expected {expected} bytes, got {actual}")]
    TruncatedData { expected: usize, actual: usize },
}

pub type ParseResult<T> = std::result::Result<T, ParseError>;

impl ParseError {
    pub fn invalid_header(msg: impl Into<String>) -> Self {
        Self::InvalidHeader(msg.into())
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn truncated(expected: usize, actual: usize) -> Self {
        Self::TruncatedData { expected, actual }
    }
}

impl From<scroll::Error> for ParseError {
    fn from(err: scroll::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<ParseError> for ilrecover_core::Error {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::UnsupportedFormat { magic } => ilrecover_core::Error::UnsupportedFormat(magic),
            ParseError::Io(io) => ilrecover_core::Error::Io(io),
            other => ilrecover_core::Error::Parse(other.to_string()),
        }
    }
}
