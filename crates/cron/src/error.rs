use thiserror::Error;

/// Error produced while parsing a cron expression.
///
/// `position` is the byte offset of the offending field within the source
/// expression, so callers can point at the exact token that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid cron expression at offset {position}: {message}")]
pub struct ParseError {
    pub position: usize,
    pub message: String,
}

impl ParseError {
    #[must_use]
    pub fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParseError>;
