use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("channel closed")]
    Closed,
    #[error("channel failed: {0}")]
    Failed(String),
    #[error("duplicate channel label '{0}'")]
    DuplicateLabel(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
}
