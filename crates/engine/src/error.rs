use protocol::{ErrorKind, ToolError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {0} is still running")]
    StillRunning(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn invalid(message: impl Into<String>) -> Self {
        EngineError::InvalidParameter(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            EngineError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            EngineError::ExecutableNotFound(_) => ErrorKind::ExecutableNotFound,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::StillRunning(_) => ErrorKind::StillRunning,
            EngineError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            EngineError::Internal(_) | EngineError::Io(_) => ErrorKind::InternalError,
        }
    }
}

impl From<EngineError> for ToolError {
    fn from(err: EngineError) -> Self {
        ToolError::new(err.kind(), err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
