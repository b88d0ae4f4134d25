//! Error types and handling
//!
//! Crate-level error used by the binary; every component keeps its own
//! narrower error enum and converts into this one at the edge.

use crate::capture::CaptureError;
use crate::config::ConfigError;
use crate::processing::{ConsolidateError, ToolError};
use crate::recorder::WriterError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("Writer error: {0}")]
    Writer(#[from] WriterError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Processing error: {0}")]
    Processing(#[from] ConsolidateError),
}

impl AppError {
    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Io(_) => "IO_ERROR",
            AppError::Serialization(_) => "SERIALIZATION_ERROR",
            AppError::Config(_) => "CONFIG_ERROR",
            AppError::Capture(CaptureError::PermissionDenied(_)) => "PERMISSION_DENIED",
            AppError::Capture(_) => "CAPTURE_ERROR",
            AppError::Writer(_) => "WRITER_ERROR",
            AppError::Tool(_) => "TOOL_ERROR",
            AppError::Processing(_) => "PROCESSING_ERROR",
        }
    }
}

/// Error response for callers that want a serializable error
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<AppError> for ErrorResponse {
    fn from(error: AppError) -> Self {
        ErrorResponse {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
