use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Boxed cause carried by the model and image variants.
///
/// # Why `Send + Sync`
///
/// Model calls run on tokio's blocking pool and their results are handed back
/// to the async caller, so every error has to cross threads. A plain
/// `Box<dyn Error>` would make `Result<T>` unusable as the output of
/// `spawn_blocking`.
type BoxedSource = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the detect-then-classify pipeline.
///
/// Every variant renders a message that can be shown to a user as-is, so a
/// failed call always has something displayable instead of a stale label.
#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Model load error: could not construct {model} from {path:?}")]
    ModelLoad {
        model: String,
        path: PathBuf,
        #[source]
        source: BoxedSource,
    },

    #[error("Invalid image: {width}x{height} has no pixels to transform")]
    InvalidImage { width: u32, height: u32 },

    #[error("Model unavailable: no {model} has been constructed")]
    ModelUnavailable { model: String },

    #[error("Timeout: {operation} did not finish within {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxedSource,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ClassifyError>;

impl ClassifyError {
    pub(crate) fn model_unavailable(model: &str) -> Self {
        Self::ModelUnavailable {
            model: model.to_string(),
        }
    }

    pub(crate) fn validation(field: &str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Convert anyhow errors to configuration errors.
///
/// Only the message survives; anyhow errors reach the library from setup
/// code where the chain carries no structure worth keeping.
impl From<anyhow::Error> for ClassifyError {
    fn from(err: anyhow::Error) -> Self {
        ClassifyError::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Callers that know the path and operation should build
/// `ClassifyError::FileSystem` directly.
impl From<std::io::Error> for ClassifyError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for ClassifyError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for ClassifyError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come out of tensor handling around inference, so they are
/// reported as model errors.
impl From<ndarray::ShapeError> for ClassifyError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert a failed inference task into a model error.
///
/// # Why not a timeout
///
/// A `JoinError` means the blocking task panicked or was cancelled by runtime
/// shutdown. Running past the deadline is reported separately as
/// `ClassifyError::Timeout` by the caller that owns the deadline, so a join
/// failure is always the model's own fault.
impl From<tokio::task::JoinError> for ClassifyError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Model {
            operation: "inference task".to_string(),
            source: Box::new(err),
        }
    }
}
