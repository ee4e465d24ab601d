use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Flowlens operations
#[derive(Error, Debug)]
pub enum FlowlensError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error in {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("Diff error: {0}")]
    Diff(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to start tracer runtime: {0}")]
    TracerSpawn(String),

    #[error("Tracer did not finish within {millis} ms")]
    TracerTimeout { millis: u64 },

    #[error("Tracer protocol error: {0}")]
    TracerProtocol(String),

    #[error("Signature lookup failed for {function_id}: {message}")]
    SignatureLookup { function_id: String, message: String },

    #[error("Invalid function id '{0}', expected <file>::<function>")]
    InvalidFunctionId(String),
}

pub type Result<T> = std::result::Result<T, FlowlensError>;
