// error types shared by every stage of the trainer

use std::path::PathBuf;

/// Result type of this crate, `DepVecError` by default.
pub type Result<T, E = DepVecError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum DepVecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A vocabulary or vectors file does not follow its line format.
    #[error("{}:{line}: {message}", path.display())]
    Format {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// A zero-length row was met while normalizing a vectors model.
    #[error("embedding normalization error: division by zero (word '{word}')")]
    DivisionByZero { word: String },

    /// Weights restored from disk do not belong to the live vocabulary.
    #[error("vocabulary divergence: {0}")]
    VocabularyDivergence(String),

    #[error("dimensions discrepancy: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("cannot allocate memory: {0}")]
    Allocation(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl DepVecError {
    pub(crate) fn format<P: Into<PathBuf>, S: Into<String>>(path: P, line: usize, message: S) -> Self {
        DepVecError::Format {
            path: path.into(),
            line,
            message: message.into(),
        }
    }
}
