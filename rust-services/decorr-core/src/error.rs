use thiserror::Error;

#[derive(Error, Debug)]
pub enum DecorrError {
    #[error("shape mismatch: {left:?} vs {right:?}")]
    ShapeMismatch { left: Vec<usize>, right: Vec<usize> },

    #[error("image of shape {height}x{width} has fewer than two samples")]
    DegenerateImage { height: usize, width: usize },

    #[error("channel stack is empty")]
    EmptyStack,

    #[error("expected a non-empty square matrix, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },

    #[error("matrix contains non-finite entries")]
    NonFinite,

    #[error("matrix is not positive definite (eigenvalue {eigenvalue:e})")]
    NotPositiveDefinite { eigenvalue: f64 },

    #[error("entry '{key}' not found in archive (available: {available:?})")]
    MissingEntry { key: String, available: Vec<String> },

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("failed to read NPZ archive: {0}")]
    Npz(#[from] ndarray_npy::ReadNpzError),

    #[error("failed to parse geometry JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DecorrError>;
