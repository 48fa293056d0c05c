//! Error types for the wally-banks library

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for wally-banks operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while building or reading appearance banks
#[derive(Error, Debug)]
pub enum Error {
    /// The dataset root yielded no `.jpg` samples at all
    #[error(
        "no samples found under {0:?}; expected dataset/<character>/<part>/*.jpg or dataset/negatives_hard/*.jpg"
    )]
    NoSamples(PathBuf),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A source image could not be opened or decoded
    #[error("Failed to decode image {path:?}: {source}")]
    ImageDecode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    /// Backbone inference failed or produced an unexpected shape
    #[error("Feature extraction failed: {0}")]
    Extraction(String),

    /// Error during k-means clustering
    #[error("Clustering failed: {0}")]
    Cluster(String),

    /// Error with array or bank dimensions
    #[error("Shape error: {0}")]
    Shape(String),

    /// Malformed bank set on read-back
    #[error("Invalid bank set: {0}")]
    Bank(String),

    /// Error reading/writing files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing or writing JSON
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ndarray::ShapeError> for Error {
    fn from(e: ndarray::ShapeError) -> Self {
        Error::Shape(e.to_string())
    }
}
