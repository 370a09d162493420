//! Error taxonomy shared by every stage of the pipeline.

use std::path::PathBuf;

use thiserror::Error;

/// The result type used across the library.
pub type Result<T> = std::result::Result<T, Error>;

/// The library's error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed table, unparsable embedding string, missing column.
    #[error("data format error: {0}")]
    DataFormat(String),

    /// An image id that is not present in the embedding table.
    #[error("no embedding recorded for image id `{0}`")]
    Lookup(String),

    /// Tensor dimensions that disagree with each other or with the configuration.
    #[error("shape mismatch between {a} and {b}: expected {expected}, got {got}")]
    ShapeMismatch {
        a: &'static str,
        b: &'static str,
        expected: usize,
        got: usize,
    },

    /// The device mesh could not be built for the requested device count.
    #[error("cannot allocate {requested} device(s): {reason}")]
    DeviceAllocation { requested: usize, reason: String },

    #[error("failed to decode image {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("backbone error: {0}")]
    Backbone(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error only invalidates a single preprocessed row.
    ///
    /// Row-level failures are skipped in lenient preprocessing; everything else
    /// aborts the run.
    pub fn is_row_recoverable(&self) -> bool {
        matches!(
            self,
            Error::DataFormat(_)
                | Error::Lookup(_)
                | Error::ShapeMismatch { .. }
                | Error::Image { .. }
                | Error::Io(_)
        )
    }
}
