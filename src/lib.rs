pub mod converter;
pub mod flow;
pub mod grid;
pub mod rounding;
pub mod torch_pickle;

use std::path::PathBuf;

use tch::TchError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Torch error: {0}")]
    Tensor(#[from] TchError),
    #[error("No usable flow tensor in archive {path:?}: {reason}")]
    Archive { path: PathBuf, reason: String },
    #[error("Cannot read torch.save archive {path:?}: {reason}")]
    Pickle { path: PathBuf, reason: String },
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("Shape mismatch: expected {expected}, got {actual:?}")]
    Shape { expected: String, actual: Vec<i64> },
    #[error("Value {value} at channel {channel}, row {row}, col {col} is not a representable offset")]
    Value {
        value: f64,
        channel: usize,
        row: usize,
        col: usize,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn io<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub use crate::converter::{convert_file, ConvertOptions, Converter};
pub use crate::flow::{FlowField, TensorFormat};
pub use crate::grid::{JsonStyle, OffsetGrid};
pub use crate::rounding::Rounding;

/// `[dx, dy]`, in whole pixels.
pub type Offset = [i64; 2];
pub type OffsetRow = Vec<Offset>;
