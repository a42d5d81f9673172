use std::path::PathBuf;

use thiserror::Error;

use crate::record::SplitTag;

/// Fatal dataset errors that callers may want to match on.
///
/// They travel inside `anyhow::Error`; use `downcast_ref::<DatasetError>()` to inspect them.
#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("dataset '{dataset}' is not prepared: {} is missing", path.display())]
    NotPrepared { dataset: String, path: PathBuf },

    #[error("emotion label {label} is outside the vocabulary of {size} categories")]
    LabelOutOfRange { label: usize, size: usize },

    #[error("{} has shape {found:?}; expected {expected}", path.display())]
    ShapeMismatch {
        path: PathBuf,
        found: Vec<usize>,
        expected: String,
    },

    #[error("{split} split holds {images} images but {labels} label vectors")]
    CountMismatch {
        split: SplitTag,
        images: usize,
        labels: usize,
    },

    #[error("preparation cancelled while building the {split} split")]
    Cancelled { split: SplitTag },

    #[error("unknown dataset '{0}'")]
    UnknownDataset(String),
}
