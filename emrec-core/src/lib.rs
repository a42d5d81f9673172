//! Emotion dataset preparation.
//!
//! Raw fer2013-style rows are decoded, their faces located with a Haar cascade
//! (or YuNet), cropped and normalized, one-hot labelled and stored as `.npy`
//! arrays ready for training.

/// OpenCV-format Haar cascade detector.
pub mod cascade;
/// Classifier and trainer seams over prepared tensors.
pub mod classify;
/// Dataset configuration, preparation and loading.
pub mod dataset;
/// Face rectangles and the detector trait.
pub mod detector;
pub mod error;
/// Rectangle grouping and non-maximum suppression.
pub mod grouping;
/// Picks the face to keep out of a detector's candidates.
pub mod locator;
/// Border, detect, crop and resize pipeline for single images.
pub mod normalizer;
pub mod progress;
/// Raw table reader.
pub mod raw;
/// Record codec and split tags.
pub mod record;
/// Known datasets.
pub mod registry;
pub mod split;
pub mod vocabulary;
/// YuNet ONNX detector.
pub mod yunet;

pub use cascade::HaarCascade;
pub use classify::{EmotionClassifier, EmotionPrediction, EmotionTrainer, classify, images_to_batch};
pub use dataset::{
    ArtifactPaths, DatasetConfig, DatasetMaterializer, LoadedDataset, PrepareOptions,
    PrepareReport, StorageLayout, TensorPair,
};
pub use detector::{DetectorParams, FaceDetector, FaceRect};
pub use error::DatasetError;
pub use grouping::{GROUP_EPS, ScoredRect, group_rectangles, non_max_suppression};
pub use locator::{FaceLocator, select_largest};
pub use normalizer::{BorderSpec, ImageNormalizer, NormalizeError, NormalizedImage, SourceImage};
pub use progress::{CancelToken, LogProgress, NoProgress, ProgressSink, ProgressUpdate};
pub use raw::{RawTable, read_records, read_records_from_path};
pub use record::{RawRecord, RecordCodec, RecordOutcome, SkipReason, SplitTag, parse_pixels};
pub use registry::{DatasetEntry, dataset_by_name, dataset_entry, registered_datasets};
pub use split::{SplitBuilder, SplitData, SplitStats};
pub use vocabulary::{EmotionVocabulary, FER2013_EMOTIONS, LabelVector};
pub use yunet::{YuNetFaceDetector, YuNetOptions};

/// Returns the crate version for diagnostics.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
