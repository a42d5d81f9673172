//! Preparing raw datasets into `.npy` arrays and loading them back as tensors.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use emrec_utils::{config::PathSettings, timing_guard};
use log::info;
use ndarray::{Array2, Array3, Array4, ArrayD};
use ndarray_npy::{read_npy, write_npy};
use serde::Serialize;

use crate::error::DatasetError;
use crate::progress::{CancelToken, ProgressSink};
use crate::raw::{RawTable, read_records_from_path};
use crate::record::{RawRecord, RecordCodec, SplitTag};
use crate::split::{SplitBuilder, SplitData, SplitStats};
use crate::vocabulary::EmotionVocabulary;

/// Everything that identifies a dataset and shapes its prepared arrays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetConfig {
    /// Prefix of every artifact file name.
    pub name: String,
    /// Raw table file name inside the raw directory.
    pub raw_filename: String,
    /// Side of the square normalized images.
    pub face_size: u32,
    pub vocabulary: EmotionVocabulary,
}

impl DatasetConfig {
    /// The fer2013 facial-expression dataset: 48x48 faces, seven emotions.
    pub fn fer2013() -> Self {
        Self {
            name: "fer2013".to_string(),
            raw_filename: "fer2013.csv".to_string(),
            face_size: 48,
            vocabulary: EmotionVocabulary::fer2013(),
        }
    }
}

/// Where raw tables live and where prepared arrays go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    pub raw_dir: PathBuf,
    pub images_dir: PathBuf,
    pub labels_dir: PathBuf,
}

impl From<&PathSettings> for StorageLayout {
    fn from(paths: &PathSettings) -> Self {
        Self {
            raw_dir: paths.raw_dir.clone(),
            images_dir: paths.images_dir.clone(),
            labels_dir: paths.labels_dir.clone(),
        }
    }
}

/// Image and label array paths of one split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactPaths {
    pub images: PathBuf,
    pub labels: PathBuf,
}

impl StorageLayout {
    pub fn raw_path(&self, config: &DatasetConfig) -> PathBuf {
        self.raw_dir.join(&config.raw_filename)
    }

    /// `<images_dir>/<name>_<stem>.npy` and `<labels_dir>/<name>_<stem>_labels.npy`.
    pub fn artifacts(&self, config: &DatasetConfig, split: SplitTag) -> ArtifactPaths {
        let stem = format!("{}_{}", config.name, split.file_stem());
        ArtifactPaths {
            images: self.images_dir.join(format!("{stem}.npy")),
            labels: self.labels_dir.join(format!("{stem}_labels.npy")),
        }
    }
}

/// Knobs for [`DatasetMaterializer::prepare`].
#[derive(Debug, Clone, Default)]
pub struct PrepareOptions {
    /// Also build and write the private test split.
    pub include_private_test: bool,
    /// Decode rows on the rayon pool.
    pub parallel: bool,
    pub cancel: CancelToken,
}

/// Summary of a prepare run.
#[derive(Debug, Clone, Serialize)]
pub struct PrepareReport {
    pub dataset: String,
    pub splits: Vec<SplitStats>,
    pub artifacts: Vec<ArtifactPaths>,
    /// Raw rows dropped because of an unknown split tag.
    pub ignored_rows: usize,
}

impl PrepareReport {
    pub fn split(&self, tag: SplitTag) -> Option<&SplitStats> {
        self.splits.iter().find(|stats| stats.split == tag)
    }
}

/// Images shaped `(N, s, s, 1)` with labels shaped `(N, vocabulary)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorPair {
    pub images: Array4<f32>,
    pub labels: Array2<f32>,
}

impl TensorPair {
    pub fn len(&self) -> usize {
        self.images.shape()[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Training split plus the chosen test split.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDataset {
    pub train: TensorPair,
    pub test: TensorPair,
    pub test_split: SplitTag,
}

/// Prepares a dataset from its raw table and loads the prepared arrays.
#[derive(Debug, Clone)]
pub struct DatasetMaterializer {
    config: DatasetConfig,
    layout: StorageLayout,
}

impl DatasetMaterializer {
    pub fn new(config: DatasetConfig, layout: StorageLayout) -> Self {
        Self { config, layout }
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    pub fn raw_path(&self) -> PathBuf {
        self.layout.raw_path(&self.config)
    }

    pub fn artifacts(&self, split: SplitTag) -> ArtifactPaths {
        self.layout.artifacts(&self.config, split)
    }

    /// Read the raw table from `<raw_dir>/<raw_filename>`.
    pub fn read_raw(&self) -> Result<RawTable> {
        read_records_from_path(self.raw_path())
    }

    /// Read the raw table and prepare it.
    pub fn prepare_from_raw(
        &self,
        codec: &RecordCodec,
        options: &PrepareOptions,
        progress: &dyn ProgressSink,
    ) -> Result<PrepareReport> {
        let table = self.read_raw()?;
        let mut report = self.prepare(&table.records, codec, options, progress)?;
        report.ignored_rows = table.ignored;
        Ok(report)
    }

    /// Build the training and public test splits (and the private test split when
    /// requested), then write one image and one label array per split.
    ///
    /// All splits are built before anything is written, so a fatal row error leaves
    /// existing artifacts untouched. Output directories must already exist.
    pub fn prepare(
        &self,
        rows: &[RawRecord],
        codec: &RecordCodec,
        options: &PrepareOptions,
        progress: &dyn ProgressSink,
    ) -> Result<PrepareReport> {
        let mut guard = timing_guard("emrec_core::prepare", log::Level::Info);
        anyhow::ensure!(
            codec.normalizer().face_size() == self.config.face_size,
            "codec produces {}px faces but dataset '{}' expects {}px",
            codec.normalizer().face_size(),
            self.config.name,
            self.config.face_size
        );
        anyhow::ensure!(
            codec.vocabulary() == &self.config.vocabulary,
            "codec vocabulary does not match dataset '{}'",
            self.config.name
        );

        let builder = SplitBuilder::new(codec)
            .parallel(options.parallel)
            .with_cancel(options.cancel.clone());

        let mut splits = vec![
            (
                SplitTag::Training,
                builder.build(rows, SplitTag::Training, "Converting training", progress)?,
            ),
            (
                SplitTag::PublicTest,
                builder.build(rows, SplitTag::PublicTest, "Converting test", progress)?,
            ),
        ];
        if options.include_private_test {
            splits.push((
                SplitTag::PrivateTest,
                builder.build(
                    rows,
                    SplitTag::PrivateTest,
                    "Converting private test",
                    progress,
                )?,
            ));
        }

        let mut report = PrepareReport {
            dataset: self.config.name.clone(),
            splits: Vec::with_capacity(splits.len()),
            artifacts: Vec::with_capacity(splits.len()),
            ignored_rows: 0,
        };
        for (tag, data) in splits {
            let paths = self.artifacts(tag);
            self.write_split(&data, &paths)?;
            info!(
                "{} {}: kept {}/{} rows ({} skipped)",
                self.config.name,
                tag,
                data.stats.kept,
                data.stats.total,
                data.stats.skipped_total()
            );
            report.splits.push(data.stats);
            report.artifacts.push(paths);
        }
        guard.set_items(rows.len());
        Ok(report)
    }

    fn write_split(&self, data: &SplitData, paths: &ArtifactPaths) -> Result<()> {
        let size = self.config.face_size as usize;
        let vocab = self.config.vocabulary.len();

        let mut pixels = Vec::with_capacity(data.len() * size * size);
        for image in &data.images {
            pixels.extend(image.as_array().iter().copied());
        }
        let images = Array3::from_shape_vec((data.len(), size, size), pixels)
            .context("normalized images do not match the dataset face size")?;

        let mut one_hot = Vec::with_capacity(data.len() * vocab);
        for label in &data.labels {
            one_hot.extend(label.as_array().iter().copied());
        }
        let labels = Array2::from_shape_vec((data.labels.len(), vocab), one_hot)
            .context("label vectors do not match the vocabulary size")?;

        write_npy(&paths.images, &images)
            .with_context(|| format!("failed to write {}", paths.images.display()))?;
        write_npy(&paths.labels, &labels)
            .with_context(|| format!("failed to write {}", paths.labels.display()))?;
        Ok(())
    }

    /// Whether every artifact needed by `load(use_private_test)` exists.
    pub fn is_prepared(&self, use_private_test: bool) -> bool {
        self.required_artifacts(use_private_test)
            .iter()
            .all(|paths| paths.images.exists() && paths.labels.exists())
    }

    fn required_artifacts(&self, use_private_test: bool) -> [ArtifactPaths; 2] {
        let test_split = if use_private_test {
            SplitTag::PrivateTest
        } else {
            SplitTag::PublicTest
        };
        [
            self.artifacts(SplitTag::Training),
            self.artifacts(test_split),
        ]
    }

    /// Load the training split and the public (or private) test split.
    ///
    /// Images come back as `(N, s, s, 1)` and labels as `(N, vocabulary)`. A missing
    /// file is reported as [`DatasetError::NotPrepared`].
    pub fn load(&self, use_private_test: bool) -> Result<LoadedDataset> {
        let _guard = timing_guard("emrec_core::load", log::Level::Debug);
        let test_split = if use_private_test {
            SplitTag::PrivateTest
        } else {
            SplitTag::PublicTest
        };
        for paths in self.required_artifacts(use_private_test) {
            for path in [&paths.images, &paths.labels] {
                if !path.exists() {
                    return Err(DatasetError::NotPrepared {
                        dataset: self.config.name.clone(),
                        path: path.clone(),
                    }
                    .into());
                }
            }
        }

        Ok(LoadedDataset {
            train: self.load_split(SplitTag::Training)?,
            test: self.load_split(test_split)?,
            test_split,
        })
    }

    fn load_split(&self, split: SplitTag) -> Result<TensorPair> {
        let paths = self.artifacts(split);
        let size = self.config.face_size as usize;
        let vocab = self.config.vocabulary.len();

        let images = read_array(&paths.images)?;
        let square = match images.shape() {
            [_, h, w] | [_, h, w, 1] => *h == size && *w == size,
            _ => false,
        };
        if !square {
            return Err(DatasetError::ShapeMismatch {
                path: paths.images,
                found: images.shape().to_vec(),
                expected: format!("(N, {size}, {size})"),
            }
            .into());
        }
        let count = images.shape()[0];
        let images = Array4::from_shape_vec((count, size, size, 1), images.iter().copied().collect())
            .context("failed to reshape image array")?;

        let labels = read_array(&paths.labels)?;
        if labels.ndim() != 2 || labels.shape()[1] != vocab {
            return Err(DatasetError::ShapeMismatch {
                path: paths.labels,
                found: labels.shape().to_vec(),
                expected: format!("(N, {vocab})"),
            }
            .into());
        }
        let label_count = labels.shape()[0];
        if label_count != count {
            return Err(DatasetError::CountMismatch {
                split,
                images: count,
                labels: label_count,
            }
            .into());
        }
        let labels = Array2::from_shape_vec((label_count, vocab), labels.iter().copied().collect())
            .context("failed to reshape label array")?;

        Ok(TensorPair { images, labels })
    }
}

fn read_array(path: &Path) -> Result<ArrayD<f32>> {
    read_npy(path).with_context(|| format!("failed to read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{DetectorParams, FaceDetector, FaceRect};
    use crate::locator::FaceLocator;
    use crate::normalizer::{BorderSpec, ImageNormalizer};
    use crate::progress::NoProgress;
    use image::GrayImage;
    use std::{fs, sync::Arc};
    use tempfile::TempDir;

    #[derive(Debug)]
    struct CenterDetector;

    impl FaceDetector for CenterDetector {
        fn detect_multi_scale(
            &self,
            _image: &GrayImage,
            _params: &DetectorParams,
        ) -> Result<Vec<FaceRect>> {
            Ok(vec![FaceRect::new(51, 51, 48, 48)])
        }

        fn name(&self) -> &str {
            "center"
        }
    }

    fn codec() -> RecordCodec {
        let locator = FaceLocator::new(Arc::new(CenterDetector), DetectorParams::default());
        RecordCodec::new(
            EmotionVocabulary::fer2013(),
            ImageNormalizer::new(locator, 48, BorderSpec::default()),
        )
    }

    fn layout(root: &Path, create: bool) -> StorageLayout {
        let layout = StorageLayout {
            raw_dir: root.join("raw"),
            images_dir: root.join("prepared/images"),
            labels_dir: root.join("prepared/labels"),
        };
        if create {
            for dir in [&layout.raw_dir, &layout.images_dir, &layout.labels_dir] {
                fs::create_dir_all(dir).expect("create dir");
            }
        }
        layout
    }

    fn rows() -> Vec<RawRecord> {
        let pixels = vec!["90"; 48 * 48].join(" ");
        [
            (1, SplitTag::Training),
            (2, SplitTag::Training),
            (3, SplitTag::PublicTest),
            (5, SplitTag::PrivateTest),
        ]
        .into_iter()
        .map(|(emotion, usage)| RawRecord {
            emotion,
            pixels: pixels.clone(),
            usage,
        })
        .collect()
    }

    #[test]
    fn artifact_names_follow_dataset_and_split() {
        let layout = layout(Path::new("/data"), false);
        let config = DatasetConfig::fer2013();
        let train = layout.artifacts(&config, SplitTag::Training);
        assert_eq!(train.images, Path::new("/data/prepared/images/fer2013_images.npy"));
        assert_eq!(
            train.labels,
            Path::new("/data/prepared/labels/fer2013_images_labels.npy")
        );
        let private = layout.artifacts(&config, SplitTag::PrivateTest);
        assert_eq!(
            private.labels,
            Path::new("/data/prepared/labels/fer2013_private_test_images_labels.npy")
        );
        assert_eq!(layout.raw_path(&config), Path::new("/data/raw/fer2013.csv"));
    }

    #[test]
    fn prepare_then_load_round_trips() {
        let dir = TempDir::new().expect("tempdir");
        let materializer = DatasetMaterializer::new(DatasetConfig::fer2013(), layout(dir.path(), true));
        let report = materializer
            .prepare(&rows(), &codec(), &PrepareOptions::default(), &NoProgress)
            .expect("prepare");
        assert_eq!(report.splits.len(), 2);
        assert!(!materializer.artifacts(SplitTag::PrivateTest).images.exists());

        let loaded = materializer.load(false).expect("load");
        assert_eq!(loaded.train.images.shape(), &[2, 48, 48, 1]);
        assert_eq!(loaded.train.labels.shape(), &[2, 7]);
        assert_eq!(loaded.train.labels[(1, 2)], 1.0);
        assert_eq!(loaded.test.images.shape(), &[1, 48, 48, 1]);
        assert!((loaded.test.images[(0, 10, 10, 0)] - 90.0 / 255.0).abs() < 0.01);
    }

    #[test]
    fn private_split_is_loadable_when_requested() {
        let dir = TempDir::new().expect("tempdir");
        let materializer = DatasetMaterializer::new(DatasetConfig::fer2013(), layout(dir.path(), true));
        assert!(!materializer.is_prepared(true));
        let options = PrepareOptions {
            include_private_test: true,
            ..Default::default()
        };
        let report = materializer
            .prepare(&rows(), &codec(), &options, &NoProgress)
            .expect("prepare");
        assert_eq!(report.split(SplitTag::PrivateTest).map(|s| s.kept), Some(1));
        assert!(materializer.is_prepared(true));

        let loaded = materializer.load(true).expect("load private");
        assert_eq!(loaded.test_split, SplitTag::PrivateTest);
        assert_eq!(loaded.test.labels[(0, 5)], 1.0);
    }

    #[test]
    fn load_before_prepare_reports_not_prepared() {
        let dir = TempDir::new().expect("tempdir");
        let materializer = DatasetMaterializer::new(DatasetConfig::fer2013(), layout(dir.path(), true));
        let err = materializer.load(false).expect_err("nothing prepared");
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::NotPrepared { .. })
        ));
    }

    #[test]
    fn prepare_does_not_create_directories() {
        let dir = TempDir::new().expect("tempdir");
        let materializer = DatasetMaterializer::new(DatasetConfig::fer2013(), layout(dir.path(), false));
        let err = materializer
            .prepare(&rows(), &codec(), &PrepareOptions::default(), &NoProgress)
            .expect_err("missing output directories");
        assert!(format!("{err:#}").contains("failed to write"));
        assert!(!dir.path().join("prepared").exists());
    }

    #[test]
    fn empty_split_is_written_and_loaded() {
        let dir = TempDir::new().expect("tempdir");
        let materializer = DatasetMaterializer::new(DatasetConfig::fer2013(), layout(dir.path(), true));
        let only_training: Vec<RawRecord> = rows()
            .into_iter()
            .filter(|row| row.usage == SplitTag::Training)
            .collect();
        materializer
            .prepare(&only_training, &codec(), &PrepareOptions::default(), &NoProgress)
            .expect("prepare");
        let loaded = materializer.load(false).expect("load");
        assert!(loaded.test.is_empty());
        assert_eq!(loaded.test.labels.shape(), &[0, 7]);
    }

    #[test]
    fn wrong_label_width_is_a_shape_mismatch() {
        let dir = TempDir::new().expect("tempdir");
        let materializer = DatasetMaterializer::new(DatasetConfig::fer2013(), layout(dir.path(), true));
        materializer
            .prepare(&rows(), &codec(), &PrepareOptions::default(), &NoProgress)
            .expect("prepare");
        let labels = materializer.artifacts(SplitTag::Training).labels;
        write_npy(&labels, &Array2::<f32>::zeros((2, 5))).expect("overwrite labels");

        let err = materializer.load(false).expect_err("5 columns instead of 7");
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::ShapeMismatch { .. })
        ));
    }
}
