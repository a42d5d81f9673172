//! Building one dataset split from raw rows.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::Result;
use emrec_utils::timing_guard;
use log::debug;
use rayon::prelude::*;
use serde::Serialize;

use crate::error::DatasetError;
use crate::normalizer::NormalizedImage;
use crate::progress::{CancelToken, ProgressSink, ProgressUpdate};
use crate::record::{RawRecord, RecordCodec, RecordOutcome, SkipReason, SplitTag};
use crate::vocabulary::LabelVector;

/// Row accounting for one split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SplitStats {
    pub split: SplitTag,
    /// Rows carrying this split's tag.
    pub total: usize,
    /// Rows that produced an image and label.
    pub kept: usize,
    /// Skipped rows per reason.
    pub skipped: BTreeMap<SkipReason, usize>,
}

impl SplitStats {
    fn new(split: SplitTag, total: usize) -> Self {
        Self {
            split,
            total,
            kept: 0,
            skipped: BTreeMap::new(),
        }
    }

    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }
}

/// Parallel image and label sequences of one split, in input order.
#[derive(Debug, Clone)]
pub struct SplitData {
    pub images: Vec<NormalizedImage>,
    pub labels: Vec<LabelVector>,
    pub stats: SplitStats,
}

impl SplitData {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

/// Filters rows by split tag and decodes them through a [`RecordCodec`].
#[derive(Debug, Clone)]
pub struct SplitBuilder<'a> {
    codec: &'a RecordCodec,
    parallel: bool,
    cancel: CancelToken,
}

impl<'a> SplitBuilder<'a> {
    pub fn new(codec: &'a RecordCodec) -> Self {
        Self {
            codec,
            parallel: false,
            cancel: CancelToken::default(),
        }
    }

    /// Decode rows on the rayon pool. Output order is unchanged.
    pub fn parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build the split for `tag`.
    ///
    /// Recoverable per-row failures are counted and skipped; label errors, detector
    /// failures and cancellation abort the whole split.
    pub fn build(
        &self,
        rows: &[RawRecord],
        tag: SplitTag,
        progress_label: &str,
        progress: &dyn ProgressSink,
    ) -> Result<SplitData> {
        let mut guard = timing_guard(format!("emrec_core::split[{tag}]"), log::Level::Debug);
        let selected: Vec<&RawRecord> = rows.iter().filter(|row| row.usage == tag).collect();
        let total = selected.len();
        debug!("{progress_label}: {total} row(s) tagged {tag}");

        let processed = AtomicUsize::new(0);
        let kept = AtomicUsize::new(0);
        let decode_one = |row: &RawRecord| -> Result<RecordOutcome> {
            if self.cancel.is_cancelled() {
                return Err(DatasetError::Cancelled { split: tag }.into());
            }
            let outcome = self.codec.decode(row)?;
            if matches!(outcome, RecordOutcome::Encoded { .. }) {
                kept.fetch_add(1, Ordering::Relaxed);
            }
            let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
            progress.report(ProgressUpdate {
                label: progress_label,
                processed: done,
                total,
                kept: kept.load(Ordering::Relaxed),
            });
            Ok(outcome)
        };

        let outcomes: Vec<RecordOutcome> = if self.parallel {
            selected
                .par_iter()
                .map(|&row| decode_one(row))
                .collect::<Result<_>>()?
        } else {
            selected
                .iter()
                .map(|&row| decode_one(row))
                .collect::<Result<_>>()?
        };

        let mut data = SplitData {
            images: Vec::with_capacity(outcomes.len()),
            labels: Vec::with_capacity(outcomes.len()),
            stats: SplitStats::new(tag, total),
        };
        for outcome in outcomes {
            match outcome {
                RecordOutcome::Encoded { image, label } => {
                    data.images.push(image);
                    data.labels.push(label);
                }
                RecordOutcome::Skipped(reason) => {
                    *data.stats.skipped.entry(reason).or_default() += 1;
                }
            }
        }
        data.stats.kept = data.images.len();
        guard.set_items(total);
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{DetectorParams, FaceDetector, FaceRect};
    use crate::locator::FaceLocator;
    use crate::normalizer::{BorderSpec, ImageNormalizer};
    use crate::progress::NoProgress;
    use crate::vocabulary::EmotionVocabulary;
    use image::GrayImage;
    use std::sync::{Arc, Mutex};

    /// Finds a face unless the bordered image is completely flat.
    #[derive(Debug)]
    struct ContrastDetector;

    impl FaceDetector for ContrastDetector {
        fn detect_multi_scale(
            &self,
            image: &GrayImage,
            _params: &DetectorParams,
        ) -> anyhow::Result<Vec<FaceRect>> {
            let first = image.get_pixel(0, 0)[0];
            if image.pixels().all(|p| p[0] == first) {
                Ok(Vec::new())
            } else {
                Ok(vec![FaceRect::new(51, 51, 48, 48)])
            }
        }

        fn name(&self) -> &str {
            "contrast"
        }
    }

    fn codec() -> RecordCodec {
        let locator = FaceLocator::new(Arc::new(ContrastDetector), DetectorParams::default());
        RecordCodec::new(
            EmotionVocabulary::fer2013(),
            ImageNormalizer::new(locator, 48, BorderSpec::default()),
        )
    }

    fn row(emotion: usize, value: u8, usage: SplitTag) -> RawRecord {
        RawRecord {
            emotion,
            pixels: vec![value.to_string(); 48 * 48].join(" "),
            usage,
        }
    }

    fn five_rows() -> Vec<RawRecord> {
        vec![
            row(0, 10, SplitTag::Training),
            row(3, 200, SplitTag::Training),
            row(6, 10, SplitTag::PublicTest),
            row(4, 10, SplitTag::Training),
            row(2, 10, SplitTag::PublicTest),
        ]
    }

    #[test]
    fn keeps_tagged_rows_with_faces_in_order() {
        let codec = codec();
        let builder = SplitBuilder::new(&codec);
        let rows = five_rows();

        let training = builder
            .build(&rows, SplitTag::Training, "training", &NoProgress)
            .expect("training split");
        assert_eq!(training.len(), 2);
        let labels: Vec<usize> = training.labels.iter().map(LabelVector::label).collect();
        assert_eq!(labels, vec![0, 4]);
        assert_eq!(training.stats.total, 3);
        assert_eq!(training.stats.skipped.get(&SkipReason::NoFace), Some(&1));

        let test = builder
            .build(&rows, SplitTag::PublicTest, "test", &NoProgress)
            .expect("test split");
        let labels: Vec<usize> = test.labels.iter().map(LabelVector::label).collect();
        assert_eq!(labels, vec![6, 2]);
        assert_eq!(test.stats.skipped_total(), 0);

        let private = builder
            .build(&rows, SplitTag::PrivateTest, "private", &NoProgress)
            .expect("private split");
        assert!(private.is_empty());
        assert_eq!(private.stats.total, 0);
    }

    #[test]
    fn parallel_build_preserves_order() {
        let codec = codec();
        let rows: Vec<RawRecord> = (0..40)
            .map(|i| row(i % 7, if i % 5 == 0 { 200 } else { 10 }, SplitTag::Training))
            .collect();

        let sequential = SplitBuilder::new(&codec)
            .build(&rows, SplitTag::Training, "seq", &NoProgress)
            .expect("sequential");
        let parallel = SplitBuilder::new(&codec)
            .parallel(true)
            .build(&rows, SplitTag::Training, "par", &NoProgress)
            .expect("parallel");

        assert_eq!(sequential.labels, parallel.labels);
        assert_eq!(sequential.stats, parallel.stats);
        assert_eq!(parallel.len(), 32);
    }

    #[test]
    fn malformed_row_is_counted_not_fatal() {
        let codec = codec();
        let mut rows = five_rows();
        rows[0].pixels = "1 2 3".into();
        let training = SplitBuilder::new(&codec)
            .build(&rows, SplitTag::Training, "training", &NoProgress)
            .expect("training split");
        assert_eq!(training.len(), 1);
        assert_eq!(
            training.stats.skipped.get(&SkipReason::MalformedPixels),
            Some(&1)
        );
    }

    #[test]
    fn bad_label_aborts_split() {
        let codec = codec();
        let mut rows = five_rows();
        rows[3].emotion = 12;
        let err = SplitBuilder::new(&codec)
            .build(&rows, SplitTag::Training, "training", &NoProgress)
            .expect_err("label 12 is out of range");
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::LabelOutOfRange { label: 12, .. })
        ));
    }

    #[test]
    fn cancelled_token_stops_split() {
        let codec = codec();
        let token = CancelToken::new();
        token.cancel();
        let err = SplitBuilder::new(&codec)
            .with_cancel(token)
            .build(&five_rows(), SplitTag::Training, "training", &NoProgress)
            .expect_err("cancelled");
        assert!(matches!(
            err.downcast_ref::<DatasetError>(),
            Some(DatasetError::Cancelled {
                split: SplitTag::Training
            })
        ));
    }

    #[test]
    fn progress_reaches_total() {
        let codec = codec();
        let seen = Mutex::new(Vec::new());
        let sink = |update: ProgressUpdate<'_>| {
            seen.lock().expect("lock").push((update.processed, update.total));
        };
        SplitBuilder::new(&codec)
            .build(&five_rows(), SplitTag::Training, "training", &sink)
            .expect("training split");
        let seen = seen.into_inner().expect("lock");
        assert_eq!(seen.last(), Some(&(3, 3)));
    }
}
