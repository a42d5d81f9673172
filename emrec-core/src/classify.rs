//! Seams for emotion classifiers trained on prepared datasets.
//!
//! Network definitions live outside this crate; anything implementing
//! [`EmotionClassifier`] can be fed normalized faces through [`classify`].

use anyhow::{Context, Result};
use ndarray::{Array2, Array4, ArrayView4, Axis};
use serde::Serialize;

use crate::dataset::TensorPair;
use crate::normalizer::NormalizedImage;
use crate::vocabulary::EmotionVocabulary;

/// Produces per-category scores for a batch shaped `(N, s, s, 1)`.
pub trait EmotionClassifier {
    fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>>;
}

/// Fits a classifier on a training split, monitoring a validation split.
pub trait EmotionTrainer {
    type Model: EmotionClassifier;

    fn fit(&mut self, train: &TensorPair, validation: &TensorPair) -> Result<Self::Model>;
}

/// Most likely emotion for one image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmotionPrediction {
    pub label: usize,
    pub name: String,
    pub score: f32,
}

/// Stack normalized faces into a `(N, s, s, 1)` batch.
pub fn images_to_batch(images: &[NormalizedImage]) -> Result<Array4<f32>> {
    let size = images.first().map_or(0, NormalizedImage::size);
    anyhow::ensure!(
        images.iter().all(|image| image.size() == size),
        "all images in a batch must share one size"
    );
    let mut data = Vec::with_capacity(images.len() * size * size);
    for image in images {
        data.extend(image.as_array().iter().copied());
    }
    Array4::from_shape_vec((images.len(), size, size, 1), data).context("failed to build batch")
}

/// Run `classifier` over `images` and name each arg-max category.
pub fn classify<C>(
    classifier: &C,
    vocabulary: &EmotionVocabulary,
    images: &[NormalizedImage],
) -> Result<Vec<EmotionPrediction>>
where
    C: EmotionClassifier + ?Sized,
{
    if images.is_empty() {
        return Ok(Vec::new());
    }
    let batch = images_to_batch(images)?;
    let scores = classifier.predict(batch.view())?;
    anyhow::ensure!(
        scores.shape() == [images.len(), vocabulary.len()],
        "classifier returned scores of shape {:?}; expected ({}, {})",
        scores.shape(),
        images.len(),
        vocabulary.len()
    );

    scores
        .axis_iter(Axis(0))
        .map(|row| {
            let (label, score) = row
                .iter()
                .copied()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (index, score)| {
                    if score > best.1 { (index, score) } else { best }
                });
            let name = vocabulary
                .name(label)
                .with_context(|| format!("label {label} has no name"))?;
            Ok(EmotionPrediction {
                label,
                name: name.to_string(),
                score,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scores "happy" for bright faces and "sad" for dark ones.
    struct BrightnessClassifier;

    impl EmotionClassifier for BrightnessClassifier {
        fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
            let mut scores = Array2::zeros((batch.shape()[0], 7));
            for (i, image) in batch.axis_iter(Axis(0)).enumerate() {
                let mean = image.mean().unwrap_or(0.0);
                let label = if mean > 0.5 { 3 } else { 4 };
                scores[(i, label)] = mean.max(1.0 - mean);
            }
            Ok(scores)
        }
    }

    /// Memorizes the most frequent training label.
    struct MajorityTrainer;

    struct MajorityClassifier(usize);

    impl EmotionClassifier for MajorityClassifier {
        fn predict(&self, batch: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
            let mut scores = Array2::zeros((batch.shape()[0], 7));
            scores.column_mut(self.0).fill(1.0);
            Ok(scores)
        }
    }

    impl EmotionTrainer for MajorityTrainer {
        type Model = MajorityClassifier;

        fn fit(&mut self, train: &TensorPair, _validation: &TensorPair) -> Result<Self::Model> {
            let counts = train.labels.sum_axis(Axis(0));
            let label = counts
                .iter()
                .enumerate()
                .fold(0, |best, (i, &c)| if c > counts[best] { i } else { best });
            Ok(MajorityClassifier(label))
        }
    }

    fn image(value: f32) -> NormalizedImage {
        NormalizedImage::try_new(Array2::from_elem((4, 4), value), 4).expect("image")
    }

    #[test]
    fn batch_has_channel_axis() {
        let batch = images_to_batch(&[image(0.1), image(0.9)]).expect("batch");
        assert_eq!(batch.shape(), &[2, 4, 4, 1]);
        assert_eq!(batch[(1, 3, 3, 0)], 0.9);
    }

    #[test]
    fn predictions_name_the_argmax() {
        let vocab = EmotionVocabulary::fer2013();
        let predictions =
            classify(&BrightnessClassifier, &vocab, &[image(0.9), image(0.2)]).expect("classify");
        assert_eq!(predictions[0].name, "happy");
        assert_eq!(predictions[1].name, "sad");
        assert!((predictions[1].score - 0.8).abs() < 1e-6);
    }

    #[test]
    fn wrong_score_width_is_rejected() {
        let vocab = EmotionVocabulary::new(["a", "b"]);
        let err = classify(&BrightnessClassifier, &vocab, &[image(0.5)]).expect_err("7 != 2");
        assert!(err.to_string().contains("expected (1, 2)"));
    }

    #[test]
    fn trainer_output_plugs_into_classify() {
        let labels = Array2::from_shape_vec(
            (3, 7),
            [
                [0., 0., 0., 0., 0., 1., 0.],
                [0., 0., 0., 0., 0., 1., 0.],
                [1., 0., 0., 0., 0., 0., 0.],
            ]
            .concat(),
        )
        .expect("labels");
        let train = TensorPair {
            images: Array4::zeros((3, 4, 4, 1)),
            labels,
        };
        let model = MajorityTrainer.fit(&train, &train).expect("fit");
        let vocab = EmotionVocabulary::fer2013();
        let predictions = classify(&model, &vocab, &[image(0.3)]).expect("classify");
        assert_eq!(predictions[0].name, "surprised");
    }
}
