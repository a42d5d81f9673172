//! Ordered emotion categories and their one-hot encoding.

use ndarray::Array1;
use serde::Serialize;

use crate::error::DatasetError;

/// Category names of the fer2013 dataset, in label order.
pub const FER2013_EMOTIONS: [&str; 7] = [
    "angry",
    "disgusted",
    "fearful",
    "happy",
    "sad",
    "surprised",
    "neutral",
];

/// Ordered list of category names; a name's position is its integer label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmotionVocabulary {
    names: Vec<String>,
}

impl EmotionVocabulary {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// The seven fer2013 categories.
    pub fn fer2013() -> Self {
        Self::new(FER2013_EMOTIONS)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn name(&self, label: usize) -> Option<&str> {
        self.names.get(label).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Encode `label` as a one-hot vector of vocabulary length.
    pub fn one_hot(&self, label: usize) -> Result<LabelVector, DatasetError> {
        if label >= self.names.len() {
            return Err(DatasetError::LabelOutOfRange {
                label,
                size: self.names.len(),
            });
        }
        let mut vector = Array1::<f32>::zeros(self.names.len());
        vector[label] = 1.0;
        Ok(LabelVector(vector))
    }
}

/// One-hot label vector: exactly one position holds `1.0`, the rest `0.0`.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelVector(Array1<f32>);

impl LabelVector {
    /// Position of the hot entry.
    pub fn label(&self) -> usize {
        self.0
            .iter()
            .position(|value| *value == 1.0)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_array(&self) -> &Array1<f32> {
        &self.0
    }
}
