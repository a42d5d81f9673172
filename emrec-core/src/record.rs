//! Raw dataset rows and their conversion into training pairs.

use std::{fmt, str::FromStr};

use anyhow::Result;
use image::GrayImage;
use serde::Serialize;

use crate::normalizer::{ImageNormalizer, NormalizedImage, SourceImage};
use crate::vocabulary::{EmotionVocabulary, LabelVector};

/// Dataset partition a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum SplitTag {
    Training,
    PublicTest,
    PrivateTest,
}

impl SplitTag {
    pub const ALL: [SplitTag; 3] = [
        SplitTag::Training,
        SplitTag::PublicTest,
        SplitTag::PrivateTest,
    ];

    /// Spelling used in the raw file's `Usage` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitTag::Training => "Training",
            SplitTag::PublicTest => "PublicTest",
            SplitTag::PrivateTest => "PrivateTest",
        }
    }

    /// Stem used in prepared artifact names.
    pub fn file_stem(&self) -> &'static str {
        match self {
            SplitTag::Training => "images",
            SplitTag::PublicTest => "test_images",
            SplitTag::PrivateTest => "private_test_images",
        }
    }
}

impl fmt::Display for SplitTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SplitTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "Training" => Ok(SplitTag::Training),
            "PublicTest" => Ok(SplitTag::PublicTest),
            "PrivateTest" => Ok(SplitTag::PrivateTest),
            other => Err(format!("unknown split tag '{other}'")),
        }
    }
}

/// One raw row: integer emotion label, space-separated pixel string and split tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub emotion: usize,
    pub pixels: String,
    pub usage: SplitTag,
}

/// Why a record was left out of its split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoFace,
    ResizeFailed,
    MalformedPixels,
    Undecodable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SkipReason::NoFace => "no face",
            SkipReason::ResizeFailed => "resize failed",
            SkipReason::MalformedPixels => "malformed pixels",
            SkipReason::Undecodable => "undecodable",
        })
    }
}

/// Result of decoding one record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Encoded {
        image: NormalizedImage,
        label: LabelVector,
    },
    Skipped(SkipReason),
}

/// Converts raw records into `(image, label)` pairs.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    vocabulary: EmotionVocabulary,
    normalizer: ImageNormalizer,
}

impl RecordCodec {
    pub fn new(vocabulary: EmotionVocabulary, normalizer: ImageNormalizer) -> Self {
        Self {
            vocabulary,
            normalizer,
        }
    }

    pub fn vocabulary(&self) -> &EmotionVocabulary {
        &self.vocabulary
    }

    pub fn normalizer(&self) -> &ImageNormalizer {
        &self.normalizer
    }

    /// One-hot encode a label. Out-of-range labels are fatal.
    pub fn to_vector(&self, label: usize) -> Result<LabelVector> {
        Ok(self.vocabulary.one_hot(label)?)
    }

    /// Parse a pixel string and normalize it with the border enabled.
    ///
    /// The row is replicated into three channels and handed over in blue-green-red
    /// order, the layout the grayscale conversion expects. The inner `Err` carries the
    /// reason a recoverable failure was skipped; the outer one is fatal.
    pub fn to_image(&self, pixels: &str) -> Result<Result<NormalizedImage, SkipReason>> {
        let size = self.normalizer.face_size();
        let Some(gray) = parse_pixels(pixels, size) else {
            return Ok(Err(SkipReason::MalformedPixels));
        };
        let bgr = emrec_utils::reverse_channels(&emrec_utils::gray_to_rgb(&gray));

        match self.normalizer.normalize(&SourceImage::Bgr(bgr), true) {
            Ok(image) => Ok(Ok(image)),
            Err(err) => match err.skip_reason() {
                Some(reason) => Ok(Err(reason)),
                None => Err(anyhow::Error::new(err)),
            },
        }
    }

    /// Decode a full record: label first, so a bad label aborts even for faceless rows.
    pub fn decode(&self, record: &RawRecord) -> Result<RecordOutcome> {
        let label = self.to_vector(record.emotion)?;
        Ok(match self.to_image(&record.pixels)? {
            Ok(image) => RecordOutcome::Encoded { image, label },
            Err(reason) => RecordOutcome::Skipped(reason),
        })
    }
}

/// Parse exactly `size * size` whitespace-separated intensities.
pub fn parse_pixels(pixels: &str, size: u32) -> Option<GrayImage> {
    let expected = (size as usize) * (size as usize);
    let mut values = Vec::with_capacity(expected);
    for token in pixels.split_ascii_whitespace() {
        values.push(token.parse::<u8>().ok()?);
        if values.len() > expected {
            return None;
        }
    }
    if values.len() != expected || expected == 0 {
        return None;
    }
    GrayImage::from_raw(size, size, values)
}
