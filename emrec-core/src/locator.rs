use std::sync::Arc;

use anyhow::Result;
use image::GrayImage;
use log::trace;

use crate::detector::{DetectorParams, FaceDetector, FaceRect};

/// Finds the dominant face in a grayscale image.
#[derive(Debug, Clone)]
pub struct FaceLocator {
    detector: Arc<dyn FaceDetector>,
    params: DetectorParams,
}

impl FaceLocator {
    pub fn new(detector: Arc<dyn FaceDetector>, params: DetectorParams) -> Self {
        Self { detector, params }
    }

    /// Run the detector and return the largest candidate, if any.
    ///
    /// Detector failures are propagated; an image without candidates yields `None`.
    pub fn locate(&self, image: &GrayImage) -> Result<Option<FaceRect>> {
        let candidates = self.detector.detect_multi_scale(image, &self.params)?;
        trace!(
            "{} detector returned {} candidate(s)",
            self.detector.name(),
            candidates.len()
        );
        Ok(select_largest(&candidates))
    }

    pub fn params(&self) -> &DetectorParams {
        &self.params
    }

    pub fn detector(&self) -> &Arc<dyn FaceDetector> {
        &self.detector
    }
}

/// Pick the candidate with the largest area. Ties keep the earlier candidate.
pub fn select_largest(candidates: &[FaceRect]) -> Option<FaceRect> {
    let mut best = *candidates.first()?;
    for candidate in &candidates[1..] {
        if candidate.area() > best.area() {
            best = *candidate;
        }
    }
    Some(best)
}
