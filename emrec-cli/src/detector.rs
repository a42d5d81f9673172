//! Face detector construction from settings.

use std::sync::Arc;

use anyhow::{Context, Result};
use emrec_core::{
    BorderSpec, DetectorParams, EmotionVocabulary, FaceDetector, FaceLocator, HaarCascade,
    ImageNormalizer, RecordCodec, YuNetFaceDetector, YuNetOptions,
};
use emrec_utils::config::{AppSettings, DetectorBackend};
use log::info;

pub fn build_detector(settings: &AppSettings) -> Result<Arc<dyn FaceDetector>> {
    match settings.detector.backend {
        DetectorBackend::Haar => {
            let path = settings.cascade_path();
            let cascade = HaarCascade::load(&path)
                .with_context(|| format!("failed to load cascade {}", path.display()))?;
            info!(
                "Loaded Haar cascade {} ({} stages, {}x{} window)",
                path.display(),
                cascade.stage_count(),
                cascade.window_size().0,
                cascade.window_size().1
            );
            Ok(Arc::new(cascade))
        }
        DetectorBackend::Yunet => {
            let path = settings.model_path();
            let options = YuNetOptions::from(&settings.detector);
            info!(
                "Loading YuNet model {} at {}x{}",
                path.display(),
                options.input_width,
                options.input_height
            );
            Ok(Arc::new(YuNetFaceDetector::load(&path, options)?))
        }
    }
}

pub fn build_normalizer(settings: &AppSettings, face_size: u32) -> Result<ImageNormalizer> {
    let locator = FaceLocator::new(
        build_detector(settings)?,
        DetectorParams::from(&settings.detector),
    );
    Ok(ImageNormalizer::new(
        locator,
        face_size,
        BorderSpec::from(&settings.border),
    ))
}

pub fn build_codec(
    settings: &AppSettings,
    vocabulary: EmotionVocabulary,
    face_size: u32,
) -> Result<RecordCodec> {
    Ok(RecordCodec::new(
        vocabulary,
        build_normalizer(settings, face_size)?,
    ))
}
