//! Turns arbitrary face images into fixed-size normalized grayscale crops.
//!
//! The pipeline is: grayscale conversion chosen by channel layout, optional gray
//! border, face location, crop, cubic resize, scale into `[0, 1]`.

use std::borrow::Cow;

use emrec_utils::{
    bgr_to_gray, config::BorderSettings, gray_to_unit_array, resize_gray, rgb_to_gray,
};
use image::{DynamicImage, GrayImage, Luma, RgbImage, imageops::FilterType};
use ndarray::Array2;
use thiserror::Error;

use crate::locator::FaceLocator;
use crate::record::SkipReason;

/// Image input accepted by the normalizer.
#[derive(Debug, Clone)]
pub enum SourceImage {
    /// Three channels stored blue-green-red.
    Bgr(RgbImage),
    /// Three channels stored red-green-blue.
    Rgb(RgbImage),
    /// Single-channel intensities.
    Gray(GrayImage),
    /// Encoded file bytes (PNG, JPEG, BMP).
    Encoded(Vec<u8>),
}

impl SourceImage {
    /// Convert to grayscale according to the channel layout of the variant.
    pub fn to_gray(&self) -> Result<Cow<'_, GrayImage>, NormalizeError> {
        match self {
            SourceImage::Bgr(image) => Ok(Cow::Owned(bgr_to_gray(image))),
            SourceImage::Rgb(image) => Ok(Cow::Owned(rgb_to_gray(image))),
            SourceImage::Gray(image) => Ok(Cow::Borrowed(image)),
            SourceImage::Encoded(bytes) => {
                let decoded = image::load_from_memory(bytes)
                    .map_err(|e| NormalizeError::Undecodable(e.to_string()))?;
                Ok(Cow::Owned(match decoded {
                    DynamicImage::ImageLuma8(gray) => gray,
                    other => rgb_to_gray(&other.to_rgb8()),
                }))
            }
        }
    }
}

/// Why an image could not be normalized.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("no face found")]
    NoFace,

    #[error("face crop {width}x{height} could not be resized to {size}x{size}")]
    Resize { width: u32, height: u32, size: u32 },

    #[error("image could not be decoded: {0}")]
    Undecodable(String),

    #[error("face detector failed: {0:#}")]
    Detector(anyhow::Error),
}

impl NormalizeError {
    /// Classify recoverable failures. `None` means the error must abort the caller.
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            NormalizeError::NoFace => Some(SkipReason::NoFace),
            NormalizeError::Resize { .. } => Some(SkipReason::ResizeFailed),
            NormalizeError::Undecodable(_) => Some(SkipReason::Undecodable),
            NormalizeError::Detector(_) => None,
        }
    }
}

/// Square crop with values in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage(Array2<f32>);

impl NormalizedImage {
    /// Wrap an array after checking that it is `size` x `size` with unit-range values.
    pub fn try_new(array: Array2<f32>, size: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(
            array.dim() == (size, size),
            "normalized image must be {size}x{size}, got {:?}",
            array.dim()
        );
        anyhow::ensure!(
            array.iter().all(|v| (0.0..=1.0).contains(v)),
            "normalized image values must lie in [0, 1]"
        );
        Ok(Self(array))
    }

    pub fn size(&self) -> usize {
        self.0.nrows()
    }

    pub fn as_array(&self) -> &Array2<f32> {
        &self.0
    }

    pub fn into_inner(self) -> Array2<f32> {
        self.0
    }

    /// Back to 8-bit grayscale, for previews.
    pub fn to_gray_image(&self) -> GrayImage {
        let size = self.size() as u32;
        GrayImage::from_fn(size, size, |x, y| {
            let value = self.0[(y as usize, x as usize)];
            Luma([(value * 255.0).round().clamp(0.0, 255.0) as u8])
        })
    }
}

/// Constant-intensity canvas that records are embedded in before detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BorderSpec {
    pub outer_margin: u32,
    pub inner_margin: u32,
    pub fill: u8,
}

impl Default for BorderSpec {
    fn default() -> Self {
        (&BorderSettings::default()).into()
    }
}

impl From<&BorderSettings> for BorderSpec {
    fn from(settings: &BorderSettings) -> Self {
        Self {
            outer_margin: settings.outer_margin,
            inner_margin: settings.inner_margin,
            fill: settings.fill,
        }
    }
}

impl BorderSpec {
    /// Embed `image` in a square canvas.
    ///
    /// The canvas side is `2 * outer_margin`, grown when needed so the image keeps at
    /// least `outer_margin - inner_margin` pixels of border. The image is centered, so
    /// a `2 * inner_margin` image lands exactly at offset `outer_margin - inner_margin`.
    pub fn apply(&self, image: &GrayImage) -> GrayImage {
        let (width, height) = image.dimensions();
        let margin = self.outer_margin.saturating_sub(self.inner_margin);
        let side = (2 * self.outer_margin).max(width.max(height) + 2 * margin);
        let offset_x = (side - width) / 2;
        let offset_y = (side - height) / 2;

        let mut canvas = GrayImage::from_pixel(side, side, Luma([self.fill]));
        for (x, y, pixel) in image.enumerate_pixels() {
            canvas.put_pixel(offset_x + x, offset_y + y, *pixel);
        }
        canvas
    }
}

/// Produces `face_size` x `face_size` normalized face crops.
#[derive(Debug, Clone)]
pub struct ImageNormalizer {
    locator: FaceLocator,
    face_size: u32,
    border: BorderSpec,
}

impl ImageNormalizer {
    pub fn new(locator: FaceLocator, face_size: u32, border: BorderSpec) -> Self {
        Self {
            locator,
            face_size,
            border,
        }
    }

    pub fn face_size(&self) -> u32 {
        self.face_size
    }

    pub fn border(&self) -> BorderSpec {
        self.border
    }

    /// Normalize one image. With `apply_border` the grayscale image is embedded in the
    /// gray canvas before the face is searched for.
    pub fn normalize(
        &self,
        source: &SourceImage,
        apply_border: bool,
    ) -> Result<NormalizedImage, NormalizeError> {
        let gray = source.to_gray()?;
        let gray = if apply_border {
            Cow::Owned(self.border.apply(&gray))
        } else {
            gray
        };
        let crop = self.crop_face(&gray)?;
        self.finish(&crop)
    }

    /// Locate the dominant face and return it cropped to the image bounds.
    pub fn crop_face(&self, gray: &GrayImage) -> Result<GrayImage, NormalizeError> {
        let face = self
            .locator
            .locate(gray)
            .map_err(NormalizeError::Detector)?
            .ok_or(NormalizeError::NoFace)?;

        let Some((x, y, w, h)) = face.clip_to(gray.width(), gray.height()) else {
            return Err(NormalizeError::Resize {
                width: 0,
                height: 0,
                size: self.face_size,
            });
        };
        Ok(image::imageops::crop_imm(gray, x, y, w, h).to_image())
    }

    fn finish(&self, crop: &GrayImage) -> Result<NormalizedImage, NormalizeError> {
        let resize_error = || NormalizeError::Resize {
            width: crop.width(),
            height: crop.height(),
            size: self.face_size,
        };
        let resized = resize_gray(crop, self.face_size, self.face_size, FilterType::CatmullRom)
            .ok_or_else(resize_error)?;
        NormalizedImage::try_new(gray_to_unit_array(&resized), self.face_size as usize)
            .map_err(|_| resize_error())
    }
}
