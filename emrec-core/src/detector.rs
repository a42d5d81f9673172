use std::fmt;

use anyhow::Result;
use emrec_utils::config::DetectorSettings;
use image::GrayImage;

/// Axis-aligned face box in integer pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaceRect {
    /// The x-coordinate of the top-left corner.
    pub x: i32,
    /// The y-coordinate of the top-left corner.
    pub y: i32,
    /// The width of the box.
    pub width: i32,
    /// The height of the box.
    pub height: i32,
}

impl FaceRect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Box area, zero for degenerate boxes.
    pub fn area(&self) -> i64 {
        i64::from(self.width.max(0)) * i64::from(self.height.max(0))
    }

    /// Calculates the Intersection over Union (IoU) with another box.
    pub fn iou(&self, other: &Self) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = i64::from((x2 - x1).max(0)) * i64::from((y2 - y1).max(0));
        if intersection <= 0 {
            return 0.0;
        }

        let union = self.area() + other.area() - intersection;
        if union <= 0 {
            0.0
        } else {
            intersection as f32 / union as f32
        }
    }

    /// Intersect the box with a `width` x `height` image.
    ///
    /// Returns `(x, y, w, h)` of the visible part, or `None` when nothing of the box
    /// lies inside the image.
    pub fn clip_to(&self, width: u32, height: u32) -> Option<(u32, u32, u32, u32)> {
        let x0 = self.x.max(0) as i64;
        let y0 = self.y.max(0) as i64;
        let x1 = (i64::from(self.x) + i64::from(self.width)).min(i64::from(width));
        let y1 = (i64::from(self.y) + i64::from(self.height)).min(i64::from(height));
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some((x0 as u32, y0 as u32, (x1 - x0) as u32, (y1 - y0) as u32))
    }
}

impl fmt::Display for FaceRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} at ({}, {})",
            self.width, self.height, self.x, self.y
        )
    }
}

/// Multi-scale detection parameters handed to every [`FaceDetector`] call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectorParams {
    /// Pyramid step between scales (must exceed 1.0).
    pub scale_factor: f64,
    /// Candidates need more than this many grouped neighbours to survive.
    pub min_neighbors: u32,
    /// Smallest face side considered; 0 disables the bound.
    pub min_size: u32,
    /// Largest face side considered; 0 means the image size.
    pub max_size: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: 1.3,
            min_neighbors: 5,
            min_size: 0,
            max_size: 0,
        }
    }
}

impl From<&DetectorSettings> for DetectorParams {
    fn from(settings: &DetectorSettings) -> Self {
        Self {
            scale_factor: settings.scale_factor,
            min_neighbors: settings.min_neighbors,
            min_size: settings.min_size,
            max_size: settings.max_size,
        }
    }
}

/// A face detector that can be queried over a grayscale image.
///
/// Implementations must be shareable across the rayon pool used for parallel
/// split building.
pub trait FaceDetector: Send + Sync + fmt::Debug {
    /// Return every face candidate found in `image`, in detector order.
    fn detect_multi_scale(&self, image: &GrayImage, params: &DetectorParams)
    -> Result<Vec<FaceRect>>;

    /// Short identifier used in logs.
    fn name(&self) -> &str;
}
