//! Haar cascade face detector.
//!
//! Loads boosted cascades in OpenCV's XML storage format (`stageType` BOOST,
//! `featureType` HAAR) and evaluates them over an image pyramid. Window sums come from
//! integral images; each window is variance-normalised over its inner area before the
//! weak classifiers run.

use std::{fs, path::Path};

use anyhow::{Context, Result, bail};
use emrec_utils::timing_guard;
use image::{GrayImage, imageops::FilterType};
use imageproc::integral_image::{integral_image, integral_squared_image};
use log::debug;
use quick_xml::{Reader, events::Event};

use crate::detector::{DetectorParams, FaceDetector, FaceRect};
use crate::grouping::{GROUP_EPS, group_rectangles};

#[derive(Debug, Clone, Copy, PartialEq)]
struct WeightedRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct HaarFeature {
    rects: Vec<WeightedRect>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct SplitNode {
    left: i32,
    right: i32,
    feature: usize,
    threshold: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct WeakClassifier {
    nodes: Vec<SplitNode>,
    leaves: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Stage {
    threshold: f64,
    classifiers: Vec<WeakClassifier>,
}

/// A boosted Haar cascade ready for multi-scale detection.
#[derive(Debug, Clone)]
pub struct HaarCascade {
    window_width: u32,
    window_height: u32,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Load a cascade XML file from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        anyhow::ensure!(path.exists(), "cascade file not found: {}", path.display());
        let xml = fs::read_to_string(path)
            .with_context(|| format!("failed to read cascade {}", path.display()))?;
        let cascade = Self::from_xml_str(&xml)
            .with_context(|| format!("failed to parse cascade {}", path.display()))?;
        debug!(
            "Loaded cascade {} ({} stages, {} features, {}x{} window)",
            path.display(),
            cascade.stages.len(),
            cascade.features.len(),
            cascade.window_width,
            cascade.window_height
        );
        Ok(cascade)
    }

    /// Parse a cascade from XML text.
    pub fn from_xml_str(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut builder = CascadeBuilder::default();
        let mut path: Vec<String> = Vec::new();
        let mut buf = Vec::new();
        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(ref e)) => {
                    path.push(String::from_utf8_lossy(e.name().as_ref()).into_owned());
                    builder.open(&path)?;
                }
                Ok(Event::End(_)) => {
                    path.pop();
                }
                Ok(Event::Text(ref t)) => {
                    let text = std::str::from_utf8(t).context("cascade text is not UTF-8")?;
                    builder.text(&path, text)?;
                }
                Ok(Event::Eof) => break,
                Err(e) => bail!(
                    "XML error at position {}: {e}",
                    reader.buffer_position()
                ),
                _ => {}
            }
            buf.clear();
        }

        builder.finish()
    }

    /// Training window size `(width, height)`.
    pub fn window_size(&self) -> (u32, u32) {
        (self.window_width, self.window_height)
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Scan every pyramid level and return raw window hits in image coordinates.
    pub fn detect_candidates(&self, image: &GrayImage, params: &DetectorParams) -> Vec<FaceRect> {
        let _guard = timing_guard("emrec_core::cascade_scan", log::Level::Trace);
        let (img_w, img_h) = image.dimensions();
        let max_size = if params.max_size == 0 {
            (img_w, img_h)
        } else {
            (params.max_size, params.max_size)
        };

        let mut hits = Vec::new();
        let mut factor = 1.0f64;
        loop {
            let win_w = (f64::from(self.window_width) * factor).round_ties_even() as u32;
            let win_h = (f64::from(self.window_height) * factor).round_ties_even() as u32;
            if win_w > max_size.0 || win_h > max_size.1 {
                break;
            }

            let scaled_w = (f64::from(img_w) / factor).round_ties_even() as u32;
            let scaled_h = (f64::from(img_h) / factor).round_ties_even() as u32;
            if scaled_w < self.window_width || scaled_h < self.window_height {
                break;
            }

            if win_w >= params.min_size && win_h >= params.min_size {
                let level = if scaled_w == img_w && scaled_h == img_h {
                    image.clone()
                } else {
                    image::imageops::resize(image, scaled_w, scaled_h, FilterType::Triangle)
                };
                self.scan_level(&level, factor, (win_w, win_h), &mut hits);
            }

            factor *= params.scale_factor;
        }
        hits
    }

    fn scan_level(
        &self,
        level: &GrayImage,
        factor: f64,
        window: (u32, u32),
        hits: &mut Vec<FaceRect>,
    ) {
        let integrals = Integrals::new(level);
        let step = if factor >= 2.0 { 1 } else { 2 };
        let last_x = level.width() - self.window_width;
        let last_y = level.height() - self.window_height;

        let mut y = 0;
        while y <= last_y {
            let mut x = 0;
            while x <= last_x {
                match self.evaluate_window(&integrals, x, y) {
                    WindowVerdict::Accepted => hits.push(FaceRect::new(
                        (f64::from(x) * factor).round_ties_even() as i32,
                        (f64::from(y) * factor).round_ties_even() as i32,
                        window.0 as i32,
                        window.1 as i32,
                    )),
                    WindowVerdict::RejectedAtFirstStage => x += step,
                    WindowVerdict::Rejected => {}
                }
                x += step;
            }
            y += step;
        }
    }

    fn evaluate_window(&self, integrals: &Integrals, x: u32, y: u32) -> WindowVerdict {
        let inv_norm = integrals.inverse_norm(x, y, self.window_width, self.window_height);
        for (index, stage) in self.stages.iter().enumerate() {
            let mut sum = 0.0;
            for classifier in &stage.classifiers {
                let mut node_index = 0i32;
                loop {
                    let node = &classifier.nodes[node_index as usize];
                    let value = self.features[node.feature]
                        .rects
                        .iter()
                        .map(|r| r.weight * integrals.rect_sum(x + r.x, y + r.y, r.width, r.height))
                        .sum::<f64>()
                        * inv_norm;
                    node_index = if value < node.threshold {
                        node.left
                    } else {
                        node.right
                    };
                    if node_index <= 0 {
                        break;
                    }
                }
                sum += classifier.leaves[(-node_index) as usize];
            }
            if sum < stage.threshold {
                return if index == 0 {
                    WindowVerdict::RejectedAtFirstStage
                } else {
                    WindowVerdict::Rejected
                };
            }
        }
        WindowVerdict::Accepted
    }
}

impl FaceDetector for HaarCascade {
    fn detect_multi_scale(
        &self,
        image: &GrayImage,
        params: &DetectorParams,
    ) -> Result<Vec<FaceRect>> {
        anyhow::ensure!(
            params.scale_factor > 1.0,
            "scale factor must be greater than 1.0 (got {})",
            params.scale_factor
        );
        let candidates = self.detect_candidates(image, params);
        Ok(group_rectangles(&candidates, params.min_neighbors, GROUP_EPS))
    }

    fn name(&self) -> &str {
        "haar"
    }
}

enum WindowVerdict {
    Accepted,
    RejectedAtFirstStage,
    Rejected,
}

/// Plain and squared integral images of one pyramid level.
struct Integrals {
    sum: Vec<u64>,
    squared: Vec<u64>,
    stride: usize,
}

impl Integrals {
    fn new(image: &GrayImage) -> Self {
        let sum = integral_image::<_, u64>(image);
        let squared = integral_squared_image::<_, u64>(image);
        Self {
            stride: sum.width() as usize,
            sum: sum.into_raw(),
            squared: squared.into_raw(),
        }
    }

    fn corner_sum(table: &[u64], stride: usize, x: u32, y: u32, w: u32, h: u32) -> u64 {
        let at = |cx: u32, cy: u32| table[cy as usize * stride + cx as usize];
        (at(x + w, y + h) + at(x, y)) - (at(x + w, y) + at(x, y + h))
    }

    fn rect_sum(&self, x: u32, y: u32, w: u32, h: u32) -> f64 {
        Self::corner_sum(&self.sum, self.stride, x, y, w, h) as f64
    }

    /// `1 / (std-dev * area)` over the window shrunk by one pixel on every side.
    fn inverse_norm(&self, x: u32, y: u32, win_w: u32, win_h: u32) -> f64 {
        let (w, h) = (win_w - 2, win_h - 2);
        let area = f64::from(w) * f64::from(h);
        let sum = Self::corner_sum(&self.sum, self.stride, x + 1, y + 1, w, h) as f64;
        let squared = Self::corner_sum(&self.squared, self.stride, x + 1, y + 1, w, h) as f64;
        let norm = area * squared - sum * sum;
        let norm = if norm > 0.0 { norm.sqrt() } else { 1.0 };
        1.0 / norm
    }
}

/// Accumulates cascade pieces while walking the XML tree.
#[derive(Default)]
struct CascadeBuilder {
    stage_type: Option<String>,
    feature_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl CascadeBuilder {
    fn open(&mut self, path: &[String]) -> Result<()> {
        let names: Vec<&str> = path.iter().map(String::as_str).collect();
        match names.as_slice() {
            [.., "stages", "_"] => self.stages.push(Stage::default()),
            [.., "weakClassifiers", "_"] => self
                .stages
                .last_mut()
                .context("weak classifier outside of a stage")?
                .classifiers
                .push(WeakClassifier::default()),
            [.., "features", "_"] => self.features.push(HaarFeature::default()),
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, path: &[String], text: &str) -> Result<()> {
        let names: Vec<&str> = path.iter().map(String::as_str).collect();
        match names.as_slice() {
            [_, _, "stageType"] => self.stage_type = Some(text.trim().to_string()),
            [_, _, "featureType"] => self.feature_type = Some(text.trim().to_string()),
            [_, _, "width"] => self.width = Some(parse_number(text, "width")?),
            [_, _, "height"] => self.height = Some(parse_number(text, "height")?),
            [.., "stages", "_", "stageThreshold"] => {
                self.current_stage()?.threshold = parse_number(text, "stageThreshold")?;
            }
            [.., "weakClassifiers", "_", "internalNodes"] => {
                let values = parse_numbers(text, "internalNodes")?;
                anyhow::ensure!(
                    !values.is_empty() && values.len().is_multiple_of(4),
                    "internalNodes must hold groups of 4 values (got {})",
                    values.len()
                );
                let nodes = values
                    .chunks_exact(4)
                    .map(|chunk| SplitNode {
                        left: chunk[0] as i32,
                        right: chunk[1] as i32,
                        feature: chunk[2] as usize,
                        threshold: chunk[3],
                    })
                    .collect();
                self.current_classifier()?.nodes = nodes;
            }
            [.., "weakClassifiers", "_", "leafValues"] => {
                self.current_classifier()?.leaves = parse_numbers(text, "leafValues")?;
            }
            [.., "features", "_", "rects", "_"] => {
                let values = parse_numbers(text, "rects")?;
                anyhow::ensure!(
                    values.len() == 5,
                    "feature rectangle must be 'x y w h weight' (got {text:?})"
                );
                let rect = WeightedRect {
                    x: values[0] as u32,
                    y: values[1] as u32,
                    width: values[2] as u32,
                    height: values[3] as u32,
                    weight: values[4],
                };
                self.features
                    .last_mut()
                    .context("feature rectangle outside of a feature")?
                    .rects
                    .push(rect);
            }
            [.., "features", "_", "tilted"] => {
                anyhow::ensure!(
                    text.trim() == "0",
                    "tilted Haar features are not supported"
                );
            }
            _ => {}
        }
        Ok(())
    }

    fn current_stage(&mut self) -> Result<&mut Stage> {
        self.stages.last_mut().context("stage value outside of a stage")
    }

    fn current_classifier(&mut self) -> Result<&mut WeakClassifier> {
        self.current_stage()?
            .classifiers
            .last_mut()
            .context("classifier value outside of a weak classifier")
    }

    fn finish(self) -> Result<HaarCascade> {
        match self.stage_type.as_deref() {
            Some("BOOST") => {}
            Some(other) => bail!("unsupported stageType '{other}' (expected BOOST)"),
            None => bail!("missing stageType; only the current OpenCV cascade format is supported"),
        }
        match self.feature_type.as_deref() {
            Some("HAAR") => {}
            Some(other) => bail!("unsupported featureType '{other}' (expected HAAR)"),
            None => bail!("missing featureType"),
        }
        let width = self.width.context("missing cascade window width")?;
        let height = self.height.context("missing cascade window height")?;
        anyhow::ensure!(
            width > 2 && height > 2,
            "cascade window {width}x{height} is too small"
        );
        anyhow::ensure!(!self.stages.is_empty(), "cascade has no stages");

        for (stage_index, stage) in self.stages.iter().enumerate() {
            anyhow::ensure!(
                !stage.classifiers.is_empty(),
                "stage {stage_index} has no weak classifiers"
            );
            for classifier in &stage.classifiers {
                anyhow::ensure!(
                    !classifier.nodes.is_empty(),
                    "stage {stage_index} has a classifier without nodes"
                );
                for node in &classifier.nodes {
                    anyhow::ensure!(
                        node.feature < self.features.len(),
                        "stage {stage_index} references missing feature {}",
                        node.feature
                    );
                    for child in [node.left, node.right] {
                        if child > 0 {
                            anyhow::ensure!(
                                (child as usize) < classifier.nodes.len(),
                                "stage {stage_index} references missing node {child}"
                            );
                        } else {
                            anyhow::ensure!(
                                ((-child) as usize) < classifier.leaves.len(),
                                "stage {stage_index} references missing leaf {}",
                                -child
                            );
                        }
                    }
                }
            }
        }

        for (index, feature) in self.features.iter().enumerate() {
            anyhow::ensure!(!feature.rects.is_empty(), "feature {index} has no rectangles");
            for rect in &feature.rects {
                anyhow::ensure!(
                    rect.x + rect.width <= width && rect.y + rect.height <= height,
                    "feature {index} extends outside the {width}x{height} window"
                );
            }
        }

        Ok(HaarCascade {
            window_width: width,
            window_height: height,
            stages: self.stages,
            features: self.features,
        })
    }
}

fn parse_numbers(text: &str, field: &str) -> Result<Vec<f64>> {
    text.split_ascii_whitespace()
        .map(|token| {
            token
                .parse::<f64>()
                .with_context(|| format!("invalid number {token:?} in {field}"))
        })
        .collect()
}

fn parse_number<T: std::str::FromStr>(text: &str, field: &str) -> Result<T> {
    text.trim()
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("invalid {field} value {:?}", text.trim()))
}
