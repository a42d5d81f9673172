//! YuNet ONNX face detector run through `tract-onnx`.
//!
//! YuNet is anchor-free and single-scale: the image is resized to the model input,
//! so [`DetectorParams::scale_factor`] and [`DetectorParams::min_neighbors`] have no
//! meaning here and are ignored. `min_size`/`max_size` still filter the output.

use std::{fmt::Write, path::Path};

use anyhow::{Context, Result};
use emrec_utils::{config::DetectorSettings, gray_to_rgb, timing_guard};
use image::{GrayImage, imageops::FilterType};
use log::{debug, warn};
use tract_onnx::prelude::{
    Framework, Graph, InferenceModelExt, IntoTensor, SimplePlan, Tensor, TypedFact, TypedOp, tvec,
};

use crate::detector::{DetectorParams, FaceDetector, FaceRect};
use crate::grouping::{ScoredRect, non_max_suppression};

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

const STRIDES: [usize; 3] = [8, 16, 32];
const OUTPUTS_PER_STRIDE: usize = 4; // cls, obj, bbox, kps
const FUSED_COLS: usize = 15; // bbox (4) + landmarks (10) + score (1)

/// Inference options for [`YuNetFaceDetector`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct YuNetOptions {
    pub input_width: u32,
    pub input_height: u32,
    pub score_threshold: f32,
    pub nms_threshold: f32,
    /// Candidates kept before NMS; 0 keeps all.
    pub top_k: usize,
}

impl Default for YuNetOptions {
    fn default() -> Self {
        Self {
            input_width: 160,
            input_height: 160,
            score_threshold: 0.9,
            nms_threshold: 0.3,
            top_k: 5_000,
        }
    }
}

impl From<&DetectorSettings> for YuNetOptions {
    fn from(settings: &DetectorSettings) -> Self {
        Self {
            input_width: settings.input_width,
            input_height: settings.input_height,
            score_threshold: settings.score_threshold,
            nms_threshold: settings.nms_threshold,
            ..Self::default()
        }
    }
}

/// Box in model input coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct RawBox {
    x: f32,
    y: f32,
    width: f32,
    height: f32,
    score: f32,
}

#[derive(Debug)]
pub struct YuNetFaceDetector {
    runnable: RunnableModel,
    options: YuNetOptions,
}

impl YuNetFaceDetector {
    /// Load and optimize the YuNet graph, falling back to the decluttered graph when
    /// optimization fails.
    pub fn load<P: AsRef<Path>>(model_path: P, options: YuNetOptions) -> Result<Self> {
        let path = model_path.as_ref();
        anyhow::ensure!(path.exists(), "model file not found: {}", path.display());
        anyhow::ensure!(
            options.input_width > 0 && options.input_height > 0,
            "YuNet input dimensions must be greater than zero"
        );

        let runnable = match load_runnable_model(path, true) {
            Ok(model) => {
                debug!(
                    "YuNet model {} optimized ({}x{})",
                    path.display(),
                    options.input_width,
                    options.input_height
                );
                model
            }
            Err(opt_err) => {
                let optimize_msg = format!("{opt_err}");
                let mut chain_msg = String::new();
                for cause in opt_err.chain() {
                    let _ = writeln!(&mut chain_msg, "  - {cause}");
                }
                warn!(
                    "YuNet model {} failed optimized load ({}); using the decluttered graph.\nError chain:\n{}",
                    path.display(),
                    optimize_msg,
                    chain_msg.trim_end()
                );
                load_runnable_model(path, false).with_context(|| {
                    format!(
                        "fallback to decluttered YuNet graph failed after optimize error: {optimize_msg}"
                    )
                })?
            }
        };

        Ok(Self { runnable, options })
    }

    pub fn options(&self) -> &YuNetOptions {
        &self.options
    }

    fn input_tensor(&self, image: &GrayImage) -> Result<Tensor> {
        let (w, h) = (self.options.input_width, self.options.input_height);
        let rgb = gray_to_rgb(image);
        let resized = if rgb.dimensions() == (w, h) {
            rgb
        } else {
            image::imageops::resize(&rgb, w, h, FilterType::Triangle)
        };

        // BGR planes, matching OpenCV's blobFromImage
        let plane = (w * h) as usize;
        let mut data = vec![0f32; plane * 3];
        for (i, pixel) in resized.pixels().enumerate() {
            data[i] = f32::from(pixel[2]);
            data[plane + i] = f32::from(pixel[1]);
            data[2 * plane + i] = f32::from(pixel[0]);
        }
        Tensor::from_shape(&[1, 3, h as usize, w as usize], &data)
            .map_err(|e| anyhow::anyhow!("failed to build YuNet input tensor: {e}"))
    }

    fn run(&self, input: Tensor) -> Result<Vec<RawBox>> {
        let outputs = self
            .runnable
            .run(tvec![input.into()])
            .map_err(|e| anyhow::anyhow!("YuNet execution failed: {e}"))?;
        let tensors: Vec<Tensor> = outputs.into_iter().map(|v| v.into_tensor()).collect();

        match tensors.len() {
            0 => anyhow::bail!("YuNet model produced no outputs"),
            1 => fused_boxes(&tensors[0]),
            len if len == STRIDES.len() * OUTPUTS_PER_STRIDE => decode_stride_outputs(
                &tensors,
                self.options.input_width as usize,
                self.options.input_height as usize,
            ),
            other => anyhow::bail!(
                "unexpected number of YuNet outputs: expected 1 or {}, got {}",
                STRIDES.len() * OUTPUTS_PER_STRIDE,
                other
            ),
        }
    }
}

impl FaceDetector for YuNetFaceDetector {
    fn detect_multi_scale(
        &self,
        image: &GrayImage,
        params: &DetectorParams,
    ) -> Result<Vec<FaceRect>> {
        let _guard = timing_guard("emrec_core::yunet::detect", log::Level::Trace);
        let (orig_w, orig_h) = image.dimensions();
        anyhow::ensure!(
            orig_w > 0 && orig_h > 0,
            "source image dimensions must be greater than zero"
        );
        let raw = self.run(self.input_tensor(image)?)?;

        let scale_x = orig_w as f32 / self.options.input_width as f32;
        let scale_y = orig_h as f32 / self.options.input_height as f32;
        let candidates = scale_boxes(&raw, scale_x, scale_y, self.options.score_threshold);
        let kept = non_max_suppression(candidates, self.options.nms_threshold, self.options.top_k);

        let max_size = if params.max_size == 0 {
            u32::MAX
        } else {
            params.max_size
        };
        Ok(kept
            .into_iter()
            .map(|scored| scored.rect)
            .filter(|rect| {
                let side = rect.width.min(rect.height).max(0) as u32;
                side >= params.min_size && side <= max_size
            })
            .collect())
    }

    fn name(&self) -> &str {
        "yunet"
    }
}

fn load_runnable_model(path: &Path, optimized: bool) -> Result<RunnableModel> {
    let model = tract_onnx::onnx()
        .model_for_path(path)
        .with_context(|| format!("failed to parse ONNX graph from {}", path.display()))?;

    if optimized {
        model
            .into_optimized()
            .map_err(|e| anyhow::anyhow!("unable to optimize YuNet graph: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("unable to make YuNet graph runnable: {e}"))
    } else {
        model
            .into_typed()
            .map_err(|e| anyhow::anyhow!("unable to type-check YuNet graph: {e}"))?
            .into_decluttered()
            .map_err(|e| anyhow::anyhow!("unable to declutter YuNet graph: {e}"))?
            .into_runnable()
            .map_err(|e| anyhow::anyhow!("unable to make YuNet graph runnable: {e}"))
    }
}

/// Rows of a `[N, 15]` or `[1, N, 15]` tensor already decoded by the graph.
fn fused_boxes(output: &Tensor) -> Result<Vec<RawBox>> {
    let rows = match output.shape() {
        [rows, FUSED_COLS] | [1, rows, FUSED_COLS] => *rows,
        other => anyhow::bail!(
            "YuNet output must have shape [N, 15] or [1, N, 15] (got {:?})",
            other
        ),
    };
    let slice = output
        .as_slice::<f32>()
        .map_err(|e| anyhow::anyhow!("YuNet output is not f32: {e}"))?;
    anyhow::ensure!(
        slice.len() == rows * FUSED_COLS,
        "YuNet output data is not contiguous"
    );
    Ok(slice
        .chunks_exact(FUSED_COLS)
        .map(|row| RawBox {
            x: row[0],
            y: row[1],
            width: row[2],
            height: row[3],
            score: row[14],
        })
        .collect())
}

/// Decode the per-stride `cls`, `obj`, `bbox` and `kps` heads.
fn decode_stride_outputs(outputs: &[Tensor], input_w: usize, input_h: usize) -> Result<Vec<RawBox>> {
    let pad_w = input_w.div_ceil(32) * 32;
    let pad_h = input_h.div_ceil(32) * 32;

    let mut boxes = Vec::new();
    for (stride_index, &stride) in STRIDES.iter().enumerate() {
        let cols = pad_w / stride;
        let rows = pad_h / stride;
        let cell_count = rows * cols;
        let stride_f = stride as f32;

        let cls = stride_head(outputs, stride_index, "cls", cell_count)?;
        let obj = stride_head(outputs, stride_index + STRIDES.len(), "obj", cell_count)?;
        let bbox = stride_head(outputs, stride_index + STRIDES.len() * 2, "bbox", cell_count * 4)?;

        for row in 0..rows {
            for col in 0..cols {
                let idx = row * cols + col;
                let mut score = (cls[idx].clamp(0.0, 1.0) * obj[idx].clamp(0.0, 1.0)).sqrt();
                if !score.is_finite() {
                    score = 0.0;
                }
                let [dx, dy, dw, dh] = [
                    bbox[idx * 4],
                    bbox[idx * 4 + 1],
                    bbox[idx * 4 + 2],
                    bbox[idx * 4 + 3],
                ];
                let cx = (col as f32 + dx) * stride_f;
                let cy = (row as f32 + dy) * stride_f;
                let width = dw.exp() * stride_f;
                let height = dh.exp() * stride_f;
                boxes.push(RawBox {
                    x: (-0.5f32).mul_add(width, cx),
                    y: (-0.5f32).mul_add(height, cy),
                    width,
                    height,
                    score,
                });
            }
        }
    }
    Ok(boxes)
}

fn stride_head<'a>(
    outputs: &'a [Tensor],
    index: usize,
    name: &str,
    expected: usize,
) -> Result<&'a [f32]> {
    let slice = outputs[index]
        .as_slice::<f32>()
        .map_err(|e| anyhow::anyhow!("{name} output not f32: {e}"))?;
    anyhow::ensure!(
        slice.len() == expected,
        "{name} length mismatch: expected {expected}, got {}",
        slice.len()
    );
    Ok(slice)
}

/// Filter by score and map boxes back to source image coordinates.
fn scale_boxes(raw: &[RawBox], scale_x: f32, scale_y: f32, threshold: f32) -> Vec<ScoredRect> {
    raw.iter()
        .filter(|b| b.score.is_finite() && b.score >= threshold)
        .filter_map(|b| {
            let rect = FaceRect::new(
                (b.x * scale_x).round() as i32,
                (b.y * scale_y).round() as i32,
                (b.width * scale_x).round() as i32,
                (b.height * scale_y).round() as i32,
            );
            (rect.width > 0 && rect.height > 0).then_some(ScoredRect {
                rect,
                score: b.score,
            })
        })
        .collect()
}
