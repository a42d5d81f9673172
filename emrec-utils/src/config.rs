//! Shared configuration types consumed across the emrec workspace.
//!
//! Settings are plain serde structures persisted as JSON. Every section carries
//! `#[serde(default)]` so partial files only override what they mention.

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Directory layout for raw inputs, prepared arrays and detector assets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathSettings {
    /// Root directory that contains the dataset folders.
    pub datasets_dir: PathBuf,
    /// Directory holding raw tabular dataset files.
    pub raw_dir: PathBuf,
    /// Directory receiving prepared image arrays.
    pub images_dir: PathBuf,
    /// Directory receiving prepared label arrays.
    pub labels_dir: PathBuf,
    /// Directory for model files (YuNet ONNX, trained classifiers).
    pub models_dir: PathBuf,
    /// Directory holding cascade XML files.
    pub cascades_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        let datasets_dir = PathBuf::from("datasets");
        Self {
            raw_dir: datasets_dir.join("raw"),
            images_dir: datasets_dir.join("prepared").join("images"),
            labels_dir: datasets_dir.join("prepared").join("labels"),
            datasets_dir,
            models_dir: PathBuf::from("models"),
            cascades_dir: PathBuf::from("haarcascade_files"),
        }
    }
}

impl PathSettings {
    /// Every directory the application expects to exist, parents first.
    pub fn directories(&self) -> Vec<&Path> {
        let mut dirs = vec![
            self.datasets_dir.as_path(),
            self.raw_dir.as_path(),
            self.images_dir.as_path(),
            self.labels_dir.as_path(),
            self.models_dir.as_path(),
            self.cascades_dir.as_path(),
        ];
        dirs.sort_by_key(|dir| dir.components().count());
        dirs.dedup();
        dirs
    }
}

/// Which face detector implementation backs the face locator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectorBackend {
    /// OpenCV-format Haar cascade evaluated on an image pyramid.
    #[default]
    Haar,
    /// YuNet ONNX model executed with tract.
    Yunet,
}

impl fmt::Display for DetectorBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectorBackend::Haar => "haar",
            DetectorBackend::Yunet => "yunet",
        })
    }
}

impl FromStr for DetectorBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "haar" | "cascade" => Ok(DetectorBackend::Haar),
            "yunet" => Ok(DetectorBackend::Yunet),
            other => Err(format!(
                "invalid detector backend '{other}'; expected 'haar' or 'yunet'"
            )),
        }
    }
}

/// Face detector parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectorSettings {
    /// Detector implementation.
    pub backend: DetectorBackend,
    /// Cascade file name, resolved against `paths.cascades_dir` when relative.
    pub cascade_file: PathBuf,
    /// Pyramid step between detection scales.
    pub scale_factor: f64,
    /// Minimum number of grouped neighbours for a candidate to be kept.
    pub min_neighbors: u32,
    /// Smallest face side considered, in pixels (0 disables the bound).
    pub min_size: u32,
    /// Largest face side considered, in pixels (0 disables the bound).
    pub max_size: u32,
    /// YuNet model file, resolved against `paths.models_dir` when relative.
    pub model_file: PathBuf,
    /// YuNet score threshold.
    pub score_threshold: f32,
    /// YuNet non-maximum suppression IoU threshold.
    pub nms_threshold: f32,
    /// YuNet input width.
    pub input_width: u32,
    /// YuNet input height.
    pub input_height: u32,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DetectorBackend::Haar,
            cascade_file: PathBuf::from("haarcascade_frontalface_default.xml"),
            scale_factor: 1.3,
            min_neighbors: 5,
            min_size: 0,
            max_size: 0,
            model_file: PathBuf::from("face_detection_yunet_2023mar.onnx"),
            score_threshold: 0.9,
            nms_threshold: 0.3,
            input_width: 160,
            input_height: 160,
        }
    }
}

/// Gray border applied around records before face detection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BorderSettings {
    /// Half of the bordered canvas side.
    pub outer_margin: u32,
    /// Half of the expected record side; the record is placed at `outer - inner`.
    pub inner_margin: u32,
    /// Canvas intensity.
    pub fill: u8,
}

impl Default for BorderSettings {
    fn default() -> Self {
        Self {
            outer_margin: 75,
            inner_margin: 24,
            fill: 200,
        }
    }
}

/// How split rows are processed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessingSettings {
    /// Decode rows on the rayon pool. Output order is unaffected.
    pub parallel: bool,
    /// Emit a progress line every N processed rows (0 logs only split totals).
    pub progress_every: usize,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            parallel: false,
            progress_every: 500,
        }
    }
}

/// Settings controlling optional runtime telemetry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    /// Whether telemetry timing logs are enabled.
    pub enabled: bool,
    /// Logging level for telemetry output (error, warn, info, debug, trace).
    pub level: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            level: "debug".to_string(),
        }
    }
}

impl TelemetrySettings {
    /// Resolve the configured level string into a `LevelFilter`.
    pub fn level_filter(&self) -> LevelFilter {
        match self.level.trim().to_ascii_lowercase().as_str() {
            "off" => LevelFilter::Off,
            "error" => LevelFilter::Error,
            "warn" | "warning" => LevelFilter::Warn,
            "info" => LevelFilter::Info,
            "trace" => LevelFilter::Trace,
            _ => LevelFilter::Debug,
        }
    }
}

/// Persistent application settings consumed by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppSettings {
    /// Directory layout.
    pub paths: PathSettings,
    /// Face detector parameters.
    pub detector: DetectorSettings,
    /// Border applied to raw records.
    pub border: BorderSettings,
    /// Row processing preferences.
    pub processing: ProcessingSettings,
    /// Telemetry and diagnostics preferences.
    pub telemetry: TelemetrySettings,
}

impl AppSettings {
    /// Load settings from a JSON file.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        let settings: AppSettings = serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse settings JSON at {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Serialize settings to disk in pretty-printed JSON, overwriting any existing file.
    pub fn save_to_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let payload =
            serde_json::to_string_pretty(self).context("failed to serialize settings JSON")?;
        fs::write(path, payload)
            .with_context(|| format!("failed to write settings file {}", path.display()))?;
        Ok(())
    }

    /// Reject values the detector or border logic cannot work with.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.detector.scale_factor > 1.0,
            "detector.scale_factor must be greater than 1.0 (got {})",
            self.detector.scale_factor
        );
        anyhow::ensure!(
            self.border.outer_margin >= self.border.inner_margin,
            "border.outer_margin ({}) must not be smaller than border.inner_margin ({})",
            self.border.outer_margin,
            self.border.inner_margin
        );
        Ok(())
    }

    /// Cascade file path with relative names resolved against the cascades directory.
    pub fn cascade_path(&self) -> PathBuf {
        resolve_in(&self.paths.cascades_dir, &self.detector.cascade_file)
    }

    /// YuNet model path with relative names resolved against the models directory.
    pub fn model_path(&self) -> PathBuf {
        resolve_in(&self.paths.models_dir, &self.detector.model_file)
    }
}

fn resolve_in(dir: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() || file.components().count() > 1 {
        file.to_path_buf()
    } else {
        dir.join(file)
    }
}

/// Returns the default path for persisted settings (`config/emrec_settings.json`).
pub fn default_settings_path() -> PathBuf {
    env::current_dir()
        .map(|dir| dir.join("config/emrec_settings.json"))
        .unwrap_or_else(|_| PathBuf::from("config/emrec_settings.json"))
}
