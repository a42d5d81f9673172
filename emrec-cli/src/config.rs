//! Configuration loading and CLI override logic.

use std::path::PathBuf;

use anyhow::{Context, Result};
use emrec_utils::{
    config::{AppSettings, default_settings_path},
    configure_telemetry, normalize_path,
};
use log::info;

use crate::args::Cli;

/// Load application settings from a file or use defaults.
pub fn load_settings(config_path: Option<&PathBuf>) -> Result<AppSettings> {
    if let Some(path) = config_path {
        let resolved = normalize_path(path)?;
        let settings = AppSettings::load_from_path(&resolved)?;
        info!("Loaded settings from {}", resolved.display());
        Ok(settings)
    } else {
        let default_path = default_settings_path();
        if default_path.exists() {
            let settings = AppSettings::load_from_path(&default_path).with_context(|| {
                format!(
                    "failed to load default settings from {}",
                    default_path.display()
                )
            })?;
            info!("Loaded settings from {}", default_path.display());
            Ok(settings)
        } else {
            Ok(AppSettings::default())
        }
    }
}

/// Apply command-line arguments to override loaded or default settings.
pub fn apply_cli_overrides(settings: &mut AppSettings, args: &Cli) -> Result<()> {
    if args.telemetry {
        settings.telemetry.enabled = true;
    }
    if let Some(level) = args.telemetry_level.as_ref() {
        let normalized = level.trim();
        if !normalized.is_empty() {
            let lower = normalized.to_ascii_lowercase();
            settings.telemetry.level = lower.clone();
            if lower == "off" {
                settings.telemetry.enabled = false;
            }
        }
    }

    let detector = &args.detector;
    if let Some(backend) = detector.backend {
        settings.detector.backend = backend;
    }
    if let Some(cascade) = detector.cascade.as_ref() {
        settings.detector.cascade_file = cascade.clone();
    }
    if let Some(model) = detector.model.as_ref() {
        settings.detector.model_file = model.clone();
    }
    if let Some(scale) = detector.scale_factor {
        settings.detector.scale_factor = scale;
    }
    if let Some(neighbors) = detector.min_neighbors {
        settings.detector.min_neighbors = neighbors;
    }
    if let Some(min_size) = detector.min_size {
        settings.detector.min_size = min_size;
    }
    if let Some(score) = detector.score_threshold {
        settings.detector.score_threshold = score;
    }
    if detector.parallel {
        settings.processing.parallel = true;
    }

    settings
        .validate()
        .context("invalid settings after command-line overrides")
}

/// Push telemetry preferences into the global timing switch.
pub fn apply_telemetry(settings: &AppSettings) {
    configure_telemetry(
        settings.telemetry.enabled,
        settings.telemetry.level_filter(),
    );
}
