//! Command-line argument definitions for emrec.

use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use emrec_utils::config::DetectorBackend;

/// Prepare and inspect face-cropped emotion datasets.
#[derive(Debug, Parser)]
#[command(name = "emrec", author, version, about)]
pub struct Cli {
    /// Optional settings JSON. Defaults to `config/emrec_settings.json` when present, otherwise built-in parameters.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(short, long, global = true, action = ArgAction::SetTrue)]
    pub verbose: bool,

    /// Enable telemetry timing logs (defaults to settings file).
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub telemetry: bool,

    /// Override telemetry logging level (error, warn, info, debug, trace).
    #[arg(long, global = true, value_name = "LEVEL")]
    pub telemetry_level: Option<String>,

    #[command(flatten)]
    pub detector: DetectorArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Overrides for the face detector and row processing.
#[derive(Debug, Default, Args)]
pub struct DetectorArgs {
    /// Detector backend: `haar` or `yunet`.
    #[arg(long, global = true, value_name = "BACKEND")]
    pub backend: Option<DetectorBackend>,

    /// Cascade XML file (relative names resolve against the cascades directory).
    #[arg(long, global = true)]
    pub cascade: Option<PathBuf>,

    /// YuNet ONNX model (relative names resolve against the models directory).
    #[arg(long, global = true)]
    pub model: Option<PathBuf>,

    /// Override the pyramid scale factor.
    #[arg(long, global = true)]
    pub scale_factor: Option<f64>,

    /// Override the minimum neighbour count.
    #[arg(long, global = true)]
    pub min_neighbors: Option<u32>,

    /// Override the smallest face side considered.
    #[arg(long, global = true)]
    pub min_size: Option<u32>,

    /// Override the YuNet score threshold.
    #[arg(long, global = true)]
    pub score_threshold: Option<f32>,

    /// Decode rows on all cores.
    #[arg(long, global = true, action = ArgAction::SetTrue)]
    pub parallel: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Create the directory structure named in the settings.
    Setup,
    /// Report missing directories and detector assets.
    Check,
    /// Print resolved configuration.
    Show {
        #[command(subcommand)]
        target: ShowTarget,
    },
    /// List the datasets that can be prepared.
    Datasets,
    /// Fetch a raw dataset table into the raw directory.
    Download {
        /// Address of the raw table.
        url: String,
        /// Dataset the table belongs to; decides the file name.
        #[arg(long, default_value = "fer2013")]
        dataset: String,
        /// Replace an existing raw table.
        #[arg(long, action = ArgAction::SetTrue)]
        force: bool,
    },
    /// Convert a raw dataset into prepared image and label arrays.
    Prepare {
        /// Registered dataset name.
        name: String,
        /// Also build the private test split.
        #[arg(long, action = ArgAction::SetTrue)]
        include_private_test: bool,
        /// Write the preparation report as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Load prepared arrays and print their shapes.
    Inspect {
        /// Registered dataset name.
        name: String,
        /// Use the private test split instead of the public one.
        #[arg(long, action = ArgAction::SetTrue)]
        use_private_test: bool,
    },
    /// Normalize one image file and save the face crop.
    Normalize {
        /// Source image.
        #[arg(short, long)]
        input: PathBuf,
        /// Destination PNG.
        #[arg(short, long)]
        output: PathBuf,
        /// Side of the output crop.
        #[arg(long, default_value_t = 48)]
        size: u32,
        /// Embed the image in the border canvas before detection.
        #[arg(long, action = ArgAction::SetTrue)]
        border: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum ShowTarget {
    /// Settings after file loading and command-line overrides.
    Settings,
}
