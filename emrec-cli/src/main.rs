mod args;
mod config;
mod detector;
mod download;

use std::{
    fs::{self, File},
    path::Path,
};

use anyhow::{Context, Result};
use clap::Parser;
use emrec_core::{
    DatasetMaterializer, LogProgress, NormalizeError, PrepareOptions, PrepareReport,
    SourceImage, SplitStats, StorageLayout, dataset_by_name, dataset_entry, registered_datasets,
};
use emrec_utils::{
    config::{AppSettings, DetectorBackend},
    init_logging, timing_guard,
};
use log::{LevelFilter, info, warn};

use crate::{
    args::{Cli, Command, ShowTarget},
    config::{apply_cli_overrides, apply_telemetry, load_settings},
    detector::{build_codec, build_normalizer},
    download::download_to,
};

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    })?;

    let mut settings = load_settings(cli.config.as_ref())?;
    apply_cli_overrides(&mut settings, &cli)?;
    apply_telemetry(&settings);

    match &cli.command {
        Command::Setup => run_setup(&settings),
        Command::Check => run_check(&settings),
        Command::Show {
            target: ShowTarget::Settings,
        } => {
            let json = serde_json::to_string_pretty(&settings)
                .context("failed to serialize settings")?;
            println!("{json}");
            Ok(())
        }
        Command::Datasets => {
            run_datasets(&settings);
            Ok(())
        }
        Command::Download {
            url,
            dataset,
            force,
        } => {
            let config = dataset_by_name(dataset)?;
            let destination = StorageLayout::from(&settings.paths).raw_path(&config);
            download_to(url, &destination, *force)?;
            println!("{}", destination.display());
            Ok(())
        }
        Command::Prepare {
            name,
            include_private_test,
            report,
        } => run_prepare(&settings, name, *include_private_test, report.as_deref()),
        Command::Inspect {
            name,
            use_private_test,
        } => run_inspect(&settings, name, *use_private_test),
        Command::Normalize {
            input,
            output,
            size,
            border,
        } => run_normalize(&settings, input, output, *size, *border),
    }
}

fn run_setup(settings: &AppSettings) -> Result<()> {
    for dir in settings.paths.directories() {
        if dir.is_dir() {
            info!("{} already exists", dir.display());
            continue;
        }
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create directory {}", dir.display()))?;
        println!("created {}", dir.display());
    }
    Ok(())
}

fn run_check(settings: &AppSettings) -> Result<()> {
    println!("emrec-core {}", emrec_core::version());
    let mut problems = 0usize;
    for dir in settings.paths.directories() {
        if dir.is_dir() {
            println!("ok       {}", dir.display());
        } else {
            println!("missing  {}", dir.display());
            problems += 1;
        }
    }

    let asset = match settings.detector.backend {
        DetectorBackend::Haar => settings.cascade_path(),
        DetectorBackend::Yunet => settings.model_path(),
    };
    if asset.is_file() {
        println!("ok       {} ({})", asset.display(), settings.detector.backend);
    } else {
        println!("missing  {} ({})", asset.display(), settings.detector.backend);
        problems += 1;
    }

    let layout = StorageLayout::from(&settings.paths);
    for entry in registered_datasets() {
        let config = entry.config();
        let raw = layout.raw_path(&config);
        let materializer = DatasetMaterializer::new(config, layout.clone());
        let state = match (raw.is_file(), materializer.is_prepared(false)) {
            (_, true) => "prepared",
            (true, false) => "raw only",
            (false, false) => "not downloaded",
        };
        println!("dataset  {} ({state})", entry.name);
    }

    anyhow::ensure!(problems == 0, "{problems} problem(s) found");
    Ok(())
}

fn run_datasets(settings: &AppSettings) {
    let layout = StorageLayout::from(&settings.paths);
    for entry in registered_datasets() {
        let materializer = DatasetMaterializer::new(entry.config(), layout.clone());
        let prepared = if materializer.is_prepared(false) {
            " [prepared]"
        } else {
            ""
        };
        let config = materializer.config();
        println!("{}{prepared}: {}", entry.name, entry.description);
        println!("    source: {}", entry.source_url);
        println!(
            "    emotions: {}",
            config.vocabulary.names().collect::<Vec<_>>().join(", ")
        );
    }
}

fn run_prepare(
    settings: &AppSettings,
    name: &str,
    include_private_test: bool,
    report_path: Option<&Path>,
) -> Result<()> {
    let _guard = timing_guard("emrec::prepare", log::Level::Info);
    let config = dataset_by_name(name)?;
    let codec = build_codec(settings, config.vocabulary.clone(), config.face_size)?;
    let materializer = DatasetMaterializer::new(config, StorageLayout::from(&settings.paths));

    let options = PrepareOptions {
        include_private_test,
        parallel: settings.processing.parallel,
        ..Default::default()
    };
    let progress = LogProgress::new(settings.processing.progress_every);
    let report = materializer.prepare_from_raw(&codec, &options, &progress)?;

    for stats in &report.splits {
        println!("{}", describe_split(stats));
    }
    if report.ignored_rows > 0 {
        warn!(
            "{} row(s) had an unknown split tag and were ignored",
            report.ignored_rows
        );
    }
    if let Some(path) = report_path {
        write_report(&report, path)?;
    }
    Ok(())
}

fn describe_split(stats: &SplitStats) -> String {
    let mut line = format!("{}: kept {}/{}", stats.split, stats.kept, stats.total);
    if !stats.skipped.is_empty() {
        let reasons: Vec<String> = stats
            .skipped
            .iter()
            .map(|(reason, count)| format!("{reason}={count}"))
            .collect();
        line.push_str(&format!(" (skipped: {})", reasons.join(", ")));
    }
    line
}

fn write_report(report: &PrepareReport, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    serde_json::to_writer_pretty(file, report)
        .with_context(|| format!("failed to write report to {}", path.display()))?;
    info!("Wrote preparation report to {}", path.display());
    Ok(())
}

fn run_inspect(settings: &AppSettings, name: &str, use_private_test: bool) -> Result<()> {
    let entry = dataset_entry(name).with_context(|| format!("unknown dataset '{name}'"))?;
    let materializer =
        DatasetMaterializer::new(entry.config(), StorageLayout::from(&settings.paths));
    let loaded = materializer.load(use_private_test)?;
    println!(
        "train images {:?} labels {:?}",
        loaded.train.images.shape(),
        loaded.train.labels.shape()
    );
    println!(
        "{} images {:?} labels {:?}",
        loaded.test_split,
        loaded.test.images.shape(),
        loaded.test.labels.shape()
    );
    Ok(())
}

fn run_normalize(
    settings: &AppSettings,
    input: &Path,
    output: &Path,
    size: u32,
    border: bool,
) -> Result<()> {
    anyhow::ensure!(size > 0, "--size must be greater than zero");
    let bytes = fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let normalizer = build_normalizer(settings, size)?;

    let normalized = match normalizer.normalize(&SourceImage::Encoded(bytes), border) {
        Ok(normalized) => normalized,
        Err(NormalizeError::NoFace) => anyhow::bail!("no face found in {}", input.display()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to normalize {}", input.display()));
        }
    };
    normalized
        .to_gray_image()
        .save(output)
        .with_context(|| format!("failed to save {}", output.display()))?;
    println!("{}", output.display());
    Ok(())
}
