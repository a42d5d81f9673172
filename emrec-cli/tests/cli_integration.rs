use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use emrec_utils::{config::AppSettings, fixture_path};
use serde_json::Value;
use tempfile::{TempDir, tempdir};

/// Settings rooted in a scratch directory, using the fixture cascade.
fn scratch_settings() -> Result<(TempDir, PathBuf, AppSettings), Box<dyn Error>> {
    let dir = tempdir()?;
    let root = dir.path();
    let mut settings = AppSettings::default();
    settings.paths.datasets_dir = root.join("datasets");
    settings.paths.raw_dir = root.join("datasets/raw");
    settings.paths.images_dir = root.join("datasets/prepared/images");
    settings.paths.labels_dir = root.join("datasets/prepared/labels");
    settings.paths.models_dir = root.join("models");
    settings.paths.cascades_dir = root.join("cascades");
    settings.detector.cascade_file = fixture_path("cascades/two_band.xml")?;

    let config = root.join("settings.json");
    settings.save_to_path(&config)?;
    Ok((dir, config, settings))
}

fn run_ok(config: &Path, args: &[&str]) -> String {
    let mut cmd = cargo_bin_cmd!("emrec");
    cmd.arg("--config").arg(config).args(args);
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8_lossy(&output).into_owned()
}

fn run_err(config: &Path, args: &[&str]) -> String {
    let mut cmd = cargo_bin_cmd!("emrec");
    cmd.arg("--config").arg(config).args(args);
    let output = cmd.assert().failure().get_output().stderr.clone();
    String::from_utf8_lossy(&output).into_owned()
}

fn prepare_fixture_dataset(config: &Path, settings: &AppSettings) -> Result<(), Box<dyn Error>> {
    run_ok(config, &["setup"]);
    fs::copy(
        fixture_path("raw/fer2013_sample.csv")?,
        settings.paths.raw_dir.join("fer2013.csv"),
    )?;
    Ok(())
}

#[test]
fn setup_creates_directories_and_check_passes() -> Result<(), Box<dyn Error>> {
    let (_dir, config, settings) = scratch_settings()?;

    let stderr = run_err(&config, &["check"]);
    assert!(stderr.contains("problem(s) found"), "stderr: {stderr}");

    let stdout = run_ok(&config, &["setup"]);
    assert!(stdout.contains("created"));
    assert!(settings.paths.images_dir.is_dir());
    assert!(settings.paths.labels_dir.is_dir());

    let stdout = run_ok(&config, &["check"]);
    assert!(
        stdout.starts_with(&format!("emrec-core {}\n", env!("CARGO_PKG_VERSION"))),
        "stdout: {stdout}"
    );
    assert!(stdout.contains("dataset  fer2013 (not downloaded)"), "stdout: {stdout}");
    Ok(())
}

#[test]
fn datasets_lists_registry() -> Result<(), Box<dyn Error>> {
    let (_dir, config, _settings) = scratch_settings()?;
    let stdout = run_ok(&config, &["datasets"]);
    assert!(stdout.starts_with("fer2013: "), "stdout: {stdout}");
    assert!(
        stdout.contains("    emotions: angry, disgusted, fearful, happy, sad, surprised, neutral"),
        "stdout: {stdout}"
    );
    Ok(())
}

#[test]
fn show_settings_reflects_overrides() -> Result<(), Box<dyn Error>> {
    let (_dir, config, _settings) = scratch_settings()?;
    let stdout = run_ok(&config, &["show", "settings", "--min-neighbors", "2"]);
    let json: Value = serde_json::from_str(&stdout)?;
    assert_eq!(json["detector"]["min_neighbors"], 2);
    assert_eq!(json["detector"]["backend"], "haar");
    assert_eq!(json["border"]["outer_margin"], 75);
    Ok(())
}

#[test]
fn prepare_then_inspect_fixture_dataset() -> Result<(), Box<dyn Error>> {
    let (dir, config, settings) = scratch_settings()?;
    prepare_fixture_dataset(&config, &settings)?;
    let report_path = dir.path().join("report.json");

    let stdout = run_ok(
        &config,
        &[
            "prepare",
            "fer2013",
            "--report",
            report_path.to_str().ok_or("non-utf8 temp path")?,
        ],
    );
    assert!(
        stdout.contains("Training: kept 2/3 (skipped: no face=1)"),
        "stdout: {stdout}"
    );
    assert!(stdout.contains("PublicTest: kept 2/2"), "stdout: {stdout}");

    let report: Value = serde_json::from_str(&fs::read_to_string(&report_path)?)?;
    assert_eq!(report["dataset"], "fer2013");
    assert_eq!(report["splits"].as_array().map(Vec::len), Some(2));
    assert_eq!(report["splits"][0]["skipped"]["no_face"], 1);

    let stdout = run_ok(&config, &["inspect", "fer2013"]);
    assert!(stdout.contains("train images [2, 48, 48, 1] labels [2, 7]"));
    assert!(stdout.contains("PublicTest images [2, 48, 48, 1] labels [2, 7]"));

    let stderr = run_err(&config, &["inspect", "fer2013", "--use-private-test"]);
    assert!(stderr.contains("is not prepared"), "stderr: {stderr}");
    Ok(())
}

#[test]
fn parallel_prepare_with_private_split() -> Result<(), Box<dyn Error>> {
    let (_dir, config, settings) = scratch_settings()?;
    prepare_fixture_dataset(&config, &settings)?;

    let stdout = run_ok(
        &config,
        &["prepare", "FER2013", "--include-private-test", "--parallel"],
    );
    assert!(stdout.contains("PrivateTest: kept 1/1"), "stdout: {stdout}");
    let stdout = run_ok(&config, &["inspect", "fer2013", "--use-private-test"]);
    assert!(stdout.contains("PrivateTest images [1, 48, 48, 1] labels [1, 7]"));
    Ok(())
}

#[test]
fn unknown_dataset_is_rejected() -> Result<(), Box<dyn Error>> {
    let (_dir, config, _settings) = scratch_settings()?;
    let stderr = run_err(&config, &["prepare", "affectnet"]);
    assert!(stderr.contains("unknown dataset 'affectnet'"), "stderr: {stderr}");
    Ok(())
}

#[test]
fn normalize_writes_face_crop() -> Result<(), Box<dyn Error>> {
    let (dir, config, _settings) = scratch_settings()?;
    let output = dir.path().join("crop.png");
    let input = fixture_path("images/band_face.png")?;

    run_ok(
        &config,
        &[
            "normalize",
            "--input",
            input.to_str().ok_or("non-utf8 fixture path")?,
            "--output",
            output.to_str().ok_or("non-utf8 temp path")?,
            "--border",
        ],
    );
    let crop = image::open(&output)?.to_luma8();
    assert_eq!(crop.dimensions(), (48, 48));
    Ok(())
}
