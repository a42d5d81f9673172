use std::{fs, path::Path, sync::Arc};

use emrec_core::{
    BorderSpec, DatasetError, DatasetMaterializer, DetectorParams, FaceLocator, HaarCascade,
    ImageNormalizer, NoProgress, PrepareOptions, RecordCodec, SkipReason, SplitTag,
    StorageLayout, dataset_by_name,
};
use emrec_utils::fixture_path;
use tempfile::{TempDir, tempdir};

fn workspace() -> (TempDir, DatasetMaterializer) {
    let dir = tempdir().expect("tempdir");
    let layout = StorageLayout {
        raw_dir: dir.path().join("raw"),
        images_dir: dir.path().join("prepared/images"),
        labels_dir: dir.path().join("prepared/labels"),
    };
    for path in [&layout.raw_dir, &layout.images_dir, &layout.labels_dir] {
        fs::create_dir_all(path).expect("create dir");
    }
    let sample = fixture_path("raw/fer2013_sample.csv").expect("raw fixture");
    fs::copy(sample, layout.raw_dir.join("fer2013.csv")).expect("copy raw table");

    let config = dataset_by_name("fer2013").expect("registered");
    (dir, DatasetMaterializer::new(config, layout))
}

fn cascade_codec(materializer: &DatasetMaterializer) -> RecordCodec {
    let cascade =
        HaarCascade::load(fixture_path("cascades/two_band.xml").expect("cascade fixture"))
            .expect("cascade");
    let locator = FaceLocator::new(Arc::new(cascade), DetectorParams::default());
    let config = materializer.config();
    RecordCodec::new(
        config.vocabulary.clone(),
        ImageNormalizer::new(locator, config.face_size, BorderSpec::default()),
    )
}

fn assert_npy(path: &Path) {
    let bytes = fs::read(path).expect("artifact written");
    assert!(bytes.starts_with(b"\x93NUMPY"), "{} is not npy", path.display());
}

#[test]
fn prepare_then_load_fixture_dataset() {
    let (_dir, materializer) = workspace();
    let codec = cascade_codec(&materializer);

    let report = materializer
        .prepare_from_raw(&codec, &PrepareOptions::default(), &NoProgress)
        .expect("prepare");

    let training = report.split(SplitTag::Training).expect("training stats");
    assert_eq!(training.total, 3);
    assert_eq!(training.kept, 2);
    assert_eq!(training.skipped.get(&SkipReason::NoFace), Some(&1));
    let test = report.split(SplitTag::PublicTest).expect("test stats");
    assert_eq!((test.total, test.kept), (2, 2));
    assert!(report.split(SplitTag::PrivateTest).is_none());
    for paths in &report.artifacts {
        assert_npy(&paths.images);
        assert_npy(&paths.labels);
    }

    let loaded = materializer.load(false).expect("load");
    assert_eq!(loaded.train.images.shape(), &[2, 48, 48, 1]);
    assert_eq!(loaded.train.labels.shape(), &[2, 7]);
    assert_eq!(loaded.test.images.shape(), &[2, 48, 48, 1]);
    assert_eq!(loaded.test.labels.shape(), &[2, 7]);

    // labels 0 and 4 survive in training, 6 and 2 in the public test split
    assert_eq!(loaded.train.labels[(0, 0)], 1.0);
    assert_eq!(loaded.train.labels[(1, 4)], 1.0);
    assert_eq!(loaded.test.labels[(0, 6)], 1.0);
    assert_eq!(loaded.test.labels[(1, 2)], 1.0);
    for row in loaded.train.labels.rows() {
        assert_eq!(row.sum(), 1.0);
    }
    assert!(
        loaded
            .train
            .images
            .iter()
            .all(|v| (0.0..=1.0).contains(v))
    );
}

#[test]
fn private_test_split_is_opt_in() {
    let (_dir, materializer) = workspace();
    let codec = cascade_codec(&materializer);

    materializer
        .prepare_from_raw(&codec, &PrepareOptions::default(), &NoProgress)
        .expect("prepare");
    let err = materializer.load(true).expect_err("private split not written");
    assert!(matches!(
        err.downcast_ref::<DatasetError>(),
        Some(DatasetError::NotPrepared { .. })
    ));

    let options = PrepareOptions {
        include_private_test: true,
        parallel: true,
        ..Default::default()
    };
    materializer
        .prepare_from_raw(&codec, &options, &NoProgress)
        .expect("prepare with private split");
    let loaded = materializer.load(true).expect("load private");
    assert_eq!(loaded.test_split, SplitTag::PrivateTest);
    assert_eq!(loaded.test.images.shape(), &[1, 48, 48, 1]);
    assert_eq!(loaded.test.labels[(0, 5)], 1.0);
}

#[test]
fn load_before_prepare_is_not_prepared() {
    let (_dir, materializer) = workspace();
    let err = materializer.load(false).expect_err("nothing prepared yet");
    let Some(DatasetError::NotPrepared { dataset, path }) = err.downcast_ref::<DatasetError>()
    else {
        panic!("expected NotPrepared, got {err:#}");
    };
    assert_eq!(dataset, "fer2013");
    assert!(path.ends_with("fer2013_images.npy"));
}

#[test]
fn missing_raw_table_is_reported_with_path() {
    let (dir, materializer) = workspace();
    fs::remove_file(dir.path().join("raw/fer2013.csv")).expect("remove raw");
    let codec = cascade_codec(&materializer);
    let err = materializer
        .prepare_from_raw(&codec, &PrepareOptions::default(), &NoProgress)
        .expect_err("raw table missing");
    assert!(format!("{err:#}").contains("fer2013.csv"));
}

#[test]
fn report_serializes_split_accounting() {
    let (_dir, materializer) = workspace();
    let codec = cascade_codec(&materializer);
    let report = materializer
        .prepare_from_raw(&codec, &PrepareOptions::default(), &NoProgress)
        .expect("prepare");

    let json = serde_json::to_value(&report).expect("serialize report");
    assert_eq!(json["dataset"], "fer2013");
    assert_eq!(json["ignored_rows"], 0);
    assert_eq!(json["splits"][0]["split"], "Training");
    assert_eq!(json["splits"][0]["total"], 3);
    assert_eq!(json["splits"][0]["skipped"]["no_face"], 1);
    assert_eq!(json["splits"][1]["split"], "PublicTest");
    assert_eq!(json["artifacts"].as_array().map(Vec::len), Some(2));
    let images = json["artifacts"][0]["images"].as_str().expect("utf8 path");
    assert!(images.ends_with("fer2013_images.npy"));
}
