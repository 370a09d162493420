use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use geoalign::config::{BackboneKind, Config, JoinKey};
use geoalign::data::Sample;
use geoalign::distributed::{ShardPlan, Trainer};
use geoalign::driver::TrainingDriver;
use geoalign::embeddings::EmbeddingTable;
use geoalign::model::{build_backbone, FrozenParams, VisionLocationModel};
use geoalign::optim;
use geoalign::preprocess::{
    load_training_rows, BatchPreprocessor, EmbeddingSource, ExecutionStrategy,
};
use geoalign::Error;

const DIM: usize = 4;

fn write_images(dir: &Path, count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let path = dir.join(format!("street_{}.png", i));
            let img = image::RgbImage::from_fn(12, 10, |x, y| {
                image::Rgb([(x * 20 + i as u32 * 30) as u8, (y * 25) as u8, (i * 60) as u8])
            });
            img.save(&path).unwrap();
            path.to_string_lossy().into_owned()
        })
        .collect()
}

fn vector(i: usize) -> String {
    let values: Vec<String> = (0..DIM)
        .map(|j| if j == i % DIM { "1.0".to_string() } else { format!("{}", (i + j) % 3) })
        .collect();
    format!("\"[{}]\"", values.join(", "))
}

fn small_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.model.backbone_kind = BackboneKind::PatchPool;
    config.model.feature_dim = 16;
    config.model.image_size = 8;
    config.model.embedding_dim = DIM;
    config.model.projection_dim = 6;
    config.training.per_device_batch_size = 2;
    config.training.device_count = 2;
    config.training.epochs = 2;
    config.training.learning_rate = 1e-2;
    config.training.metrics_path = Some(dir.join("metrics.jsonl"));
    config.data.train_csv = dir.join("train.csv");
    config
}

fn train(config: &Config, source: EmbeddingSource<'_>, inline: Option<&str>) -> Vec<f32> {
    let rows = load_training_rows(
        &config.data.train_csv,
        &config.data.image_column,
        &config.data.key_spec(),
        inline,
    )
    .unwrap();

    let report = BatchPreprocessor::new(config.model.image_size, config.model.embedding_dim)
        .with_source(source)
        .with_strategy(ExecutionStrategy::from_config(&config.preprocess))
        .run(&rows)
        .unwrap();
    let samples: Arc<[Sample]> = report.samples.into();

    let frozen = Arc::new(FrozenParams::new(
        build_backbone(&config.model, config.training.seed).unwrap(),
    ));
    let model = VisionLocationModel::new(
        frozen,
        config.model.embedding_dim,
        config.model.projection_dim,
        config.training.seed,
    )
    .unwrap();
    let optimizer = optim::from_config(&config.training, model.trainable());
    let plan = ShardPlan::from_config(&config.training).unwrap();
    let mut trainer = Trainer::new(model, optimizer, plan).unwrap();

    let report = TrainingDriver::new(&config.training)
        .unwrap()
        .run(&mut trainer, samples)
        .unwrap();
    report.records.iter().map(|r| r.loss).collect()
}

#[test]
fn end_to_end_with_inline_embeddings() {
    let dir = TempDir::new().unwrap();
    let images = write_images(dir.path(), 9);

    let mut csv = String::from("image_path,embedding\n");
    for (i, path) in images.iter().enumerate() {
        csv.push_str(&format!("{},{}\n", path, vector(i)));
    }
    // A broken row is skipped, not fatal.
    csv.push_str(&format!("{},\"[1, 2]\"\n", images[0]));
    std::fs::write(dir.path().join("train.csv"), csv).unwrap();

    let config = small_config(dir.path());
    let losses = train(&config, EmbeddingSource::Inline, Some("embedding"));

    // 9 usable samples, global batch 4: 2 steps per epoch.
    assert_eq!(losses.len(), 4);
    assert!(losses.iter().all(|l| l.is_finite()));

    let metrics = std::fs::read_to_string(dir.path().join("metrics.jsonl")).unwrap();
    assert_eq!(metrics.lines().count(), 4);
}

#[test]
fn end_to_end_with_coordinate_joined_table() {
    let dir = TempDir::new().unwrap();
    let images = write_images(dir.path(), 4);

    let mut train_csv = String::from("image_path,longitude,latitude\n");
    let mut table_csv = String::from("longitude,latitude,embedding\n");
    for (i, path) in images.iter().enumerate() {
        // Same places, spelled differently than in the table.
        train_csv.push_str(&format!("{},{}.50,{}.250\n", path, i, i + 40));
        table_csv.push_str(&format!("{}.5,{}.25,{}\n", i, i + 40, vector(i)));
    }
    std::fs::write(dir.path().join("train.csv"), train_csv).unwrap();
    std::fs::write(dir.path().join("table.csv"), table_csv).unwrap();

    let mut config = small_config(dir.path());
    config.data.join_key = JoinKey::Coordinates;
    config.training.epochs = 3;

    let table = EmbeddingTable::load(
        &dir.path().join("table.csv"),
        &config.data.key_spec(),
        &config.data.embedding_column,
        DIM,
    )
    .unwrap();
    assert_eq!(table.len(), 4);

    let losses = train(&config, EmbeddingSource::Table(&table), None);
    assert_eq!(losses.len(), 3);
}

#[test]
fn inline_vector_length_mismatch_is_shape_error() {
    let dir = TempDir::new().unwrap();
    let images = write_images(dir.path(), 1);
    std::fs::write(
        dir.path().join("train.csv"),
        format!("image_path,embedding\n{},\"[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]\"\n", images[0]),
    )
    .unwrap();

    let config = small_config(dir.path());
    let rows = load_training_rows(
        &config.data.train_csv,
        "image_path",
        &config.data.key_spec(),
        Some("embedding"),
    )
    .unwrap();

    let err = BatchPreprocessor::new(8, 64)
        .strict(true)
        .run(&rows)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::ShapeMismatch {
            expected: 64,
            got: 10,
            ..
        }
    ));
}
