use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use geoalign::config::Config;
use geoalign::data::Sample;
use geoalign::distributed::{ShardPlan, Trainer};
use geoalign::driver::TrainingDriver;
use geoalign::embeddings::EmbeddingTable;
use geoalign::logging;
use geoalign::model::{build_backbone, FrozenParams, VisionLocationModel};
use geoalign::optim;
use geoalign::preprocess::{
    load_training_rows, BatchPreprocessor, EmbeddingSource, ExecutionStrategy,
};

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    train_csv: Option<PathBuf>,
    embeddings_csv: Option<PathBuf>,
    epochs: Option<usize>,
    devices: Option<usize>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.train_csv {
            config.data.train_csv = path.clone();
        }
        if let Some(path) = &self.embeddings_csv {
            config.data.embeddings_csv = Some(path.clone());
        }
        if let Some(epochs) = self.epochs {
            config.training.epochs = epochs;
        }
        if let Some(devices) = self.devices {
            config.training.device_count = devices;
        }
    }
}

fn value_of(args: &[String], i: usize, flag: &str) -> String {
    match args.get(i + 1) {
        Some(value) => value.clone(),
        None => {
            eprintln!("Error: {} requires an argument", flag);
            std::process::exit(1);
        }
    }
}

fn number_of(args: &[String], i: usize, flag: &str) -> usize {
    let value = value_of(args, i, flag);
    match value.parse() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("Error: {} expects a number, got `{}`", flag, value);
            std::process::exit(1);
        }
    }
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("geoalign {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--config" | "-c" => {
                parsed.config = Some(PathBuf::from(value_of(&args, i, "--config")));
                i += 1;
            }
            "--train-csv" => {
                parsed.train_csv = Some(PathBuf::from(value_of(&args, i, "--train-csv")));
                i += 1;
            }
            "--embeddings-csv" => {
                parsed.embeddings_csv =
                    Some(PathBuf::from(value_of(&args, i, "--embeddings-csv")));
                i += 1;
            }
            "--epochs" => {
                parsed.epochs = Some(number_of(&args, i, "--epochs"));
                i += 1;
            }
            "--devices" => {
                parsed.devices = Some(number_of(&args, i, "--devices"));
                i += 1;
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    parsed
}

fn print_help() {
    println!(
        r#"geoalign - contrastive image/location embedding training

USAGE:
    geoalign [OPTIONS]

OPTIONS:
    --config, -c PATH        Path to config file
    --train-csv PATH         Training rows (image_path, embedding)
    --embeddings-csv PATH    Join embeddings from this table instead
    --epochs N               Number of epochs
    --devices N              Number of data-parallel devices (0 = all cores)
    --version, -V            Show version
    --help, -h               Show this help message

ENVIRONMENT:
    GEOALIGN_CONFIG          Path to config file (overrides default location)
    GEOALIGN_LOG             Log filter (trace, debug, info, warn, error)

Config file location: $XDG_CONFIG_HOME/geoalign/config.toml"#
    );
}

fn main() -> Result<()> {
    let args = parse_args();

    // journald on Linux, rolling file otherwise
    if logging::init(Some(Config::config_dir().join("logs"))).is_err() {
        let _ = logging::init_stderr();
    }

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load().context("Failed to load config")?,
    };
    args.apply(&mut config);
    config.validate()?;

    train(&config)
}

fn train(config: &Config) -> Result<()> {
    // Fail on the device mesh before any data is read.
    let plan = ShardPlan::from_config(&config.training)?;

    let key = config.data.key_spec();
    let table = match &config.data.embeddings_csv {
        Some(path) => Some(
            EmbeddingTable::load(
                path,
                &key,
                &config.data.embedding_column,
                config.model.embedding_dim,
            )
            .with_context(|| format!("Failed to load embeddings from {}", path.display()))?,
        ),
        None => None,
    };

    let inline_column = table
        .is_none()
        .then_some(config.data.embedding_column.as_str());
    let rows = load_training_rows(
        &config.data.train_csv,
        &config.data.image_column,
        &key,
        inline_column,
    )
    .with_context(|| {
        format!(
            "Failed to read training rows from {}",
            config.data.train_csv.display()
        )
    })?;

    let source = match &table {
        Some(table) => EmbeddingSource::Table(table),
        None => EmbeddingSource::Inline,
    };
    let preprocessed = BatchPreprocessor::new(config.model.image_size, config.model.embedding_dim)
        .with_source(source)
        .with_strategy(ExecutionStrategy::from_config(&config.preprocess))
        .strict(config.preprocess.strict)
        .run(&rows)?;
    let samples: Arc<[Sample]> = preprocessed.samples.into();

    let backbone = build_backbone(&config.model, config.training.seed)
        .with_context(|| format!("Failed to load backbone {}", config.model.backbone))?;
    let frozen = Arc::new(FrozenParams::new(backbone));
    tracing::info!(
        backbone = %frozen.backbone_name(),
        fingerprint = %frozen.fingerprint(),
        "Backbone frozen"
    );

    let model = VisionLocationModel::new(
        frozen,
        config.model.embedding_dim,
        config.model.projection_dim,
        config.training.seed,
    )?;
    let optimizer = optim::from_config(&config.training, model.trainable());
    let mut trainer = Trainer::new(model, optimizer, plan)?;

    let report = TrainingDriver::new(&config.training)?.run(&mut trainer, samples)?;

    if let Some(loss) = report.final_loss() {
        println!(
            "Trained {} steps over {} epochs, final loss {:.4}",
            report.records.len(),
            report.epochs.len(),
            loss
        );
    }
    Ok(())
}
