use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::embeddings::KeySpec;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub training: TrainingConfig,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub preprocess: PreprocessConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    #[default]
    Adam,
    Sgd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default = "default_per_device_batch_size")]
    pub per_device_batch_size: usize,

    /// Number of logical devices. `0` means one per available CPU core.
    #[serde(default)]
    pub device_count: usize,

    #[serde(default = "default_epochs")]
    pub epochs: usize,

    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,

    #[serde(default)]
    pub optimizer: OptimizerKind,

    #[serde(default)]
    pub seed: u64,

    /// Reshuffle the sample order at the start of every epoch.
    #[serde(default)]
    pub shuffle: bool,

    /// Number of batches assembled ahead of the training step.
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,

    /// Optional JSON-lines file receiving one record per step.
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,
}

fn default_per_device_batch_size() -> usize {
    16
}

fn default_epochs() -> usize {
    3
}

fn default_learning_rate() -> f32 {
    1e-4
}

fn default_prefetch() -> usize {
    2
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            per_device_batch_size: default_per_device_batch_size(),
            device_count: 0,
            epochs: default_epochs(),
            learning_rate: default_learning_rate(),
            optimizer: OptimizerKind::default(),
            seed: 0,
            shuffle: false,
            prefetch: default_prefetch(),
            metrics_path: None,
        }
    }
}

impl TrainingConfig {
    /// Device count with `0` resolved against the host.
    pub fn resolved_device_count(&self) -> usize {
        if self.device_count > 0 {
            return self.device_count;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BackboneKind {
    #[default]
    Onnx,
    PatchPool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Canonical square image size fed to the backbone.
    #[serde(default = "default_image_size")]
    pub image_size: u32,

    #[serde(default = "default_projection_dim")]
    pub projection_dim: usize,

    #[serde(default = "default_embedding_dim")]
    pub embedding_dim: usize,

    /// Pretrained backbone reference (Hugging Face repository id).
    #[serde(default = "default_backbone")]
    pub backbone: String,

    #[serde(default)]
    pub backbone_kind: BackboneKind,

    /// File inside the backbone repository holding the ONNX vision encoder.
    #[serde(default = "default_backbone_file")]
    pub backbone_file: String,

    #[serde(default = "default_backbone_input")]
    pub backbone_input: String,

    /// Width of the pooled features the backbone emits.
    #[serde(default = "default_feature_dim")]
    pub feature_dim: usize,

    #[serde(default = "default_channels_first")]
    pub channels_first: bool,
}

fn default_image_size() -> u32 {
    336
}

fn default_projection_dim() -> usize {
    512
}

fn default_embedding_dim() -> usize {
    64
}

fn default_backbone() -> String {
    "geolocal/StreetCLIP".to_string()
}

fn default_backbone_file() -> String {
    "vision_model.onnx".to_string()
}

fn default_backbone_input() -> String {
    "pixel_values".to_string()
}

fn default_feature_dim() -> usize {
    1024 // ViT-L/14 pooled width
}

fn default_channels_first() -> bool {
    true
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            image_size: default_image_size(),
            projection_dim: default_projection_dim(),
            embedding_dim: default_embedding_dim(),
            backbone: default_backbone(),
            backbone_kind: BackboneKind::default(),
            backbone_file: default_backbone_file(),
            backbone_input: default_backbone_input(),
            feature_dim: default_feature_dim(),
            channels_first: default_channels_first(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_train_csv")]
    pub train_csv: PathBuf,

    /// When set, vectors are joined from this table by `join_key` instead of
    /// being parsed from the training rows.
    #[serde(default)]
    pub embeddings_csv: Option<PathBuf>,

    #[serde(default = "default_image_column")]
    pub image_column: String,

    #[serde(default = "default_embedding_column")]
    pub embedding_column: String,

    /// How training rows are matched to records of `embeddings_csv`.
    #[serde(default)]
    pub join_key: JoinKey,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum JoinKey {
    /// By the value of `image_column`.
    #[default]
    ImagePath,
    /// By the `longitude` and `latitude` columns.
    Coordinates,
}

impl DataConfig {
    pub fn key_spec(&self) -> KeySpec {
        match self.join_key {
            JoinKey::ImagePath => KeySpec::Column(self.image_column.clone()),
            JoinKey::Coordinates => KeySpec::coordinates(),
        }
    }
}

fn default_train_csv() -> PathBuf {
    PathBuf::from("path_lat_lon_with_embeddings.csv")
}

fn default_image_column() -> String {
    "image_path".to_string()
}

fn default_embedding_column() -> String {
    "embedding".to_string()
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_csv: default_train_csv(),
            embeddings_csv: None,
            image_column: default_image_column(),
            embedding_column: default_embedding_column(),
            join_key: JoinKey::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyKind {
    Sequential,
    #[default]
    WorkerPool,
    ProcessPool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreprocessConfig {
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Worker count for pooled strategies. `0` lets rayon decide.
    #[serde(default)]
    pub workers: usize,

    /// Abort on the first failing row instead of skipping it.
    #[serde(default)]
    pub strict: bool,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(&config_path, content)?;

        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.training.per_device_batch_size == 0, "training.per_device_batch_size must be positive"),
            (self.training.epochs == 0, "training.epochs must be positive"),
            (!(self.training.learning_rate > 0.0), "training.learning_rate must be positive"),
            (self.model.image_size == 0, "model.image_size must be positive"),
            (self.model.projection_dim == 0, "model.projection_dim must be positive"),
            (self.model.embedding_dim == 0, "model.embedding_dim must be positive"),
            (self.model.feature_dim == 0, "model.feature_dim must be positive"),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(Error::Config(message.to_string())),
            None => Ok(()),
        }
    }

    pub fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("GEOALIGN_CONFIG") {
            return PathBuf::from(path);
        }

        Self::config_dir().join("config.toml")
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("geoalign")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_run() {
        let config = Config::default();
        assert_eq!(config.training.per_device_batch_size, 16);
        assert_eq!(config.training.epochs, 3);
        assert_eq!(config.model.image_size, 336);
        assert_eq!(config.model.projection_dim, 512);
        assert_eq!(config.model.embedding_dim, 64);
        assert_eq!(config.model.backbone, "geolocal/StreetCLIP");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            [training]
            device_count = 2
            learning_rate = 0.001
            optimizer = "sgd"

            [model]
            backbone_kind = "patch-pool"

            [preprocess]
            strategy = "sequential"
            strict = true
            "#,
        )
        .unwrap();

        assert_eq!(config.training.device_count, 2);
        assert_eq!(config.training.resolved_device_count(), 2);
        assert_eq!(config.training.optimizer, OptimizerKind::Sgd);
        assert_eq!(config.training.per_device_batch_size, 16);
        assert_eq!(config.model.backbone_kind, BackboneKind::PatchPool);
        assert_eq!(config.preprocess.strategy, StrategyKind::Sequential);
        assert!(config.preprocess.strict);
    }

    #[test]
    fn test_join_key() {
        let config = Config::from_toml("[data]\nimage_column = \"file\"\n").unwrap();
        assert_eq!(config.data.key_spec(), KeySpec::Column("file".to_string()));

        let config = Config::from_toml("[data]\njoin_key = \"coordinates\"\n").unwrap();
        assert_eq!(config.data.key_spec(), KeySpec::coordinates());
    }

    #[test]
    fn test_rejects_zero_batch() {
        let err = Config::from_toml("[training]\nper_device_batch_size = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
