//! Frozen vision backbones.
//!
//! The backbone is consumed through [`FeatureExtractor`] only: images in,
//! pooled features out. Its parameters are never exposed mutably.

use anyhow::{anyhow, Context};
use ndarray::{Array2, ArrayView4, Axis};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Normal};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::{BackboneKind, ModelConfig};
use crate::error::{Error, Result};

/// Feature-extraction contract of a frozen backbone.
pub trait FeatureExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Width of the features returned by [`FeatureExtractor::extract`].
    fn output_dim(&self) -> usize;

    /// Maps images `[N, H, W, 3]` in `[-1, 1]` to features `[N, output_dim]`.
    fn extract(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>>;

    /// SHA-256 of the frozen parameters, hex encoded.
    fn fingerprint(&self) -> &str;
}

/// Build the backbone selected by the model configuration.
pub fn build_backbone(config: &ModelConfig, seed: u64) -> Result<Box<dyn FeatureExtractor>> {
    match config.backbone_kind {
        BackboneKind::Onnx => Ok(Box::new(OnnxBackbone::from_pretrained(config)?)),
        BackboneKind::PatchPool => Ok(Box::new(PatchPoolBackbone::new(
            PatchPoolBackbone::DEFAULT_GRID,
            config.feature_dim,
            seed,
        )?)),
    }
}

/// Vision encoder exported to ONNX, run with ONNX Runtime.
pub struct OnnxBackbone {
    reference: String,
    session: Mutex<Session>,
    input_name: String,
    output_dim: usize,
    channels_first: bool,
    fingerprint: String,
}

impl OnnxBackbone {
    /// Resolve `config.backbone` to a model file (downloading it once) and load it.
    pub fn from_pretrained(config: &ModelConfig) -> Result<Self> {
        let model_path = resolve_model(&config.backbone, &config.backbone_file)
            .map_err(|e| Error::Backbone(format!("{:#}", e)))?;

        Self::from_file(
            &config.backbone,
            &model_path,
            &config.backbone_input,
            config.feature_dim,
            config.channels_first,
        )
    }

    pub fn from_file(
        reference: &str,
        model_path: &Path,
        input_name: &str,
        output_dim: usize,
        channels_first: bool,
    ) -> Result<Self> {
        let session = load_session(model_path).map_err(|e| {
            Error::Backbone(format!("failed to load {}: {:#}", model_path.display(), e))
        })?;

        let fingerprint = hash_file(model_path)?;
        tracing::info!(
            backbone = %reference,
            path = %model_path.display(),
            %fingerprint,
            "Frozen backbone loaded"
        );

        Ok(Self {
            reference: reference.to_string(),
            session: Mutex::new(session),
            input_name: input_name.to_string(),
            output_dim,
            channels_first,
            fingerprint,
        })
    }

    fn run(&self, images: ArrayView4<'_, f32>) -> anyhow::Result<Array2<f32>> {
        let (n, h, w, c) = images.dim();

        // Row-major iteration over a permuted view yields the target layout.
        let (shape, data): ([usize; 4], Vec<f32>) = if self.channels_first {
            let nchw = images.permuted_axes([0, 3, 1, 2]);
            ([n, c, h, w], nchw.iter().copied().collect())
        } else {
            ([n, h, w, c], images.iter().copied().collect())
        };

        let input_tensor = Tensor::from_array((shape, data.into_boxed_slice()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow!("Failed to lock backbone session: {}", e))?;

        let outputs = session.run(ort::inputs![self.input_name.as_str() => input_tensor])?;

        // Prefer the pooled output when the graph exposes several.
        let output = outputs
            .iter()
            .find(|(name, _)| name.to_string() == "pooler_output")
            .or_else(|| outputs.iter().next())
            .ok_or_else(|| anyhow!("Backbone produced no output"))?;

        let (_shape, features) = output.1.try_extract_tensor::<f32>()?;
        Array2::from_shape_vec((n, self.output_dim), features.to_vec()).with_context(|| {
            format!(
                "backbone output has {} values, expected {}x{}",
                features.len(),
                n,
                self.output_dim
            )
        })
    }
}

impl FeatureExtractor for OnnxBackbone {
    fn name(&self) -> &str {
        &self.reference
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }

    fn extract(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        self.run(images)
            .map_err(|e| Error::Backbone(format!("{:#}", e)))
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Deterministic extractor: mean-pool each channel over a `grid x grid` patch
/// layout, then a fixed seeded projection with `tanh`.
///
/// Needs no model download, which makes it the backbone for offline smoke runs.
#[derive(Debug, Clone)]
pub struct PatchPoolBackbone {
    grid: usize,
    weights: Array2<f32>,
    fingerprint: String,
}

impl PatchPoolBackbone {
    pub const DEFAULT_GRID: usize = 4;

    pub fn new(grid: usize, output_dim: usize, seed: u64) -> Result<Self> {
        if grid == 0 {
            return Err(Error::Config("patch grid must be positive".to_string()));
        }

        let in_dim = grid * grid * 3;
        let normal = Normal::new(0.0f32, 1.0 / (in_dim as f32).sqrt())
            .map_err(|e| Error::Config(e.to_string()))?;
        let mut rng = StdRng::seed_from_u64(seed);
        let weights = Array2::from_shape_fn((in_dim, output_dim), |_| normal.sample(&mut rng));

        let mut hasher = Sha256::new();
        hasher.update((grid as u64).to_le_bytes());
        for w in weights.iter() {
            hasher.update(w.to_le_bytes());
        }
        let fingerprint = format!("{:x}", hasher.finalize());

        Ok(Self {
            grid,
            weights,
            fingerprint,
        })
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }

    fn pool(&self, images: ArrayView4<'_, f32>) -> Array2<f32> {
        let (n, h, w, c) = images.dim();
        let g = self.grid;
        let mut pooled = Array2::<f32>::zeros((n, g * g * c));
        let mut counts = vec![0usize; g * g];

        for y in 0..h {
            for x in 0..w {
                counts[(y * g / h) * g + x * g / w] += 1;
            }
        }

        for (image, mut out) in images.axis_iter(Axis(0)).zip(pooled.rows_mut()) {
            for ((y, x, ch), value) in image.indexed_iter() {
                let cell = (y * g / h) * g + x * g / w;
                out[cell * c + ch] += *value;
            }
            for (cell, &count) in counts.iter().enumerate() {
                if count > 0 {
                    for ch in 0..c {
                        out[cell * c + ch] /= count as f32;
                    }
                }
            }
        }

        pooled
    }
}

impl FeatureExtractor for PatchPoolBackbone {
    fn name(&self) -> &str {
        "patch-pool"
    }

    fn output_dim(&self) -> usize {
        self.weights.ncols()
    }

    fn extract(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        let channels = images.len_of(Axis(3));
        if channels != 3 {
            return Err(Error::ShapeMismatch {
                a: "image channels",
                b: "RGB",
                expected: 3,
                got: channels,
            });
        }

        Ok(self.pool(images).dot(&self.weights).mapv(f32::tanh))
    }

    fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

fn load_session(model_path: &Path) -> anyhow::Result<Session> {
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(4)?
        .commit_from_file(model_path)?;
    Ok(session)
}

/// Get the models directory path
fn get_models_dir() -> anyhow::Result<PathBuf> {
    let data_dir =
        dirs::data_local_dir().ok_or_else(|| anyhow!("Could not find local data directory"))?;
    let models_dir = data_dir.join("geoalign").join("models");
    std::fs::create_dir_all(&models_dir)?;
    Ok(models_dir)
}

/// Resolve a backbone reference to a local ONNX file.
///
/// A reference naming an existing file is used as is; otherwise it is taken
/// as a Hugging Face repository id and `file` is downloaded from it once.
fn resolve_model(reference: &str, file: &str) -> anyhow::Result<PathBuf> {
    let local = Path::new(reference);
    if local.is_file() {
        return Ok(local.to_path_buf());
    }

    let repo_dir = get_models_dir()?.join(reference.replace('/', "__"));
    std::fs::create_dir_all(&repo_dir)?;
    let model_path = repo_dir.join(file);

    if !model_path.exists() {
        let url = format!("https://huggingface.co/{}/resolve/main/{}", reference, file);
        tracing::info!(model = %reference, %url, "Downloading backbone...");
        let response = ureq::get(&url)
            .call()
            .map_err(|e| anyhow!("Failed to download backbone: {}", e))?;

        // Download next to the target so a partial file is never mistaken for a model.
        let partial = model_path.with_extension("part");
        let mut out = File::create(&partial)?;
        std::io::copy(&mut response.into_reader(), &mut out)?;
        std::fs::rename(&partial, &model_path)?;
        tracing::info!(model = %reference, path = ?model_path, "Backbone downloaded");
    }

    Ok(model_path)
}

fn hash_file(path: &Path) -> Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();

    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array4;

    #[test]
    fn test_patch_pool_shapes_and_determinism() {
        let a = PatchPoolBackbone::new(2, 5, 3).unwrap();
        let b = PatchPoolBackbone::new(2, 5, 3).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let images = Array4::from_shape_fn((3, 8, 8, 3), |(n, y, x, c)| {
            ((n + y + x + c) % 5) as f32 / 2.0 - 1.0
        });
        let fa = a.extract(images.view()).unwrap();
        let fb = b.extract(images.view()).unwrap();
        assert_eq!(fa.dim(), (3, 5));
        assert_eq!(fa, fb);
    }

    #[test]
    fn test_patch_pool_means() {
        let backbone = PatchPoolBackbone::new(2, 1, 0).unwrap();
        // Left half -1, right half +1 on every channel.
        let images = Array4::from_shape_fn((1, 4, 4, 3), |(_, _, x, _)| if x < 2 { -1.0 } else { 1.0 });
        let pooled = backbone.pool(images.view());
        assert_eq!(pooled.row(0).to_vec(), vec![
            -1.0, -1.0, -1.0, 1.0, 1.0, 1.0,
            -1.0, -1.0, -1.0, 1.0, 1.0, 1.0,
        ]);
    }

    #[test]
    fn test_seed_changes_fingerprint() {
        let a = PatchPoolBackbone::new(2, 5, 3).unwrap();
        let b = PatchPoolBackbone::new(2, 5, 4).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_hash_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.onnx");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            hash_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
