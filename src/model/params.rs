//! Frozen and trainable parameter containers.
//!
//! The split is structural: gradients and optimizer state exist only for
//! [`TrainableParams`], and [`FrozenParams`] hands out shared references only.

use ndarray::{Array2, ArrayView4, ArrayViewD, ArrayViewMutD};
use rand::{rngs::StdRng, SeedableRng};
use std::fmt;

use super::backbone::FeatureExtractor;
use super::linear::{Linear, LinearGrads};
use crate::error::{Error, Result};

/// Identity of a trainable tensor. Optimizer state is keyed by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ParamId {
    VisionKernel,
    VisionBias,
    EmbeddingKernel,
    EmbeddingBias,
}

impl ParamId {
    pub const ALL: [ParamId; 4] = [
        ParamId::VisionKernel,
        ParamId::VisionBias,
        ParamId::EmbeddingKernel,
        ParamId::EmbeddingBias,
    ];

    pub fn path(&self) -> &'static str {
        match self {
            ParamId::VisionKernel => "vision_projection.kernel",
            ParamId::VisionBias => "vision_projection.bias",
            ParamId::EmbeddingKernel => "embedding_projection.kernel",
            ParamId::EmbeddingBias => "embedding_projection.bias",
        }
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

/// The pretrained backbone. Read-only for the whole run.
pub struct FrozenParams {
    backbone: Box<dyn FeatureExtractor>,
}

impl FrozenParams {
    pub fn new(backbone: Box<dyn FeatureExtractor>) -> Self {
        Self { backbone }
    }

    pub fn backbone_name(&self) -> &str {
        self.backbone.name()
    }

    pub fn feature_dim(&self) -> usize {
        self.backbone.output_dim()
    }

    pub fn fingerprint(&self) -> &str {
        self.backbone.fingerprint()
    }

    /// Runs the backbone and checks the shape of what it returns.
    pub fn extract(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        let n = images.len_of(ndarray::Axis(0));
        let features = self.backbone.extract(images)?;

        if features.nrows() != n {
            return Err(Error::ShapeMismatch {
                a: "backbone features",
                b: "image batch",
                expected: n,
                got: features.nrows(),
            });
        }
        if features.ncols() != self.feature_dim() {
            return Err(Error::ShapeMismatch {
                a: "backbone features",
                b: "backbone output dim",
                expected: self.feature_dim(),
                got: features.ncols(),
            });
        }

        Ok(features)
    }
}

impl fmt::Debug for FrozenParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrozenParams")
            .field("backbone", &self.backbone.name())
            .field("fingerprint", &self.backbone.fingerprint())
            .finish()
    }
}

/// The two projection heads, the only parameters a training step updates.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainableParams {
    pub vision_projection: Linear,
    pub embedding_projection: Linear,
}

impl TrainableParams {
    pub fn init(
        feature_dim: usize,
        embedding_dim: usize,
        projection_dim: usize,
        seed: u64,
    ) -> Result<Self> {
        let mut rng = StdRng::seed_from_u64(seed);
        Ok(Self {
            vision_projection: Linear::new(feature_dim, projection_dim, &mut rng)?,
            embedding_projection: Linear::new(embedding_dim, projection_dim, &mut rng)?,
        })
    }

    pub fn get(&self, id: ParamId) -> ArrayViewD<'_, f32> {
        match id {
            ParamId::VisionKernel => self.vision_projection.kernel.view().into_dyn(),
            ParamId::VisionBias => self.vision_projection.bias.view().into_dyn(),
            ParamId::EmbeddingKernel => self.embedding_projection.kernel.view().into_dyn(),
            ParamId::EmbeddingBias => self.embedding_projection.bias.view().into_dyn(),
        }
    }

    pub fn get_mut(&mut self, id: ParamId) -> ArrayViewMutD<'_, f32> {
        match id {
            ParamId::VisionKernel => self.vision_projection.kernel.view_mut().into_dyn(),
            ParamId::VisionBias => self.vision_projection.bias.view_mut().into_dyn(),
            ParamId::EmbeddingKernel => self.embedding_projection.kernel.view_mut().into_dyn(),
            ParamId::EmbeddingBias => self.embedding_projection.bias.view_mut().into_dyn(),
        }
    }

    pub fn num_params(&self) -> usize {
        ParamId::ALL.iter().map(|&id| self.get(id).len()).sum()
    }
}

/// Gradients of the loss w.r.t. [`TrainableParams`].
#[derive(Debug, Clone, PartialEq)]
pub struct Gradients {
    pub vision_projection: LinearGrads,
    pub embedding_projection: LinearGrads,
}

impl Gradients {
    pub fn zeros_like(params: &TrainableParams) -> Self {
        Self {
            vision_projection: LinearGrads::zeros_like(&params.vision_projection),
            embedding_projection: LinearGrads::zeros_like(&params.embedding_projection),
        }
    }

    pub fn get(&self, id: ParamId) -> ArrayViewD<'_, f32> {
        match id {
            ParamId::VisionKernel => self.vision_projection.kernel.view().into_dyn(),
            ParamId::VisionBias => self.vision_projection.bias.view().into_dyn(),
            ParamId::EmbeddingKernel => self.embedding_projection.kernel.view().into_dyn(),
            ParamId::EmbeddingBias => self.embedding_projection.bias.view().into_dyn(),
        }
    }

    /// Adds another partial gradient into this one.
    pub fn accumulate(&mut self, other: &Gradients) {
        self.vision_projection.accumulate(&other.vision_projection);
        self.embedding_projection.accumulate(&other.embedding_projection);
    }

    pub fn is_finite(&self) -> bool {
        ParamId::ALL
            .iter()
            .all(|&id| self.get(id).iter().all(|g| g.is_finite()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_shapes() {
        let params = TrainableParams::init(6, 4, 3, 0).unwrap();
        assert_eq!(params.get(ParamId::VisionKernel).shape(), &[6, 3]);
        assert_eq!(params.get(ParamId::VisionBias).shape(), &[3]);
        assert_eq!(params.get(ParamId::EmbeddingKernel).shape(), &[4, 3]);
        assert_eq!(params.get(ParamId::EmbeddingBias).shape(), &[3]);
        assert_eq!(params.num_params(), 6 * 3 + 3 + 4 * 3 + 3);
    }

    #[test]
    fn test_accumulate() {
        let params = TrainableParams::init(2, 2, 2, 0).unwrap();
        let mut total = Gradients::zeros_like(&params);
        let mut part = Gradients::zeros_like(&params);
        part.vision_projection.bias.fill(1.5);

        total.accumulate(&part);
        total.accumulate(&part);

        assert_eq!(total.vision_projection.bias.to_vec(), vec![3.0, 3.0]);
        assert!(total.is_finite());
    }
}
