//! Vision-location model: a frozen image backbone plus two trainable projection
//! heads mapping backbone features and geospatial embeddings into one space.

mod backbone;
mod linear;
mod ops;
mod params;

pub use backbone::{build_backbone, FeatureExtractor, OnnxBackbone, PatchPoolBackbone};
pub use linear::{Linear, LinearGrads};
pub use ops::{l2_normalize_backward, l2_normalize_rows, similarity};
pub use params::{FrozenParams, Gradients, ParamId, TrainableParams};

use ndarray::{Array2, ArrayView2, ArrayView4, Axis};
use std::sync::Arc;

use crate::error::{Error, Result};

/// L2-normalized features of an image/embedding batch, row `i` of each side
/// coming from the same sample.
#[derive(Debug, Clone, PartialEq)]
pub struct PairFeatures {
    pub vision: Array2<f32>,
    pub embedding: Array2<f32>,
}

impl PairFeatures {
    /// `vision @ embedding^T`; the diagonal holds the true pairings.
    pub fn similarity(&self) -> Array2<f32> {
        similarity(self.vision.view(), self.embedding.view())
    }
}

#[derive(Debug)]
pub struct VisionLocationModel {
    frozen: Arc<FrozenParams>,
    trainable: TrainableParams,
}

impl VisionLocationModel {
    /// Freshly initialized projection heads on top of `frozen`.
    pub fn new(
        frozen: Arc<FrozenParams>,
        embedding_dim: usize,
        projection_dim: usize,
        seed: u64,
    ) -> Result<Self> {
        let trainable =
            TrainableParams::init(frozen.feature_dim(), embedding_dim, projection_dim, seed)?;
        Self::from_parts(frozen, trainable)
    }

    pub fn from_parts(frozen: Arc<FrozenParams>, trainable: TrainableParams) -> Result<Self> {
        let vision = &trainable.vision_projection;
        let embedding = &trainable.embedding_projection;

        if vision.in_dim() != frozen.feature_dim() {
            return Err(Error::ShapeMismatch {
                a: "vision projection input",
                b: "backbone output dim",
                expected: frozen.feature_dim(),
                got: vision.in_dim(),
            });
        }
        if vision.out_dim() != embedding.out_dim() {
            return Err(Error::ShapeMismatch {
                a: "embedding projection output",
                b: "vision projection output",
                expected: vision.out_dim(),
                got: embedding.out_dim(),
            });
        }

        Ok(Self { frozen, trainable })
    }

    pub fn frozen(&self) -> &Arc<FrozenParams> {
        &self.frozen
    }

    pub fn trainable(&self) -> &TrainableParams {
        &self.trainable
    }

    pub(crate) fn trainable_mut(&mut self) -> &mut TrainableParams {
        &mut self.trainable
    }

    pub fn embedding_dim(&self) -> usize {
        self.trainable.embedding_projection.in_dim()
    }

    pub fn projection_dim(&self) -> usize {
        self.trainable.vision_projection.out_dim()
    }

    /// Frozen backbone followed by the trainable vision projection: `[N, P]`.
    pub fn encode_vision(&self, images: ArrayView4<'_, f32>) -> Result<Array2<f32>> {
        let features = self.frozen.extract(images)?;
        Ok(self.trainable.vision_projection.forward(features.view()))
    }

    /// Trainable embedding projection of precomputed vectors: `[N, P]`.
    pub fn encode_embedding(&self, vectors: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        self.check_embedding_dim(vectors.ncols())?;
        Ok(self.trainable.embedding_projection.forward(vectors))
    }

    /// Both encoders, each L2-normalized along the feature axis.
    ///
    /// This is the only path `forward` takes, so the embedding branch is exactly
    /// `encode_embedding` and the projection is applied once.
    pub fn embed_pair(
        &self,
        images: ArrayView4<'_, f32>,
        vectors: ArrayView2<'_, f32>,
    ) -> Result<PairFeatures> {
        let n = images.len_of(Axis(0));
        if vectors.nrows() != n {
            return Err(Error::ShapeMismatch {
                a: "embeddings",
                b: "images",
                expected: n,
                got: vectors.nrows(),
            });
        }

        let (vision, _) = l2_normalize_rows(self.encode_vision(images)?.view());
        let (embedding, _) = l2_normalize_rows(self.encode_embedding(vectors)?.view());
        Ok(PairFeatures { vision, embedding })
    }

    /// Pairwise similarity `[N, N]` between normalized vision and embedding features.
    pub fn forward(
        &self,
        images: ArrayView4<'_, f32>,
        vectors: ArrayView2<'_, f32>,
    ) -> Result<Array2<f32>> {
        Ok(self.embed_pair(images, vectors)?.similarity())
    }

    pub(crate) fn check_embedding_dim(&self, got: usize) -> Result<()> {
        if got != self.embedding_dim() {
            return Err(Error::ShapeMismatch {
                a: "embedding vectors",
                b: "embedding dim",
                expected: self.embedding_dim(),
                got,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array4, Axis};

    fn model() -> VisionLocationModel {
        let backbone = PatchPoolBackbone::new(2, 6, 11).unwrap();
        let frozen = Arc::new(FrozenParams::new(Box::new(backbone)));
        VisionLocationModel::new(frozen, 4, 5, 3).unwrap()
    }

    fn inputs(n: usize) -> (Array4<f32>, Array2<f32>) {
        let images = Array4::from_shape_fn((n, 6, 6, 3), |(i, y, x, c)| {
            (((i * 7 + y * 3 + x + c) % 11) as f32 / 5.0) - 1.0
        });
        let vectors = Array2::from_shape_fn((n, 4), |(i, j)| ((i + 1) * (j + 2)) as f32 / 10.0);
        (images, vectors)
    }

    #[test]
    fn test_forward_shape_and_range() {
        let model = model();
        let (images, vectors) = inputs(3);
        let s = model.forward(images.view(), vectors.view()).unwrap();

        assert_eq!(s.dim(), (3, 3));
        assert!(s.iter().all(|v| v.abs() <= 1.0 + 1e-5));
    }

    #[test]
    fn test_embedding_branch_matches_encode_embedding() {
        let model = model();
        let (images, vectors) = inputs(3);

        let pair = model.embed_pair(images.view(), vectors.view()).unwrap();
        let direct = model.encode_embedding(vectors.view()).unwrap();
        let (direct, _) = l2_normalize_rows(direct.view());

        assert_eq!(pair.embedding, direct);
    }

    #[test]
    fn test_row_count_mismatch() {
        let model = model();
        let (images, _) = inputs(3);
        let (_, vectors) = inputs(2);
        let err = model.forward(images.view(), vectors.view()).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { expected: 3, got: 2, .. }));
    }

    #[test]
    fn test_embedding_dim_mismatch() {
        let model = model();
        let vectors = Array2::<f32>::zeros((2, 10));
        let err = model.encode_embedding(vectors.view()).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { expected: 4, got: 10, .. }));
    }

    #[test]
    fn test_rows_are_unit_norm() {
        let model = model();
        let (images, vectors) = inputs(4);
        let pair = model.embed_pair(images.view(), vectors.view()).unwrap();
        for row in pair.vision.axis_iter(Axis(0)) {
            assert!((row.dot(&row) - 1.0).abs() < 1e-5);
        }
    }
}
