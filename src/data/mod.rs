//! Preprocessed samples, batches, and the epoch batch stream feeding training.

mod stream;

pub use stream::{BatchStream, StreamItem, StreamOptions};

use ndarray::{Array1, Array2, Array3, Array4, Axis};

use crate::error::{Error, Result};

/// One preprocessed training record: a normalized image and the embedding
/// vector of the same source row. The pairing is never split.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub image_id: String,
    /// `[H, W, 3]`, values in `[-1, 1]`.
    pub image: Array3<f32>,
    pub embedding: Array1<f32>,
}

/// A stacked batch. Row `i` of `images` and row `i` of `embeddings` come from
/// the same [`Sample`].
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    /// `[N, H, W, 3]`
    pub images: Array4<f32>,
    /// `[N, D]`
    pub embeddings: Array2<f32>,
}

impl SampleBatch {
    pub fn new(images: Array4<f32>, embeddings: Array2<f32>) -> Result<Self> {
        let batch = Self { images, embeddings };
        batch.check_rows()?;
        Ok(batch)
    }

    /// Stack samples in order. All images must share one shape and all
    /// embeddings one length.
    pub fn from_samples(samples: &[&Sample]) -> Result<Self> {
        let first = samples.first().ok_or(Error::ShapeMismatch {
            a: "samples",
            b: "minimum batch",
            expected: 1,
            got: 0,
        })?;
        let (h, w, c) = first.image.dim();
        let d = first.embedding.len();

        let mut images = Array4::<f32>::zeros((samples.len(), h, w, c));
        let mut embeddings = Array2::<f32>::zeros((samples.len(), d));

        for (i, sample) in samples.iter().enumerate() {
            if sample.image.dim() != (h, w, c) {
                return Err(Error::ShapeMismatch {
                    a: "sample image",
                    b: "batch image",
                    expected: h * w * c,
                    got: sample.image.len(),
                });
            }
            if sample.embedding.len() != d {
                return Err(Error::ShapeMismatch {
                    a: "sample embedding",
                    b: "batch embedding",
                    expected: d,
                    got: sample.embedding.len(),
                });
            }
            images.index_axis_mut(Axis(0), i).assign(&sample.image);
            embeddings.index_axis_mut(Axis(0), i).assign(&sample.embedding);
        }

        Ok(Self { images, embeddings })
    }

    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn embedding_dim(&self) -> usize {
        self.embeddings.ncols()
    }

    /// Batch size, after checking both tensors agree on it.
    pub fn check_rows(&self) -> Result<usize> {
        let n = self.len();
        if self.embeddings.nrows() != n {
            return Err(Error::ShapeMismatch {
                a: "embeddings",
                b: "images",
                expected: n,
                got: self.embeddings.nrows(),
            });
        }
        Ok(n)
    }

    /// Reorder rows of both tensors by the same index list.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            images: self.images.select(Axis(0), indices),
            embeddings: self.embeddings.select(Axis(0), indices),
        }
    }
}
