use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{Error, Result};

/// Affine projection `y = x W + b` with `W` stored as `[in, out]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    pub kernel: Array2<f32>,
    pub bias: Array1<f32>,
}

/// Gradients of a [`Linear`] layer, same shapes as its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearGrads {
    pub kernel: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Linear {
    /// Creates a layer with LeCun-normal kernel (`std = 1/sqrt(in)`) and zero bias.
    pub fn new<R: Rng + ?Sized>(in_dim: usize, out_dim: usize, rng: &mut R) -> Result<Self> {
        let std = 1.0 / (in_dim.max(1) as f32).sqrt();
        let normal = Normal::new(0.0, std).map_err(|e| Error::Config(e.to_string()))?;

        Ok(Self {
            kernel: Array2::from_shape_fn((in_dim, out_dim), |_| normal.sample(rng)),
            bias: Array1::zeros(out_dim),
        })
    }

    pub fn in_dim(&self) -> usize {
        self.kernel.nrows()
    }

    pub fn out_dim(&self) -> usize {
        self.kernel.ncols()
    }

    pub fn forward(&self, x: ArrayView2<'_, f32>) -> Array2<f32> {
        x.dot(&self.kernel) + &self.bias
    }

    /// Parameter gradients given the layer input and the gradient w.r.t. its output.
    pub fn backward(&self, x: ArrayView2<'_, f32>, grad_out: ArrayView2<'_, f32>) -> LinearGrads {
        LinearGrads {
            kernel: x.t().dot(&grad_out),
            bias: grad_out.sum_axis(Axis(0)),
        }
    }
}

impl LinearGrads {
    pub fn zeros_like(layer: &Linear) -> Self {
        Self {
            kernel: Array2::zeros(layer.kernel.raw_dim()),
            bias: Array1::zeros(layer.bias.raw_dim()),
        }
    }

    pub fn accumulate(&mut self, other: &LinearGrads) {
        self.kernel += &other.kernel;
        self.bias += &other.bias;
    }
}
