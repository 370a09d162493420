//! Update rules for the trainable parameter subset.

mod adam;
mod gradient_descent;

pub use adam::{Adam, Moments};
pub use gradient_descent::GradientDescent;

use crate::config::{OptimizerKind, TrainingConfig};
use crate::error::{Error, Result};
use crate::model::{Gradients, ParamId, TrainableParams};

/// Defines the strategy for updating the trainable parameters from a gradient.
///
/// Only [`TrainableParams`] can be passed in, so frozen parameters are out of
/// reach of every implementation.
pub trait Optimizer: Send {
    /// Applies one update step.
    ///
    /// # Returns
    /// A `ShapeMismatch` error if a gradient's size differs from its parameter's.
    fn update(&mut self, params: &mut TrainableParams, grads: &Gradients) -> Result<()>;

    /// Number of updates applied so far.
    fn steps(&self) -> u64;
}

/// Build the optimizer named by the training configuration.
pub fn from_config(config: &TrainingConfig, params: &TrainableParams) -> Box<dyn Optimizer> {
    match config.optimizer {
        OptimizerKind::Adam => Box::new(Adam::new(params, config.learning_rate)),
        OptimizerKind::Sgd => Box::new(GradientDescent::new(config.learning_rate)),
    }
}

fn check_sizes(params: &TrainableParams, grads: &Gradients) -> Result<()> {
    for id in ParamId::ALL {
        let expected = params.get(id).len();
        let got = grads.get(id).len();
        if expected != got {
            return Err(Error::ShapeMismatch {
                a: "gradient",
                b: "parameter",
                expected,
                got,
            });
        }
    }
    Ok(())
}
