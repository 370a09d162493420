use ndarray::Zip;

use super::{check_sizes, Optimizer};
use crate::error::Result;
use crate::model::{Gradients, ParamId, TrainableParams};

/// Plain gradient descent: `p -= lr * g`.
#[derive(Debug, Clone)]
pub struct GradientDescent {
    learning_rate: f32,
    steps: u64,
}

impl GradientDescent {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            steps: 0,
        }
    }
}

impl Optimizer for GradientDescent {
    fn update(&mut self, params: &mut TrainableParams, grads: &Gradients) -> Result<()> {
        check_sizes(params, grads)?;

        let lr = self.learning_rate;
        for id in ParamId::ALL {
            Zip::from(params.get_mut(id))
                .and(grads.get(id))
                .for_each(|p, &g| *p -= lr * g);
        }

        self.steps += 1;
        Ok(())
    }

    fn steps(&self) -> u64 {
        self.steps
    }
}
