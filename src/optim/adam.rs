use ndarray::{ArrayD, Zip};
use std::collections::BTreeMap;

use super::{check_sizes, Optimizer};
use crate::error::Result;
use crate::model::{Gradients, ParamId, TrainableParams};

/// First and second moment accumulators of one trainable tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Moments {
    pub m: ArrayD<f32>,
    pub v: ArrayD<f32>,
}

/// Adam with bias-corrected moments.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    beta1_t: f32,
    beta2_t: f32,
    epsilon: f32,
    steps: u64,
    moments: BTreeMap<ParamId, Moments>,
}

impl Adam {
    pub const BETA1: f32 = 0.9;
    pub const BETA2: f32 = 0.999;
    pub const EPSILON: f32 = 1e-8;

    /// Creates an `Adam` optimizer with zeroed moments shaped like `params`.
    pub fn new(params: &TrainableParams, learning_rate: f32) -> Self {
        Self::with_hyperparams(params, learning_rate, Self::BETA1, Self::BETA2, Self::EPSILON)
    }

    /// # Arguments
    /// * `params` - The trainable parameters the moments are shaped after.
    /// * `learning_rate` - The step size.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    pub fn with_hyperparams(
        params: &TrainableParams,
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    ) -> Self {
        let moments = ParamId::ALL
            .iter()
            .map(|&id| {
                let shape = params.get(id).raw_dim();
                (
                    id,
                    Moments {
                        m: ArrayD::zeros(shape.clone()),
                        v: ArrayD::zeros(shape),
                    },
                )
            })
            .collect();

        Self {
            learning_rate,
            beta1,
            beta2,
            beta1_t: 1.,
            beta2_t: 1.,
            epsilon,
            steps: 0,
            moments,
        }
    }

    pub fn moments(&self, id: ParamId) -> Option<&Moments> {
        self.moments.get(&id)
    }
}

impl Optimizer for Adam {
    fn update(&mut self, params: &mut TrainableParams, grads: &Gradients) -> Result<()> {
        check_sizes(params, grads)?;

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
            ..
        } = *self;

        self.beta1_t *= b1;
        self.beta2_t *= b2;

        let bc1 = 1. - self.beta1_t;
        let bc2 = 1. - self.beta2_t;

        for (&id, moments) in self.moments.iter_mut() {
            Zip::from(params.get_mut(id))
                .and(grads.get(id))
                .and(&mut moments.m)
                .and(&mut moments.v)
                .for_each(|p, &g, m, v| {
                    *m = b1 * *m + (1. - b1) * g;
                    *v = b2 * *v + (1. - b2) * g * g;
                    let m_hat = *m / bc1;
                    let v_hat = *v / bc2;
                    *p -= lr * m_hat / (v_hat.sqrt() + eps);
                });
        }

        self.steps += 1;
        Ok(())
    }

    fn steps(&self) -> u64 {
        self.steps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let mut params = TrainableParams::init(3, 2, 2, 0).unwrap();
        let before = params.clone();
        let mut grads = Gradients::zeros_like(&params);
        grads.vision_projection.bias.fill(4.0);
        grads.vision_projection.bias[1] = -0.5;

        let mut adam = Adam::new(&params, 0.1);
        adam.update(&mut params, &grads).unwrap();

        // After bias correction the first step is lr * sign(g).
        let delta = &params.vision_projection.bias - &before.vision_projection.bias;
        assert!((delta[0] + 0.1).abs() < 1e-5);
        assert!((delta[1] - 0.1).abs() < 1e-5);

        // Zero gradient leaves the parameter where it was.
        assert_eq!(params.embedding_projection, before.embedding_projection);
        assert_eq!(adam.steps(), 1);
    }

    #[test]
    fn test_moments_keyed_by_param() {
        let params = TrainableParams::init(3, 2, 4, 0).unwrap();
        let adam = Adam::new(&params, 1e-3);

        for id in ParamId::ALL {
            let moments = adam.moments(id).unwrap();
            assert_eq!(moments.m.shape(), params.get(id).shape());
            assert_eq!(moments.v.shape(), params.get(id).shape());
        }
    }

    #[test]
    fn test_rejects_mismatched_gradient() {
        let mut params = TrainableParams::init(3, 2, 2, 0).unwrap();
        let other = TrainableParams::init(5, 2, 2, 0).unwrap();
        let grads = Gradients::zeros_like(&other);

        let mut adam = Adam::new(&params, 0.1);
        assert!(adam.update(&mut params, &grads).is_err());
        assert_eq!(adam.steps(), 0);
    }
}
