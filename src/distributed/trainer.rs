use ndarray::{s, Array2, ArrayView2};
use serde::Serialize;
use std::fmt;
use std::ops::Range;

use super::{DeviceMesh, ShardPlan};
use crate::data::SampleBatch;
use crate::error::{Error, Result};
use crate::loss::{accuracy, contrastive_loss_with_grad};
use crate::model::{
    l2_normalize_backward, l2_normalize_rows, similarity, Gradients, VisionLocationModel,
};
use crate::optim::Optimizer;

/// Where a training step currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Idle,
    BatchLoaded,
    Sharded,
    ForwardComputed,
    GradientComputed,
    ParametersUpdated,
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepState::Idle => "idle",
            StepState::BatchLoaded => "batch-loaded",
            StepState::Sharded => "sharded",
            StepState::ForwardComputed => "forward-computed",
            StepState::GradientComputed => "gradient-computed",
            StepState::ParametersUpdated => "parameters-updated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StepMetrics {
    /// Number of steps run so far, this one included. Steps whose update was
    /// skipped still count.
    pub step: u64,
    pub loss: f32,
    pub vision_loss: f32,
    pub location_loss: f32,
    pub accuracy: f32,
    /// `false` when the loss or the gradients came out NaN or infinite; the
    /// parameters were then left as they were.
    pub finite: bool,
}

/// What one device keeps from its forward pass for the backward pass.
struct ShardForward {
    rows: Range<usize>,
    /// Backbone output `[n, F]`; input to the vision projection.
    features: Array2<f32>,
    /// Projected, not yet normalized `[n, P]`.
    vision: Array2<f32>,
    embedding: Array2<f32>,
}

/// Synchronous data-parallel training over a [`DeviceMesh`].
///
/// A step shards the batch, runs the backbone and both projections per device,
/// gathers the projected features to compute the global similarity and loss,
/// scatters the feature gradients back, sums the per-device projection
/// gradients and applies one optimizer update. Only [`TrainableParams`] ever
/// receive gradients; the frozen backbone is read-only by construction.
///
/// [`TrainableParams`]: crate::model::TrainableParams
pub struct Trainer {
    model: VisionLocationModel,
    optimizer: Box<dyn Optimizer>,
    plan: ShardPlan,
    mesh: DeviceMesh,
    state: StepState,
    steps: u64,
}

impl Trainer {
    pub fn new(
        model: VisionLocationModel,
        optimizer: Box<dyn Optimizer>,
        plan: ShardPlan,
    ) -> Result<Self> {
        let mesh = DeviceMesh::new(&plan)?;
        tracing::info!(
            devices = plan.device_count(),
            per_device_batch = plan.per_device_batch(),
            trainable_params = model.trainable().num_params(),
            backbone = %model.frozen().backbone_name(),
            "Trainer ready"
        );
        Ok(Self {
            model,
            optimizer,
            plan,
            mesh,
            state: StepState::Idle,
            steps: 0,
        })
    }

    pub fn model(&self) -> &VisionLocationModel {
        &self.model
    }

    pub fn into_model(self) -> VisionLocationModel {
        self.model
    }

    pub fn plan(&self) -> &ShardPlan {
        &self.plan
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn frozen_fingerprint(&self) -> &str {
        self.model.frozen().fingerprint()
    }

    /// Run one full training step on `batch`.
    ///
    /// Any error leaves the parameters untouched and the trainer back in
    /// [`StepState::Idle`]. A non-finite loss or gradient is not an error: the
    /// update is skipped, the step is logged and reported through
    /// [`StepMetrics::finite`], and training can go on with the next batch.
    pub fn step(&mut self, batch: &SampleBatch) -> Result<StepMetrics> {
        let result = self.run_step(batch);
        if result.is_err() {
            advance(&mut self.state, StepState::Idle);
        }
        result
    }

    fn run_step(&mut self, batch: &SampleBatch) -> Result<StepMetrics> {
        advance(&mut self.state, StepState::BatchLoaded);
        let n = batch.check_rows()?;
        self.model.check_embedding_dim(batch.embedding_dim())?;

        let shards = self.plan.shards(n);
        advance(&mut self.state, StepState::Sharded);

        let model = &self.model;
        let forwards = self
            .mesh
            .run(|device| forward_shard(model, batch, shards[device].clone()))
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        // Gather: shards are contiguous and in device order.
        let projection_dim = model.projection_dim();
        let mut vision = Array2::<f32>::zeros((n, projection_dim));
        let mut embedding = Array2::<f32>::zeros((n, projection_dim));
        for shard in &forwards {
            vision
                .slice_mut(s![shard.rows.clone(), ..])
                .assign(&shard.vision);
            embedding
                .slice_mut(s![shard.rows.clone(), ..])
                .assign(&shard.embedding);
        }

        let (u, u_norms) = l2_normalize_rows(vision.view());
        let (v, v_norms) = l2_normalize_rows(embedding.view());
        let sim = similarity(u.view(), v.view());
        let (loss, d_sim) = contrastive_loss_with_grad(sim.view())?;
        let accuracy = accuracy(sim.view());
        advance(&mut self.state, StepState::ForwardComputed);

        // Scatter: dL/du = dS v, dL/dv = dS^T u, then through the normalization.
        let d_u = d_sim.dot(&v);
        let d_v = d_sim.t().dot(&u);
        let d_vision = l2_normalize_backward(u.view(), u_norms.view(), d_u.view());
        let d_embedding = l2_normalize_backward(v.view(), v_norms.view(), d_v.view());

        let partials = self.mesh.run(|device| {
            backward_shard(
                model,
                batch,
                &forwards[device],
                d_vision.view(),
                d_embedding.view(),
            )
        });

        // All-reduce.
        let mut grads = Gradients::zeros_like(model.trainable());
        for partial in &partials {
            grads.accumulate(partial);
        }
        advance(&mut self.state, StepState::GradientComputed);

        let finite = loss.is_finite() && grads.is_finite();
        if finite {
            self.optimizer.update(self.model.trainable_mut(), &grads)?;
            advance(&mut self.state, StepState::ParametersUpdated);
        } else {
            tracing::warn!(
                step = self.steps + 1,
                loss = loss.loss,
                "Non-finite loss or gradients; skipping the update"
            );
        }
        self.steps += 1;

        let metrics = StepMetrics {
            step: self.steps,
            loss: loss.loss,
            vision_loss: loss.vision_loss,
            location_loss: loss.location_loss,
            accuracy,
            finite,
        };

        advance(&mut self.state, StepState::Idle);
        Ok(metrics)
    }
}

impl fmt::Debug for Trainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trainer")
            .field("model", &self.model)
            .field("optimizer_steps", &self.optimizer.steps())
            .field("plan", &self.plan)
            .field("state", &self.state)
            .field("steps", &self.steps)
            .finish()
    }
}

fn advance(state: &mut StepState, next: StepState) {
    tracing::trace!(from = %state, to = %next, "Step state");
    *state = next;
}

fn forward_shard(
    model: &VisionLocationModel,
    batch: &SampleBatch,
    rows: Range<usize>,
) -> Result<ShardForward> {
    let trainable = model.trainable();
    let vectors = batch.embeddings.slice(s![rows.clone(), ..]);

    // A device with no rows never calls the backbone.
    let features = if rows.is_empty() {
        Array2::zeros((0, model.frozen().feature_dim()))
    } else {
        let images = batch.images.slice(s![rows.clone(), .., .., ..]);
        model.frozen().extract(images)?
    };

    if features.nrows() != rows.len() {
        return Err(Error::ShapeMismatch {
            a: "shard features",
            b: "shard rows",
            expected: rows.len(),
            got: features.nrows(),
        });
    }

    Ok(ShardForward {
        vision: trainable.vision_projection.forward(features.view()),
        embedding: trainable.embedding_projection.forward(vectors),
        features,
        rows,
    })
}

fn backward_shard(
    model: &VisionLocationModel,
    batch: &SampleBatch,
    shard: &ShardForward,
    d_vision: ArrayView2<'_, f32>,
    d_embedding: ArrayView2<'_, f32>,
) -> Gradients {
    let trainable = model.trainable();
    let rows = shard.rows.clone();

    Gradients {
        vision_projection: trainable
            .vision_projection
            .backward(shard.features.view(), d_vision.slice(s![rows.clone(), ..])),
        embedding_projection: trainable.embedding_projection.backward(
            batch.embeddings.slice(s![rows.clone(), ..]),
            d_embedding.slice(s![rows, ..]),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::contrastive_loss;
    use crate::model::{FrozenParams, ParamId, PatchPoolBackbone, TrainableParams};
    use crate::optim::GradientDescent;
    use ndarray::Array4;
    use std::sync::Arc;

    fn trainer(devices: usize) -> Trainer {
        let backbone = PatchPoolBackbone::new(2, 6, 1).unwrap();
        let frozen = Arc::new(FrozenParams::new(Box::new(backbone)));
        let model = VisionLocationModel::new(frozen, 3, 4, 2).unwrap();
        let plan = ShardPlan::new(devices, 2).unwrap();
        Trainer::new(model, Box::new(GradientDescent::new(0.1)), plan).unwrap()
    }

    fn batch(n: usize) -> SampleBatch {
        let images = Array4::from_shape_fn((n, 4, 4, 3), |(i, y, x, c)| {
            (((i * 5 + y * 2 + x + c * 3) % 7) as f32 / 3.0) - 1.0
        });
        let embeddings =
            Array2::from_shape_fn((n, 3), |(i, j)| ((i * 3 + j) % 5) as f32 / 2.0 - 1.0);
        SampleBatch::new(images, embeddings).unwrap()
    }

    #[test]
    fn test_step_returns_to_idle() {
        let mut trainer = trainer(2);
        let metrics = trainer.step(&batch(4)).unwrap();

        assert_eq!(trainer.state(), StepState::Idle);
        assert_eq!(metrics.step, 1);
        assert_eq!(trainer.steps(), 1);
        assert!(metrics.finite);
        assert!((metrics.loss - 0.5 * (metrics.vision_loss + metrics.location_loss)).abs() < 1e-6);
    }

    #[test]
    fn test_shape_mismatch_leaves_params_untouched() {
        let mut trainer = trainer(2);
        let before = trainer.model().trainable().clone();

        let bad = SampleBatch {
            images: Array4::zeros((4, 4, 4, 3)),
            embeddings: Array2::zeros((3, 3)),
        };
        let err = trainer.step(&bad).unwrap_err();

        assert!(matches!(err, Error::ShapeMismatch { .. }));
        assert_eq!(trainer.state(), StepState::Idle);
        assert_eq!(trainer.model().trainable(), &before);
        assert_eq!(trainer.steps(), 0);
    }

    #[test]
    fn test_wrong_embedding_dim() {
        let mut trainer = trainer(1);
        let bad = SampleBatch::new(Array4::zeros((2, 4, 4, 3)), Array2::zeros((2, 5))).unwrap();
        assert!(matches!(
            trainer.step(&bad),
            Err(Error::ShapeMismatch { expected: 3, got: 5, .. })
        ));
    }

    #[test]
    fn test_non_finite_step_skips_update() {
        let mut trainer = trainer(2);
        let before = trainer.model().trainable().clone();

        let mut poisoned = batch(4);
        poisoned.embeddings[[1, 0]] = f32::NAN;
        let metrics = trainer.step(&poisoned).unwrap();

        assert!(!metrics.finite);
        assert_eq!(metrics.step, 1);
        assert_eq!(trainer.state(), StepState::Idle);
        assert_eq!(trainer.model().trainable(), &before);

        // The next clean batch trains normally.
        let metrics = trainer.step(&batch(4)).unwrap();
        assert!(metrics.finite);
        assert_eq!(metrics.step, 2);
        assert_ne!(trainer.model().trainable(), &before);
    }

    #[test]
    fn test_step_gradient_matches_finite_differences() {
        let backbone = PatchPoolBackbone::new(2, 6, 1).unwrap();
        let frozen = Arc::new(FrozenParams::new(Box::new(backbone)));
        let model = VisionLocationModel::new(Arc::clone(&frozen), 3, 4, 2).unwrap();
        let before = model.trainable().clone();
        let plan = ShardPlan::new(2, 2).unwrap();
        // With lr = 1 the applied update is exactly the gradient.
        let mut trainer = Trainer::new(model, Box::new(GradientDescent::new(1.0)), plan).unwrap();

        let batch = batch(4);
        trainer.step(&batch).unwrap();
        let after = trainer.model().trainable().clone();

        let loss_at = |params: TrainableParams| {
            let model = VisionLocationModel::from_parts(Arc::clone(&frozen), params).unwrap();
            let sim = model
                .forward(batch.images.view(), batch.embeddings.view())
                .unwrap();
            contrastive_loss(sim.view()).unwrap().loss
        };

        let eps = 1e-2;
        let entries: [(ParamId, &[usize]); 6] = [
            (ParamId::VisionKernel, &[0, 0]),
            (ParamId::VisionKernel, &[3, 2]),
            (ParamId::VisionBias, &[1]),
            (ParamId::EmbeddingKernel, &[1, 1]),
            (ParamId::EmbeddingKernel, &[2, 3]),
            (ParamId::EmbeddingBias, &[0]),
        ];
        for (id, index) in entries {
            let analytic = before.get(id)[index] - after.get(id)[index];

            let mut plus = before.clone();
            plus.get_mut(id)[index] += eps;
            let mut minus = before.clone();
            minus.get_mut(id)[index] -= eps;
            let numeric = (loss_at(plus) - loss_at(minus)) / (2.0 * eps);

            assert!(
                (analytic - numeric).abs() < 2e-3 + 0.02 * numeric.abs(),
                "{} {:?}: analytic {} vs numeric {}",
                id,
                index,
                analytic,
                numeric
            );
        }
    }

    #[test]
    fn test_more_devices_than_rows() {
        let mut trainer = trainer(4);
        let metrics = trainer.step(&batch(2)).unwrap();
        assert!(metrics.finite);
    }
}
