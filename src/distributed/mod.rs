//! Data-parallel execution of training steps across logical devices.
//!
//! The [`ShardPlan`] is an explicit value built once at startup; the
//! [`DeviceMesh`] and [`Trainer`] are constructed from it rather than from any
//! process-wide state, so a single-device plan and a multi-device plan run the
//! same code.

mod mesh;
mod plan;
mod trainer;

pub use mesh::DeviceMesh;
pub use plan::{shard_range, ShardPlan};
pub use trainer::{StepMetrics, StepState, Trainer};
