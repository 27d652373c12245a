use thiserror::Error;

use vip_core::CoreError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("Invalid patch geometry: {0}")]
    InvalidGeometry(String),

    #[error("Confidence threshold must lie in (0, 1], got {0}")]
    InvalidThreshold(f32),

    #[error("Temperature must be finite and > 0, got {0}")]
    InvalidTemperature(f32),

    #[error("Query budget {budget} for sample {sample} exceeds the {num_patches} available patches")]
    BudgetOutOfRange {
        sample: usize,
        budget: usize,
        num_patches: usize,
    },

    #[error("Sample {sample} has no unqueried patches left")]
    NoCandidates { sample: usize },

    #[error("Logits sequence is empty")]
    EmptyTrajectory,

    #[error("Rollout length must be in [1, {num_patches}], got {steps}")]
    InvalidStepCount { steps: usize, num_patches: usize },

    #[error(transparent)]
    Core(#[from] CoreError),
}
