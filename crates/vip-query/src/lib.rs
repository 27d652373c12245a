//! # vip-query
//!
//! Sequential patch acquisition for interpretable prediction: an image is
//! revealed one patch at a time, a querier decides which patch to reveal next,
//! and a classifier predicts from whatever has been revealed so far.
//!
//! ## Modules
//!
//! - [`geometry`]: patch index space (tiled or sliding windows)
//! - [`mask`]: set-only `(batch, P)` query masks
//! - [`reveal`]: partial images from a mask and the ground truth
//! - [`selector`]: relaxed and greedy query selection, mask/image updates
//! - [`sampling`]: random and querier-driven query histories for training
//! - [`rollout`]: greedy inference trajectories
//! - [`stopping`]: confidence-based stopping over a trajectory
//! - [`model`]: classifier and querier contracts

pub mod error;
pub mod geometry;
pub mod mask;
pub mod model;
pub mod reveal;
pub mod rollout;
pub mod sampling;
pub mod selector;
pub mod stopping;

pub use error::QueryError;
pub use geometry::{patch_bounds, PatchGrid, PatchLayout};
pub use mask::QueryMask;
pub use model::{Classifier, Querier};
pub use reveal::{PatchRevealer, DEFAULT_PLACEHOLDER};
pub use rollout::{greedy_rollout, RolloutStep, Trajectory};
pub use sampling::{draw_budgets, AdaptiveSampler, RandomSampler, SamplingStrategy};
pub use selector::{
    softmax_backward, AppliedQuery, GumbelSoftmax, QuerySelector, QueryVector, Relaxation,
    RelaxedQuery, TemperedSoftmax,
};
pub use stopping::{max_probabilities, queries_needed, StoppingCriterion};

pub type Result<T> = std::result::Result<T, QueryError>;
