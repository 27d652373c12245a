//! # vip-train
//!
//! Training and evaluation loop for sequential patch acquisition: an MLP
//! querier learns which patch to reveal next, an MLP classifier learns to
//! predict from whatever is revealed so far.

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod loss;
pub mod metrics;
pub mod models;
pub mod nn;
pub mod optim;
pub mod schedule;
pub mod trainer;

pub use config::{DataSource, RelaxationKind, TrainConfig};
pub use data::{load_mnist, synthetic, ImageDataset};
pub use error::{CheckpointError, ConfigError, DatasetError, TrainError, TrainResult};
pub use metrics::{EpochSummary, EvalReport, StepStats};
pub use trainer::{RunSummary, Trainer};
