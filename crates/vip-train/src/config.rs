//! Run configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use vip_query::{PatchGrid, PatchLayout, SamplingStrategy, DEFAULT_PLACEHOLDER};

use crate::error::{ConfigError, TrainResult};

/// Which continuous relaxation the training-time selector uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RelaxationKind {
    #[default]
    Gumbel,
    Softmax,
}

/// Where training and test images come from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DataSource {
    /// MNIST IDX files under `dir`.
    Mnist { dir: PathBuf },
    /// Seeded class-dependent blobs.
    Synthetic { train: usize, test: usize },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub run_name: String,
    pub seed: u64,
    pub epochs: usize,
    pub batch_size: usize,
    pub lr: f32,
    pub momentum: f32,
    pub tau_start: f32,
    pub tau_end: f32,
    pub sampling: SamplingStrategy,
    /// Patches revealed by the random samplers.
    pub max_queries: usize,
    /// Greedy rollout length at evaluation.
    pub max_queries_test: usize,
    /// Stopping confidence for `queries_needed`.
    pub threshold: f32,
    pub eval_every: usize,
    pub relaxation: RelaxationKind,
    pub straight_through: bool,
    pub grid: PatchGrid,
    pub placeholder: f32,
    pub num_classes: usize,
    pub classifier_hidden: Vec<usize>,
    pub querier_hidden: Vec<usize>,
    pub data: DataSource,
    pub save_dir: PathBuf,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self::mnist()
    }
}

impl TrainConfig {
    /// 28×28 MNIST with 3×3 sliding patches.
    pub fn mnist() -> Self {
        Self {
            run_name: "mnist".into(),
            seed: 0,
            epochs: 100,
            batch_size: 128,
            lr: 0.05,
            momentum: 0.9,
            tau_start: 1.0,
            tau_end: 0.2,
            sampling: SamplingStrategy::RandomVariable,
            max_queries: 676,
            max_queries_test: 20,
            threshold: 0.85,
            eval_every: 10,
            relaxation: RelaxationKind::Gumbel,
            straight_through: false,
            grid: PatchGrid::mnist(),
            placeholder: DEFAULT_PLACEHOLDER,
            num_classes: 10,
            classifier_hidden: vec![256, 128],
            querier_hidden: vec![256],
            data: DataSource::Mnist {
                dir: PathBuf::from("./data/"),
            },
            save_dir: PathBuf::from("./saved/"),
        }
    }

    /// 8×8 synthetic images with 2×2 tiles, for tests and smoke runs.
    pub fn tiny() -> Self {
        Self {
            run_name: "tiny".into(),
            seed: 0,
            epochs: 2,
            batch_size: 8,
            lr: 0.05,
            momentum: 0.9,
            tau_start: 1.0,
            tau_end: 0.5,
            sampling: SamplingStrategy::Random,
            max_queries: 4,
            max_queries_test: 6,
            threshold: 0.85,
            eval_every: 1,
            relaxation: RelaxationKind::Gumbel,
            straight_through: false,
            grid: PatchGrid {
                channels: 1,
                height: 8,
                width: 8,
                patch_size: 2,
                layout: PatchLayout::Tiled,
            },
            placeholder: DEFAULT_PLACEHOLDER,
            num_classes: 4,
            classifier_hidden: vec![16],
            querier_hidden: vec![16],
            data: DataSource::Synthetic { train: 32, test: 16 },
            save_dir: PathBuf::from("./saved/"),
        }
    }

    /// Checks everything the run would otherwise fail on midway.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.grid;
        PatchGrid::new(g.channels, g.height, g.width, g.patch_size, g.layout)
            .map_err(|e| ConfigError::invalid("grid", e.to_string()))?;

        if self.run_name.is_empty() {
            return Err(ConfigError::invalid("run_name", "must not be empty"));
        }
        if self.epochs == 0 {
            return Err(ConfigError::invalid("epochs", "must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be at least 1"));
        }
        if self.eval_every == 0 {
            return Err(ConfigError::invalid("eval_every", "must be at least 1"));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(ConfigError::invalid("lr", format!("must be > 0, got {}", self.lr)));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(ConfigError::invalid(
                "momentum",
                format!("must be in [0, 1), got {}", self.momentum),
            ));
        }
        for (field, tau) in [("tau_start", self.tau_start), ("tau_end", self.tau_end)] {
            if !(tau.is_finite() && tau > 0.0) {
                return Err(ConfigError::invalid(field, format!("must be > 0, got {}", tau)));
            }
        }
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(ConfigError::invalid(
                "threshold",
                format!("must be in (0, 1], got {}", self.threshold),
            ));
        }
        let p = g.num_patches();
        if self.max_queries_test == 0 || self.max_queries_test > p {
            return Err(ConfigError::invalid(
                "max_queries_test",
                format!("must be in [1, {}], got {}", p, self.max_queries_test),
            ));
        }
        if self.sampling == SamplingStrategy::Random && self.max_queries >= p {
            return Err(ConfigError::invalid(
                "max_queries",
                format!(
                    "fixed random sampling needs fewer than {} queries, got {}; a full mask leaves the querier without gradient",
                    p, self.max_queries
                ),
            ));
        }
        if self.num_classes < 2 {
            return Err(ConfigError::invalid("num_classes", "need at least 2 classes"));
        }
        if self.classifier_hidden.contains(&0) || self.querier_hidden.contains(&0) {
            return Err(ConfigError::invalid("hidden", "layer widths must be non-zero"));
        }
        if let DataSource::Synthetic { train, test } = self.data {
            if train == 0 || test == 0 {
                return Err(ConfigError::invalid("data", "synthetic splits must be non-empty"));
            }
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> TrainResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> TrainResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn load(path: &Path) -> TrainResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Directory holding this run's params, metrics and checkpoints.
    pub fn run_dir(&self) -> PathBuf {
        self.save_dir.join(&self.run_name)
    }
}
