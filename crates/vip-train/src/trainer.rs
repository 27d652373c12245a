//! Epoch orchestration: sampling, relaxed query, classifier update, evaluation.
//!
//! ```text
//!   images ─▶ sampler ─▶ mask ─▶ reveal ─▶ querier ─▶ select_train ─▶ soft_update ─▶ classifier ─▶ loss
//! ```
//!
//! The backward pass runs the same chain in reverse with hand-written
//! gradients; every stochastic component draws from RNGs seeded from the
//! run seed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};
use vip_core::{grad_norm, Gradients, Module, Tensor};
use vip_query::{
    draw_budgets, greedy_rollout, AdaptiveSampler, GumbelSoftmax, PatchRevealer, QueryMask,
    QuerySelector, RandomSampler, SamplingStrategy, StoppingCriterion, TemperedSoftmax,
};

use crate::checkpoint::{load_checkpoint, save_checkpoint};
use crate::config::{RelaxationKind, TrainConfig};
use crate::data::ImageDataset;
use crate::error::TrainResult;
use crate::loss::cross_entropy;
use crate::metrics::{
    EpochSummary, EvalAccumulator, EvalReport, MetricRecord, MetricsLog, StepStats,
};
use crate::models::{MlpClassifier, MlpQuerier};
use crate::optim::Sgd;
use crate::schedule::{cosine_lr, TemperatureSchedule};

/// Everything a finished run reports.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    pub epochs: Vec<EpochSummary>,
    pub evals: Vec<EvalReport>,
}

pub struct Trainer {
    config: TrainConfig,
    classifier: MlpClassifier,
    querier: MlpQuerier,
    selector: QuerySelector,
    sampler: RandomSampler,
    rng: ChaCha8Rng,
    optimizer: Sgd,
    temperature: TemperatureSchedule,
    stopping: StoppingCriterion,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> TrainResult<Self> {
        config.validate()?;
        let grid = config.grid;
        let revealer = PatchRevealer::with_placeholder(grid, config.placeholder);
        let selector = match config.relaxation {
            RelaxationKind::Gumbel => QuerySelector::new(
                revealer,
                GumbelSoftmax {
                    hard: config.straight_through,
                },
            ),
            RelaxationKind::Softmax => QuerySelector::new(
                revealer,
                TemperedSoftmax {
                    hard: config.straight_through,
                },
            ),
        };

        let mut init_rng = ChaCha8Rng::seed_from_u64(config.seed);
        let classifier = MlpClassifier::new(grid, &config.classifier_hidden, config.num_classes, &mut init_rng);
        let querier = MlpQuerier::new(grid, &config.querier_hidden, &mut init_rng);
        info!(
            patches = grid.num_patches(),
            classifier_params = classifier.param_count(),
            querier_params = querier.param_count(),
            relaxation = selector.relaxation().name(),
            "models built"
        );

        Ok(Self {
            sampler: RandomSampler::new(config.seed.wrapping_add(1)),
            rng: ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(2)),
            optimizer: Sgd::new(config.lr, config.momentum),
            temperature: TemperatureSchedule::new(config.tau_start, config.tau_end, config.epochs),
            stopping: StoppingCriterion::new(config.threshold)?,
            classifier,
            querier,
            selector,
            config,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn classifier(&self) -> &MlpClassifier {
        &self.classifier
    }

    pub fn querier(&self) -> &MlpQuerier {
        &self.querier
    }

    pub fn selector(&self) -> &QuerySelector {
        &self.selector
    }

    /// Starting mask and partial image for one training batch.
    fn initial_state(&mut self, images: &Tensor) -> TrainResult<(QueryMask, Tensor)> {
        let batch = images.batch_size();
        let p = self.config.grid.num_patches();
        let mask = match self.config.sampling {
            SamplingStrategy::Random => self.sampler.sample(self.config.max_queries, p, batch),
            SamplingStrategy::RandomVariable => {
                self.sampler.sample_variable(self.config.max_queries, p, batch)
            }
            SamplingStrategy::Adaptive => {
                let budgets = draw_budgets(&mut self.rng, batch, p);
                let state = AdaptiveSampler::new(&self.selector).sample(images, &budgets, &self.querier)?;
                return Ok(state);
            }
        };
        let partial = self.selector.revealer().reveal(&mask, images)?;
        Ok((mask, partial))
    }

    /// One optimisation step on a batch at temperature `tau` and learning rate `lr`.
    pub fn train_step(&mut self, images: &Tensor, labels: &[usize], tau: f32, lr: f32) -> TrainResult<StepStats> {
        let (mask, partial) = self.initial_state(images)?;

        let (scores, querier_cache) = self.querier.forward_train(&partial)?;
        let relaxed = self.selector.select_train(&scores, &mask, tau, &mut self.rng)?;
        let soft = self.selector.soft_update(&partial, images, &mask, &relaxed.weights)?;
        let (logits, classifier_cache) = self.classifier.forward_train(&soft)?;
        let (loss, grad_logits) = cross_entropy(&logits, labels)?;

        let mut classifier_grads = Gradients::new();
        let grad_soft = self.classifier.backward(&classifier_cache, &grad_logits, &mut classifier_grads)?;
        let grad_weights = self.selector.soft_update_backward(&grad_soft, images, &mask)?;
        let grad_scores = self.selector.relaxation_backward(&relaxed, &grad_weights)?;
        let mut querier_grads = Gradients::new();
        self.querier.backward(&querier_cache, &grad_scores, &mut querier_grads)?;

        let stats = StepStats {
            loss,
            lr,
            grad_norm_classifier: grad_norm(&classifier_grads),
            grad_norm_querier: grad_norm(&querier_grads),
        };

        self.optimizer.set_lr(lr);
        self.optimizer.step("classifier", &mut self.classifier, &classifier_grads)?;
        self.optimizer.step("querier", &mut self.querier, &querier_grads)?;
        Ok(stats)
    }

    /// One pass over `data` with the epoch's temperature and learning rate.
    pub fn train_epoch(&mut self, data: &ImageDataset, epoch: usize) -> TrainResult<EpochSummary> {
        let tau = self.temperature.at(epoch);
        let lr = cosine_lr(epoch, self.config.epochs, self.config.lr);
        let mut steps = Vec::new();
        for (images, labels) in data.batches(self.config.batch_size) {
            let stats = self.train_step(&images, labels, tau, lr)?;
            debug!(epoch, step = steps.len(), loss = stats.loss, "train step");
            steps.push(stats);
        }
        let summary = EpochSummary::from_steps(epoch, tau, lr, &steps);
        info!(
            epoch,
            tau,
            lr,
            loss = summary.loss_avg,
            grad_norm_cls = summary.grad_norm_classifier_avg,
            grad_norm_qry = summary.grad_norm_querier_avg,
            "epoch done"
        );
        Ok(summary)
    }

    /// Greedy rollouts of `max_queries_test` steps over the whole test set.
    pub fn evaluate(&self, data: &ImageDataset, epoch: usize) -> TrainResult<EvalReport> {
        let mut acc = EvalAccumulator::new();
        for (images, labels) in data.batches(self.config.batch_size) {
            let trajectory = greedy_rollout(
                &images,
                &self.classifier,
                &self.querier,
                &self.selector,
                self.config.max_queries_test,
            )?;
            let counts = self.stopping.queries_needed(&trajectory.logits())?;
            let ip_preds = trajectory.predictions_at(&counts)?;
            acc.push(labels, &trajectory.final_predictions(), &ip_preds, &counts);
        }
        let report = acc.finish(epoch);
        info!(
            epoch,
            acc_max = report.acc_max,
            acc_ip = report.acc_ip,
            qry_need_avg = report.qry_need_avg,
            qry_need_std = report.qry_need_std,
            "evaluation"
        );
        Ok(report)
    }

    fn checkpoint_due(&self, epoch: usize) -> bool {
        epoch % self.config.eval_every == 0 || epoch + 1 == self.config.epochs
    }

    pub fn save_checkpoint(&self, path: &Path, epoch: usize) -> TrainResult<()> {
        let metadata = HashMap::from([
            ("epoch".to_string(), epoch.to_string()),
            ("run_name".to_string(), self.config.run_name.clone()),
        ]);
        let modules: [(&str, &dyn Module); 2] =
            [("classifier", &self.classifier), ("querier", &self.querier)];
        save_checkpoint(path, &modules, Some(metadata))
    }

    pub fn load_checkpoint(&mut self, path: &Path) -> TrainResult<()> {
        let mut modules: [(&str, &mut dyn Module); 2] =
            [("classifier", &mut self.classifier), ("querier", &mut self.querier)];
        load_checkpoint(path, &mut modules)
    }

    /// Full run: writes `params.json`, appends to `metrics.jsonl` and saves
    /// `ckpt/epoch{e}.safetensors` under the run directory.
    pub fn run(&mut self, train: &ImageDataset, test: &ImageDataset) -> TrainResult<RunSummary> {
        let run_dir = self.config.run_dir();
        std::fs::create_dir_all(run_dir.join("ckpt"))?;
        std::fs::write(run_dir.join("params.json"), self.config.to_json()?)?;
        let mut log = MetricsLog::create(&run_dir.join("metrics.jsonl"))?;
        info!(
            run_dir = %run_dir.display(),
            train = train.len(),
            test = test.len(),
            epochs = self.config.epochs,
            sampling = %self.config.sampling,
            "starting run"
        );

        let mut summary = RunSummary::default();
        for epoch in 0..self.config.epochs {
            let epoch_summary = self.train_epoch(train, epoch)?;
            log.record(&MetricRecord::Epoch(epoch_summary.clone()))?;
            summary.epochs.push(epoch_summary);

            if self.checkpoint_due(epoch) {
                self.save_checkpoint(&checkpoint_path(&run_dir, epoch), epoch)?;
                let report = self.evaluate(test, epoch)?;
                log.record(&MetricRecord::Eval(report.clone()))?;
                summary.evals.push(report);
            }
        }
        Ok(summary)
    }
}

pub fn checkpoint_path(run_dir: &Path, epoch: usize) -> PathBuf {
    run_dir.join("ckpt").join(format!("epoch{}.safetensors", epoch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic;

    fn tiny_trainer(sampling: SamplingStrategy) -> (Trainer, ImageDataset) {
        let mut cfg = TrainConfig::tiny();
        cfg.sampling = sampling;
        let data = synthetic(&cfg.grid, 16, cfg.num_classes, 1).unwrap();
        (Trainer::new(cfg).unwrap(), data)
    }

    #[test]
    fn test_train_step_all_strategies() {
        for sampling in [
            SamplingStrategy::Random,
            SamplingStrategy::RandomVariable,
            SamplingStrategy::Adaptive,
        ] {
            let (mut trainer, data) = tiny_trainer(sampling);
            let (images, labels) = data.batches(8).next().unwrap();
            let stats = trainer.train_step(&images, labels, 1.0, 0.05).unwrap();
            assert!(stats.loss.is_finite() && stats.loss > 0.0, "{:?}", sampling);
            assert!(stats.grad_norm_classifier > 0.0);
            assert!(stats.grad_norm_querier.is_finite());
        }
    }

    #[test]
    fn test_querier_receives_gradient() {
        let (mut trainer, data) = tiny_trainer(SamplingStrategy::Random);
        let (images, labels) = data.batches(8).next().unwrap();
        let before = trainer.querier().state_dict();
        let stats = trainer.train_step(&images, labels, 1.0, 0.05).unwrap();
        assert!(stats.grad_norm_querier > 0.0);
        assert_ne!(trainer.querier().state_dict(), before);
    }

    #[test]
    fn test_mnist_preset_trains_querier() {
        let cfg = TrainConfig::mnist();
        let data = synthetic(&cfg.grid, 4, cfg.num_classes, 3).unwrap();
        let mut trainer = Trainer::new(cfg).unwrap();
        let (images, labels) = data.batches(4).next().unwrap();
        let before = trainer.querier().state_dict();
        let stats = trainer.train_step(&images, labels, 1.0, 0.05).unwrap();
        assert!(stats.grad_norm_querier > 0.0);
        assert_ne!(trainer.querier().state_dict(), before);
    }

    #[test]
    fn test_full_fixed_budget_rejected() {
        let mut cfg = TrainConfig::tiny();
        cfg.max_queries = cfg.grid.num_patches();
        assert!(Trainer::new(cfg).is_err());
    }

    #[test]
    fn test_training_reduces_loss_on_fixed_batch() {
        let (mut trainer, data) = tiny_trainer(SamplingStrategy::Random);
        let (images, labels) = data.batches(16).next().unwrap();
        let losses: Vec<f32> = (0..80)
            .map(|_| trainer.train_step(&images, labels, 0.5, 0.02).unwrap().loss)
            .collect();
        let head = losses[..5].iter().sum::<f32>() / 5.0;
        let tail = losses[75..].iter().sum::<f32>() / 5.0;
        assert!(tail < head, "loss went from {} to {}", head, tail);
    }

    #[test]
    fn test_evaluate_bounds() {
        let (trainer, data) = tiny_trainer(SamplingStrategy::Random);
        let report = trainer.evaluate(&data, 0).unwrap();
        assert_eq!(report.samples, 16);
        let max = trainer.config().max_queries_test as f64;
        assert!(report.qry_need_avg >= 1.0 && report.qry_need_avg <= max);
        assert!((0.0..=1.0).contains(&report.acc_max));
        assert!((0.0..=1.0).contains(&report.acc_ip));
    }

    #[test]
    fn test_checkpoint_roundtrip_preserves_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.safetensors");
        let (trainer, data) = tiny_trainer(SamplingStrategy::Random);
        trainer.save_checkpoint(&path, 0).unwrap();

        let mut cfg = TrainConfig::tiny();
        cfg.seed = 99;
        let mut other = Trainer::new(cfg).unwrap();
        other.load_checkpoint(&path).unwrap();
        assert_eq!(other.evaluate(&data, 0).unwrap(), trainer.evaluate(&data, 0).unwrap());
    }

    #[test]
    fn test_checkpoint_schedule() {
        let (trainer, _) = tiny_trainer(SamplingStrategy::Random);
        let mut cfg = trainer.config().clone();
        cfg.epochs = 25;
        cfg.eval_every = 10;
        let t = Trainer::new(cfg).unwrap();
        let due: Vec<usize> = (0..25).filter(|&e| t.checkpoint_due(e)).collect();
        assert_eq!(due, vec![0, 10, 20, 24]);
    }
}
