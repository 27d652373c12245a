//! Training statistics, evaluation metrics and the JSONL metrics log.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::TrainResult;

/// One optimisation step.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepStats {
    pub loss: f32,
    pub lr: f32,
    pub grad_norm_classifier: f32,
    pub grad_norm_querier: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub tau: f32,
    pub lr: f32,
    pub steps: usize,
    pub loss_avg: f32,
    pub grad_norm_classifier_avg: f32,
    pub grad_norm_querier_avg: f32,
}

impl EpochSummary {
    pub fn from_steps(epoch: usize, tau: f32, lr: f32, steps: &[StepStats]) -> Self {
        let n = steps.len().max(1) as f32;
        let mean = |f: fn(&StepStats) -> f32| steps.iter().map(f).sum::<f32>() / n;
        Self {
            epoch,
            tau,
            lr,
            steps: steps.len(),
            loss_avg: mean(|s| s.loss),
            grad_norm_classifier_avg: mean(|s| s.grad_norm_classifier),
            grad_norm_querier_avg: mean(|s| s.grad_norm_querier),
        }
    }
}

/// Test-set metrics for one evaluation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub epoch: usize,
    pub samples: usize,
    /// Accuracy of the last rollout step.
    pub acc_max: f64,
    /// Accuracy at each sample's own stopping step.
    pub acc_ip: f64,
    pub qry_need_avg: f64,
    /// Population standard deviation over all samples.
    pub qry_need_std: f64,
}

/// Accumulates per-sample results across batches so every metric is a true
/// mean over the whole test set.
#[derive(Clone, Debug, Default)]
pub struct EvalAccumulator {
    samples: usize,
    correct_max: usize,
    correct_ip: usize,
    queries_sum: f64,
    queries_sq_sum: f64,
}

impl EvalAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, labels: &[usize], final_preds: &[usize], ip_preds: &[usize], queries_needed: &[usize]) {
        self.samples += labels.len();
        self.correct_max += labels.iter().zip(final_preds).filter(|(a, b)| a == b).count();
        self.correct_ip += labels.iter().zip(ip_preds).filter(|(a, b)| a == b).count();
        for &q in queries_needed {
            let q = q as f64;
            self.queries_sum += q;
            self.queries_sq_sum += q * q;
        }
    }

    pub fn finish(&self, epoch: usize) -> EvalReport {
        let n = self.samples.max(1) as f64;
        let mean = self.queries_sum / n;
        let var = (self.queries_sq_sum / n - mean * mean).max(0.0);
        EvalReport {
            epoch,
            samples: self.samples,
            acc_max: self.correct_max as f64 / n,
            acc_ip: self.correct_ip as f64 / n,
            qry_need_avg: mean,
            qry_need_std: var.sqrt(),
        }
    }
}

/// A line in `metrics.jsonl`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricRecord {
    Epoch(EpochSummary),
    Eval(EvalReport),
}

/// Append-only JSON-lines writer.
pub struct MetricsLog {
    out: BufWriter<File>,
}

impl MetricsLog {
    pub fn create(path: &Path) -> TrainResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    pub fn record(&mut self, record: &MetricRecord) -> TrainResult<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}
