//! Confidence-based stopping: how many queries each sample needed.

use rayon::prelude::*;
use vip_core::{CoreError, Tensor};

use crate::{QueryError, Result};

/// Posterior confidence used by the reference evaluation.
pub const DEFAULT_THRESHOLD: f32 = 0.85;

/// Stops a sample at the first step whose top class probability strictly
/// exceeds `threshold`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StoppingCriterion {
    threshold: f32,
}

impl Default for StoppingCriterion {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }
}

impl StoppingCriterion {
    /// `threshold` must lie in `(0, 1]`.
    pub fn new(threshold: f32) -> Result<Self> {
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(QueryError::InvalidThreshold(threshold));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// For each sample, the 1-based step at which it stops, or the sequence
    /// length if it never becomes confident enough.
    ///
    /// `logits_sequence[t]` holds the `(batch, K)` logits after `t + 1` steps.
    pub fn queries_needed(&self, logits_sequence: &[Tensor]) -> Result<Vec<usize>> {
        let first = logits_sequence.first().ok_or(QueryError::EmptyTrajectory)?;
        first.expect_rank(2)?;
        for logits in &logits_sequence[1..] {
            if logits.dims() != first.dims() {
                return Err(CoreError::ShapeMismatch {
                    expected: first.dims().to_vec(),
                    got: logits.dims().to_vec(),
                }
                .into());
            }
        }

        let steps = logits_sequence.len();
        let probs: Vec<Vec<f32>> = logits_sequence.par_iter().map(max_probabilities).collect();
        let threshold = self.threshold;
        Ok((0..first.batch_size())
            .into_par_iter()
            .map(|n| {
                probs
                    .iter()
                    .position(|step| step[n] > threshold)
                    .map_or(steps, |t| t + 1)
            })
            .collect())
    }
}

/// Validate `threshold` and apply [`StoppingCriterion::queries_needed`].
pub fn queries_needed(logits_sequence: &[Tensor], threshold: f32) -> Result<Vec<usize>> {
    StoppingCriterion::new(threshold)?.queries_needed(logits_sequence)
}

/// Largest softmax probability per row of `(batch, K)` logits.
pub fn max_probabilities(logits: &Tensor) -> Vec<f32> {
    logits
        .softmax_rows()
        .rows()
        .map(|row| row.iter().copied().fold(0.0, f32::max))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Logits over 10 classes whose softmax puts exactly `p` on class 0.
    fn confident(ps: &[f32]) -> Tensor {
        let mut data = Vec::with_capacity(ps.len() * 10);
        for &p in ps {
            data.push(p.ln());
            data.extend(std::iter::repeat_n(((1.0 - p) / 9.0).ln(), 9));
        }
        Tensor::from_vec(data, &[ps.len(), 10]).unwrap()
    }

    fn sequence(per_step: &[f32]) -> Vec<Tensor> {
        per_step.iter().map(|&p| confident(&[p])).collect()
    }

    #[test]
    fn test_max_probabilities() {
        let probs = max_probabilities(&confident(&[0.3, 0.95]));
        assert!((probs[0] - 0.3).abs() < 1e-5);
        assert!((probs[1] - 0.95).abs() < 1e-5);
    }

    #[test]
    fn test_stops_at_first_confident_step() {
        let seq = sequence(&[0.2, 0.4, 0.6, 0.91, 0.95]);
        assert_eq!(queries_needed(&seq, 0.85).unwrap(), vec![4]);
        assert_eq!(queries_needed(&seq, 0.99).unwrap(), vec![5]);
        assert_eq!(queries_needed(&seq, 0.1).unwrap(), vec![1]);
    }

    #[test]
    fn test_threshold_is_strict() {
        let seq = sequence(&[0.5, 0.5]);
        assert_eq!(queries_needed(&seq, 0.5).unwrap(), vec![2]);
    }

    #[test]
    fn test_per_sample_counts() {
        let seq = vec![confident(&[0.9, 0.2]), confident(&[0.95, 0.3]), confident(&[0.2, 0.99])];
        assert_eq!(queries_needed(&seq, 0.85).unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_invalid_thresholds() {
        for t in [0.0, -0.5, 1.5, f32::NAN] {
            assert!(matches!(StoppingCriterion::new(t), Err(QueryError::InvalidThreshold(_))));
        }
        assert!(StoppingCriterion::new(1.0).is_ok());
    }

    #[test]
    fn test_empty_and_ragged_sequences() {
        assert_eq!(queries_needed(&[], 0.85), Err(QueryError::EmptyTrajectory));
        let ragged = vec![confident(&[0.5]), confident(&[0.5, 0.5])];
        assert!(queries_needed(&ragged, 0.85).is_err());
    }

    proptest! {
        #[test]
        fn prop_threshold_monotone_and_bounded(
            ps in proptest::collection::vec(0.11f32..0.999, 1..12),
            a in 0.01f32..1.0,
            b in 0.01f32..1.0,
        ) {
            let seq = sequence(&ps);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let n_lo = queries_needed(&seq, lo).unwrap()[0];
            let n_hi = queries_needed(&seq, hi).unwrap()[0];
            prop_assert!(n_lo <= n_hi);
            prop_assert!(n_lo >= 1 && n_hi <= ps.len());
        }
    }
}
