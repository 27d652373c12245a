//! Greedy inference rollouts.

use tracing::debug;
use vip_core::{argmax, CoreError, Tensor};

use crate::mask::QueryMask;
use crate::model::{Classifier, Querier};
use crate::selector::{QuerySelector, QueryVector};
use crate::{QueryError, Result};

/// One acquisition step.
#[derive(Clone, Debug)]
pub struct RolloutStep {
    /// Classifier logits `(batch, K)` on the partial image this step started from.
    pub logits: Tensor,
    /// Patch revealed at this step.
    pub query: QueryVector,
}

/// A full greedy rollout over a batch.
#[derive(Clone, Debug)]
pub struct Trajectory {
    pub steps: Vec<RolloutStep>,
    pub mask: QueryMask,
    pub partial: Tensor,
}

impl Trajectory {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Logits of every step, in order.
    pub fn logits(&self) -> Vec<Tensor> {
        self.steps.iter().map(|s| s.logits.clone()).collect()
    }

    /// Logits at 1-based `step`.
    pub fn logits_at(&self, step: usize) -> Option<&Tensor> {
        step.checked_sub(1)
            .and_then(|t| self.steps.get(t))
            .map(|s| &s.logits)
    }

    /// Predicted class of each sample at its own 1-based stopping step.
    pub fn predictions_at(&self, counts: &[usize]) -> Result<Vec<usize>> {
        let batch = self.mask.batch_size();
        if counts.len() != batch {
            return Err(CoreError::ShapeMismatch {
                expected: vec![batch],
                got: vec![counts.len()],
            }
            .into());
        }
        counts
            .iter()
            .enumerate()
            .map(|(n, &t)| {
                let logits = self.logits_at(t).ok_or(QueryError::InvalidStepCount {
                    steps: t,
                    num_patches: self.steps.len(),
                })?;
                Ok(argmax(logits.row(n)?))
            })
            .collect()
    }

    /// Predicted class of each sample at the last step.
    pub fn final_predictions(&self) -> Vec<usize> {
        self.steps
            .last()
            .map(|s| s.logits.argmax_rows())
            .unwrap_or_default()
    }
}

/// Greedily query `max_steps` patches per sample, recording the classifier's
/// logits before each reveal.
///
/// Step `t` therefore predicts from `t - 1` revealed patches, matching how
/// accuracy-vs-queries is reported.
pub fn greedy_rollout<C, Q>(
    images: &Tensor,
    classifier: &C,
    querier: &Q,
    selector: &QuerySelector,
    max_steps: usize,
) -> Result<Trajectory>
where
    C: Classifier + ?Sized,
    Q: Querier + ?Sized,
{
    let revealer = selector.revealer();
    let grid = revealer.grid();
    let num_patches = grid.num_patches();
    if max_steps == 0 || max_steps > num_patches {
        return Err(QueryError::InvalidStepCount {
            steps: max_steps,
            num_patches,
        });
    }

    let batch = images.batch_size();
    images.expect_dims(&grid.image_dims(batch))?;
    let mut mask = QueryMask::zeros(batch, num_patches);
    let mut partial = revealer.blank(batch);
    let mut steps = Vec::with_capacity(max_steps);

    for _ in 0..max_steps {
        let scores = querier.score(&partial, &mask)?;
        let logits = classifier.predict(&partial)?;
        let query = selector.select_infer(&scores, &mask)?;
        let (next_mask, next_partial) = selector.advance(&mask, &partial, images, &query.picks())?;
        mask = next_mask;
        partial = next_partial;
        steps.push(RolloutStep { logits, query });
    }

    debug!(batch, max_steps, "greedy rollout");
    Ok(Trajectory { steps, mask, partial })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{PatchGrid, PatchLayout};
    use crate::reveal::PatchRevealer;

    /// Scores patches by the sum of their hidden pixels: peeks at the answer,
    /// which makes the greedy order easy to predict.
    struct Oracle {
        grid: PatchGrid,
        images: Tensor,
    }

    impl Querier for Oracle {
        fn score(&self, _partial: &Tensor, mask: &QueryMask) -> crate::Result<Tensor> {
            let p = self.grid.num_patches();
            let mut out = vec![0.0; mask.batch_size() * p];
            for n in 0..mask.batch_size() {
                let img = self.images.row(n)?;
                for i in 0..p {
                    let (r, c) = self.grid.patch_bounds(i);
                    out[n * p + i] = img[r * self.grid.width + c];
                }
            }
            Ok(Tensor::from_vec(out, &[mask.batch_size(), p])?)
        }
    }

    /// Logit for class 1 is the number of revealed non-placeholder pixels.
    struct CountClassifier;

    impl Classifier for CountClassifier {
        fn predict(&self, partial: &Tensor) -> crate::Result<Tensor> {
            let mut out = Vec::new();
            for row in partial.rows() {
                let seen = row.iter().filter(|&&v| v != 0.0).count() as f32;
                out.extend([0.0, seen]);
            }
            Ok(Tensor::from_vec(out, &[partial.batch_size(), 2])?)
        }

        fn num_classes(&self) -> usize {
            2
        }
    }

    fn setup() -> (PatchGrid, QuerySelector, Tensor) {
        let grid = PatchGrid::new(1, 4, 4, 2, PatchLayout::Tiled).unwrap();
        let selector = QuerySelector::gumbel(PatchRevealer::new(grid));
        #[rustfmt::skip]
        let images = Tensor::from_vec(vec![
            1.0, 1.0, 4.0, 4.0,
            1.0, 1.0, 4.0, 4.0,
            3.0, 3.0, 2.0, 2.0,
            3.0, 3.0, 2.0, 2.0,
        ], &[1, 1, 4, 4]).unwrap();
        (grid, selector, images)
    }

    #[test]
    fn test_greedy_order_and_final_state() {
        let (grid, selector, images) = setup();
        let oracle = Oracle { grid, images: images.clone() };
        let traj = greedy_rollout(&images, &CountClassifier, &oracle, &selector, 4).unwrap();
        let order: Vec<usize> = traj.steps.iter().map(|s| s.query.indices()[0]).collect();
        assert_eq!(order, vec![1, 2, 3, 0]);
        assert_eq!(traj.mask, QueryMask::ones(1, 4));
        assert_eq!(traj.partial, images);
    }

    #[test]
    fn test_logits_precede_reveal() {
        let (grid, selector, images) = setup();
        let oracle = Oracle { grid, images: images.clone() };
        let traj = greedy_rollout(&images, &CountClassifier, &oracle, &selector, 3).unwrap();
        // step t sees t-1 revealed patches of 4 pixels each
        for t in 1..=3 {
            let seen = traj.logits_at(t).unwrap().data()[1];
            assert_eq!(seen, (4 * (t - 1)) as f32);
        }
        assert!(traj.logits_at(0).is_none());
        assert!(traj.logits_at(4).is_none());
        assert_eq!(traj.mask.count(0), 3);
    }

    #[test]
    fn test_predictions_at_stopping_steps() {
        let (grid, selector, images) = setup();
        let oracle = Oracle { grid, images: images.clone() };
        let traj = greedy_rollout(&images, &CountClassifier, &oracle, &selector, 2).unwrap();
        // step 1 has nothing revealed: tie → class 0; step 2 favours class 1
        assert_eq!(traj.predictions_at(&[1]).unwrap(), vec![0]);
        assert_eq!(traj.predictions_at(&[2]).unwrap(), vec![1]);
        assert_eq!(traj.final_predictions(), vec![1]);
        assert!(traj.predictions_at(&[3]).is_err());
    }

    #[test]
    fn test_step_count_validated() {
        let (grid, selector, images) = setup();
        let oracle = Oracle { grid, images: images.clone() };
        for steps in [0, 5] {
            assert!(matches!(
                greedy_rollout(&images, &CountClassifier, &oracle, &selector, steps),
                Err(QueryError::InvalidStepCount { .. })
            ));
        }
    }
}
