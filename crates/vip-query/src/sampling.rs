//! Query histories for training: random subsets and on-policy querier rollouts.

use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use vip_core::{CoreError, Tensor};

use crate::mask::QueryMask;
use crate::model::Querier;
use crate::selector::QuerySelector;
use crate::{QueryError, Result};

/// How the training loop builds each batch's starting mask.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SamplingStrategy {
    /// Exactly `max_queries` random patches per sample.
    #[default]
    Random,
    /// A random number of random patches, up to `max_queries`.
    RandomVariable,
    /// The querier's own greedy picks, with a random budget per sample.
    Adaptive,
}

impl std::fmt::Display for SamplingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SamplingStrategy::Random => "random",
            SamplingStrategy::RandomVariable => "random-variable",
            SamplingStrategy::Adaptive => "adaptive",
        };
        f.write_str(name)
    }
}

/// Uniformly random query masks, deterministic given the seed and call order.
#[derive(Clone, Debug)]
pub struct RandomSampler {
    rng: ChaCha8Rng,
}

impl RandomSampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Each row gets exactly `min(max_queries, num_patches)` distinct patches.
    pub fn sample(&mut self, max_queries: usize, num_patches: usize, batch: usize) -> QueryMask {
        let k = clamp_budget(max_queries, num_patches);
        let mut mask = QueryMask::zeros(batch, num_patches);
        if k == num_patches {
            return QueryMask::ones(batch, num_patches);
        }
        for row in mask.rows_mut().take(batch) {
            for p in index::sample(&mut self.rng, num_patches, k).iter() {
                row[p] = true;
            }
        }
        mask
    }

    /// Each row first draws its own budget uniformly from `[0, min(max_queries, P)]`.
    pub fn sample_variable(
        &mut self,
        max_queries: usize,
        num_patches: usize,
        batch: usize,
    ) -> QueryMask {
        let cap = clamp_budget(max_queries, num_patches);
        let mut mask = QueryMask::zeros(batch, num_patches);
        for row in mask.rows_mut().take(batch) {
            let k = self.rng.gen_range(0..=cap);
            for p in index::sample(&mut self.rng, num_patches, k).iter() {
                row[p] = true;
            }
        }
        mask
    }

    pub fn rng_mut(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }
}

fn clamp_budget(max_queries: usize, num_patches: usize) -> usize {
    if max_queries > num_patches {
        warn!(max_queries, num_patches, "query budget exceeds patch count, clamping");
    }
    max_queries.min(num_patches)
}

/// Per-sample rollout lengths drawn uniformly from `[0, num_patches)`.
pub fn draw_budgets(rng: &mut impl Rng, batch: usize, num_patches: usize) -> Vec<usize> {
    if num_patches == 0 {
        return vec![0; batch];
    }
    (0..batch).map(|_| rng.gen_range(0..num_patches)).collect()
}

/// Builds masks from the querier's own greedy choices.
pub struct AdaptiveSampler<'a> {
    selector: &'a QuerySelector,
}

impl<'a> AdaptiveSampler<'a> {
    pub fn new(selector: &'a QuerySelector) -> Self {
        Self { selector }
    }

    /// Roll the querier out from a cold mask for `max(budgets)` steps, revealing
    /// a pick for sample `n` only while fewer than `budgets[n]` are revealed.
    ///
    /// Row `n` of the returned mask holds exactly the first `budgets[n]` greedy
    /// picks; the returned image is the matching partial image.
    pub fn sample<Q: Querier + ?Sized>(
        &self,
        images: &Tensor,
        budgets: &[usize],
        querier: &Q,
    ) -> Result<(QueryMask, Tensor)> {
        let revealer = self.selector.revealer();
        let grid = revealer.grid();
        let batch = images.batch_size();
        let num_patches = grid.num_patches();

        if budgets.len() != batch {
            return Err(CoreError::ShapeMismatch {
                expected: vec![batch],
                got: vec![budgets.len()],
            }
            .into());
        }
        if let Some((sample, &budget)) = budgets.iter().enumerate().find(|&(_, &b)| b > num_patches) {
            return Err(QueryError::BudgetOutOfRange {
                sample,
                budget,
                num_patches,
            });
        }

        images.expect_dims(&grid.image_dims(batch))?;
        let mut mask = QueryMask::zeros(batch, num_patches);
        let mut partial = revealer.blank(batch);

        let steps = budgets.iter().copied().max().unwrap_or(0);
        for step in 0..steps {
            let scores = querier.score(&partial, &mask)?;
            let picks = greedy_picks(self.selector, &scores, &mask, budgets, step)?;
            let (next_mask, next_partial) = self.selector.advance(&mask, &partial, images, &picks)?;
            mask = next_mask;
            partial = next_partial;
        }

        debug!(
            batch,
            steps,
            mean_budget = budgets.iter().sum::<usize>() as f64 / batch.max(1) as f64,
            "adaptive rollout"
        );
        Ok((mask, partial))
    }
}

/// Greedy pick for rows still under budget at `step`; finished rows get `None`.
fn greedy_picks(
    selector: &QuerySelector,
    scores: &Tensor,
    mask: &QueryMask,
    budgets: &[usize],
    step: usize,
) -> Result<Vec<Option<usize>>> {
    // A finished row may have no candidates left, so pick row by row.
    let mut picks = vec![None; budgets.len()];
    let active: Vec<usize> = (0..budgets.len()).filter(|&n| step < budgets[n]).collect();
    if active.is_empty() {
        return Ok(picks);
    }
    let p = mask.num_patches();
    let mut sub_scores = Vec::with_capacity(active.len() * p);
    let mut sub_mask = QueryMask::zeros(active.len(), p);
    for (row, &n) in sub_mask.rows_mut().zip(&active) {
        sub_scores.extend_from_slice(&scores.data()[n * p..(n + 1) * p]);
        row.copy_from_slice(mask.row(n));
    }
    let sub_scores = Tensor::from_vec(sub_scores, &[active.len(), p])?;
    let chosen = selector.select_infer(&sub_scores, &sub_mask)?;
    for (&n, &i) in active.iter().zip(chosen.indices()) {
        picks[n] = Some(i);
    }
    Ok(picks)
}
