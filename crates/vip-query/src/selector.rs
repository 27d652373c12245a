//! Query selection: relaxed (trainable) and greedy (inference) patch picks,
//! and their fusion into the running mask and partial image.
//!
//! The relaxed path is isolated behind [`Relaxation`] so mask bookkeeping does
//! not depend on which continuous relaxation backs the gradient:
//!
//! ```text
//!   scores ──▶ Relaxation::relax ──▶ weights ──▶ soft_update ──▶ classifier
//!     ▲                                                              │
//!     └── Relaxation::backward ◀── soft_update_backward ◀── grad ◀───┘
//! ```

use rand::{Rng, RngCore};
use rayon::prelude::*;
use vip_core::{argmax, softmax_in_place, CoreError, Tensor};

use crate::mask::QueryMask;
use crate::reveal::PatchRevealer;
use crate::{QueryError, Result};

// ═══════════════════════════════════════════════════════════════════════════
// Query vectors
// ═══════════════════════════════════════════════════════════════════════════

/// Greedy one-hot selection: exactly one patch per sample.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryVector {
    indices: Vec<usize>,
    num_patches: usize,
}

impl QueryVector {
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn batch_size(&self) -> usize {
        self.indices.len()
    }

    /// Dense one-hot `(batch, P)`.
    pub fn to_tensor(&self) -> Tensor {
        let mut t = Tensor::zeros(&[self.indices.len(), self.num_patches]);
        for (row, &p) in t.rows_mut().zip(&self.indices) {
            row[p] = 1.0;
        }
        t
    }

    pub(crate) fn picks(&self) -> Vec<Option<usize>> {
        self.indices.iter().copied().map(Some).collect()
    }
}

/// Output of a relaxation.
#[derive(Clone, Debug)]
pub struct RelaxedQuery {
    /// Forward-pass weights `(batch, P)`: the relaxed sample, or its one-hot
    /// argmax under straight-through.
    pub weights: Tensor,
    /// The continuous relaxed sample; gradients are taken through this.
    pub soft: Tensor,
    /// Temperature the sample was drawn at.
    pub tau: f32,
}

impl RelaxedQuery {
    /// Max-weight patch per sample, `None` for rows with nothing left to pick.
    pub fn hard_indices(&self) -> Vec<Option<usize>> {
        self.weights.rows().map(pick_from_weights).collect()
    }
}

fn pick_from_weights(row: &[f32]) -> Option<usize> {
    let best = argmax(row);
    (row.get(best).copied().unwrap_or(0.0) > 0.0).then_some(best)
}

// ═══════════════════════════════════════════════════════════════════════════
// Relaxations
// ═══════════════════════════════════════════════════════════════════════════

/// A temperature-controlled continuous relaxation of "pick one patch".
pub trait Relaxation: Send + Sync {
    /// Weights over not-yet-queried patches; queried patches get exactly 0.
    fn relax(
        &self,
        scores: &Tensor,
        mask: &QueryMask,
        tau: f32,
        rng: &mut dyn RngCore,
    ) -> Result<RelaxedQuery>;

    /// Vector-Jacobian product: gradient w.r.t. `weights` → gradient w.r.t. scores.
    fn backward(&self, relaxed: &RelaxedQuery, grad_weights: &Tensor) -> Result<Tensor> {
        softmax_backward(&relaxed.soft, grad_weights, relaxed.tau)
    }

    fn name(&self) -> &'static str;
}

/// Gumbel-softmax: `softmax((s + g) / tau)` with `g ~ Gumbel(0, 1)`.
///
/// With `hard`, the forward weights are the one-hot argmax of the sample and
/// gradients flow through the soft sample (straight-through).
#[derive(Clone, Copy, Debug, Default)]
pub struct GumbelSoftmax {
    pub hard: bool,
}

impl Relaxation for GumbelSoftmax {
    fn relax(
        &self,
        scores: &Tensor,
        mask: &QueryMask,
        tau: f32,
        rng: &mut dyn RngCore,
    ) -> Result<RelaxedQuery> {
        check_tau(tau)?;
        check_scores(scores, mask)?;
        let noise: Vec<f32> = (0..scores.numel()).map(|_| sample_gumbel(rng)).collect();
        relax_rows(scores, mask, tau, Some(&noise), self.hard)
    }

    fn name(&self) -> &'static str {
        if self.hard {
            "gumbel-softmax-st"
        } else {
            "gumbel-softmax"
        }
    }
}

/// Deterministic tempered softmax `softmax(s / tau)`; `hard` adds straight-through.
#[derive(Clone, Copy, Debug, Default)]
pub struct TemperedSoftmax {
    pub hard: bool,
}

impl Relaxation for TemperedSoftmax {
    fn relax(
        &self,
        scores: &Tensor,
        mask: &QueryMask,
        tau: f32,
        _rng: &mut dyn RngCore,
    ) -> Result<RelaxedQuery> {
        check_tau(tau)?;
        check_scores(scores, mask)?;
        relax_rows(scores, mask, tau, None, self.hard)
    }

    fn name(&self) -> &'static str {
        if self.hard {
            "softmax-st"
        } else {
            "softmax"
        }
    }
}

/// Standard Gumbel(0, 1) draw via inverse CDF.
fn sample_gumbel(rng: &mut dyn RngCore) -> f32 {
    let u: f32 = rng.gen_range(f32::MIN_POSITIVE..1.0);
    -(-u.ln()).ln()
}

fn relax_rows(
    scores: &Tensor,
    mask: &QueryMask,
    tau: f32,
    noise: Option<&[f32]>,
    hard: bool,
) -> Result<RelaxedQuery> {
    let p = mask.num_patches();
    let mut soft = scores.clone();
    soft.par_rows_mut().enumerate().for_each(|(n, row)| {
        let queried = mask.row(n);
        for (i, v) in row.iter_mut().enumerate() {
            *v = if queried[i] {
                f32::NEG_INFINITY
            } else {
                *v + noise.map_or(0.0, |z| z[n * p + i])
            };
        }
        // Shift by the row max before dividing so a tiny tau cannot overflow to +inf.
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if max > f32::NEG_INFINITY {
            row.iter_mut().for_each(|v| *v = (*v - max) / tau);
        }
        softmax_in_place(row);
    });

    let weights = if hard {
        let mut one_hot = Tensor::zeros(soft.dims());
        for (dst, src) in one_hot.rows_mut().zip(soft.rows()) {
            if let Some(best) = pick_from_weights(src) {
                dst[best] = 1.0;
            }
        }
        one_hot
    } else {
        soft.clone()
    };

    Ok(RelaxedQuery { weights, soft, tau })
}

/// Backward of `y = softmax(z / tau)` per row: `dz_i = y_i (g_i - Σ_j y_j g_j) / tau`.
pub fn softmax_backward(soft: &Tensor, grad: &Tensor, tau: f32) -> Result<Tensor> {
    grad.expect_dims(soft.dims())?;
    let mut out = Tensor::zeros(soft.dims());
    out.par_rows_mut()
        .zip(soft.data().par_chunks(soft.row_len().max(1)))
        .zip(grad.data().par_chunks(grad.row_len().max(1)))
        .for_each(|((dst, y), g)| {
            let dot: f32 = y.iter().zip(g).map(|(a, b)| a * b).sum();
            for ((d, &yi), &gi) in dst.iter_mut().zip(y).zip(g) {
                *d = yi * (gi - dot) / tau;
            }
        });
    Ok(out)
}

fn check_tau(tau: f32) -> Result<()> {
    if !tau.is_finite() || tau <= 0.0 {
        return Err(QueryError::InvalidTemperature(tau));
    }
    Ok(())
}

fn check_scores(scores: &Tensor, mask: &QueryMask) -> Result<()> {
    scores
        .expect_dims(&[mask.batch_size(), mask.num_patches()])
        .map_err(QueryError::from)
}

// ═══════════════════════════════════════════════════════════════════════════
// Selector
// ═══════════════════════════════════════════════════════════════════════════

/// Result of fusing a query into the running state.
#[derive(Clone, Debug)]
pub struct AppliedQuery {
    /// Mask with each sample's max-weight patch set.
    pub mask: QueryMask,
    /// Partial image with those patches hard-copied from the ground truth.
    pub partial: Tensor,
    /// Weight-blended partial image; equals `partial` for a one-hot query.
    pub soft: Tensor,
}

/// Turns querier scores into mask/image updates.
pub struct QuerySelector {
    revealer: PatchRevealer,
    relaxation: Box<dyn Relaxation>,
}

impl QuerySelector {
    pub fn new(revealer: PatchRevealer, relaxation: impl Relaxation + 'static) -> Self {
        Self {
            revealer,
            relaxation: Box::new(relaxation),
        }
    }

    /// Gumbel-softmax selector with soft forward weights.
    pub fn gumbel(revealer: PatchRevealer) -> Self {
        Self::new(revealer, GumbelSoftmax::default())
    }

    pub fn revealer(&self) -> &PatchRevealer {
        &self.revealer
    }

    pub fn relaxation(&self) -> &dyn Relaxation {
        self.relaxation.as_ref()
    }

    /// Training-time relaxed selection at temperature `tau`.
    pub fn select_train(
        &self,
        scores: &Tensor,
        mask: &QueryMask,
        tau: f32,
        rng: &mut dyn RngCore,
    ) -> Result<RelaxedQuery> {
        self.relaxation.relax(scores, mask, tau, rng)
    }

    /// Gradient of the loss w.r.t. raw scores, given its gradient w.r.t. the weights.
    pub fn relaxation_backward(&self, relaxed: &RelaxedQuery, grad_weights: &Tensor) -> Result<Tensor> {
        self.relaxation.backward(relaxed, grad_weights)
    }

    /// Inference-time greedy selection: argmax over unqueried patches, ties to
    /// the lowest index. No randomness.
    pub fn select_infer(&self, scores: &Tensor, mask: &QueryMask) -> Result<QueryVector> {
        check_scores(scores, mask)?;
        let indices = scores
            .rows()
            .zip(mask.rows())
            .enumerate()
            .map(|(n, (row, queried))| {
                let mut best: Option<(usize, f32)> = None;
                for (i, (&v, &q)) in row.iter().zip(queried).enumerate() {
                    if q {
                        continue;
                    }
                    match best {
                        Some((_, b)) if !(v > b) => {}
                        _ => best = Some((i, v)),
                    }
                }
                best.map(|(i, _)| i).ok_or(QueryError::NoCandidates { sample: n })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(QueryVector {
            indices,
            num_patches: mask.num_patches(),
        })
    }

    /// Fuse `weights` `(batch, P)` into the state: hard mask/image update at
    /// each row's max-weight patch, plus the differentiable soft image.
    pub fn apply(
        &self,
        mask: &QueryMask,
        partial: &Tensor,
        full: &Tensor,
        weights: &Tensor,
    ) -> Result<AppliedQuery> {
        check_scores(weights, mask)?;
        let picks: Vec<Option<usize>> = weights.rows().map(pick_from_weights).collect();
        let soft = self.soft_update(partial, full, mask, weights)?;
        let (mask, partial) = self.advance(mask, partial, full, &picks)?;
        Ok(AppliedQuery { mask, partial, soft })
    }

    /// Reveal `picks[n]` for every sample with a pick; `None` rows stay as they are.
    pub fn advance(
        &self,
        mask: &QueryMask,
        partial: &Tensor,
        full: &Tensor,
        picks: &[Option<usize>],
    ) -> Result<(QueryMask, Tensor)> {
        self.revealer.check_batch(mask, full)?;
        partial.expect_dims(full.dims())?;
        if picks.len() != mask.batch_size() {
            return Err(CoreError::ShapeMismatch {
                expected: vec![mask.batch_size()],
                got: vec![picks.len()],
            }
            .into());
        }

        let mut next_mask = mask.clone();
        let mut next_partial = partial.clone();
        for (n, (dst, src)) in next_partial.rows_mut().zip(full.rows()).enumerate() {
            if let Some(p) = picks[n] {
                next_mask.set(n, p)?;
                self.revealer.copy_patch(dst, src, p);
            }
        }
        Ok((next_mask, next_partial))
    }

    /// `partial + Σ_p w_p · region_p ⊙ uncovered ⊙ (full − placeholder)`.
    ///
    /// `uncovered` is the pixel coverage of `mask`, i.e. before this query, so
    /// already revealed pixels are never added twice.
    pub fn soft_update(
        &self,
        partial: &Tensor,
        full: &Tensor,
        mask: &QueryMask,
        weights: &Tensor,
    ) -> Result<Tensor> {
        self.revealer.check_batch(mask, full)?;
        partial.expect_dims(full.dims())?;
        check_scores(weights, mask)?;

        let grid = *self.revealer.grid();
        let plane = grid.height * grid.width;
        let placeholder = self.revealer.placeholder();

        let mut out = partial.clone();
        out.par_rows_mut().enumerate().for_each(|(n, dst)| {
            let covered = self.revealer.coverage_of(mask.row(n));
            let src = &full.data()[n * grid.image_len()..(n + 1) * grid.image_len()];
            let w_row = &weights.data()[n * grid.num_patches()..(n + 1) * grid.num_patches()];
            for (p, &w) in w_row.iter().enumerate() {
                if w == 0.0 {
                    continue;
                }
                for c in 0..grid.channels {
                    let base = c * plane;
                    grid.for_each_pixel(p, |i| {
                        if !covered[i] {
                            dst[base + i] += w * (src[base + i] - placeholder);
                        }
                    });
                }
            }
        });
        Ok(out)
    }

    /// Gradient of [`QuerySelector::soft_update`] w.r.t. its weights.
    pub fn soft_update_backward(
        &self,
        grad_soft: &Tensor,
        full: &Tensor,
        mask: &QueryMask,
    ) -> Result<Tensor> {
        self.revealer.check_batch(mask, full)?;
        grad_soft.expect_dims(full.dims())?;

        let grid = *self.revealer.grid();
        let plane = grid.height * grid.width;
        let placeholder = self.revealer.placeholder();

        let mut grad_w = Tensor::zeros(&[mask.batch_size(), mask.num_patches()]);
        grad_w.par_rows_mut().enumerate().for_each(|(n, dst)| {
            let covered = self.revealer.coverage_of(mask.row(n));
            let offset = n * grid.image_len();
            let src = &full.data()[offset..offset + grid.image_len()];
            let g = &grad_soft.data()[offset..offset + grid.image_len()];
            for (p, d) in dst.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                for c in 0..grid.channels {
                    let base = c * plane;
                    grid.for_each_pixel(p, |i| {
                        if !covered[i] {
                            acc += g[base + i] * (src[base + i] - placeholder);
                        }
                    });
                }
                *d = acc;
            }
        });
        Ok(grad_w)
    }
}
