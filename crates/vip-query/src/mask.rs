//! Binary query mask with set-only semantics.

use vip_core::{CoreError, Tensor};

use crate::Result;

/// `(batch, P)` record of which patches have been revealed.
///
/// Bits can be set but never cleared, so a rollout's revealed set only grows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryMask {
    bits: Vec<bool>,
    batch: usize,
    num_patches: usize,
}

impl QueryMask {
    /// Empty mask: nothing revealed.
    pub fn zeros(batch: usize, num_patches: usize) -> Self {
        Self {
            bits: vec![false; batch * num_patches],
            batch,
            num_patches,
        }
    }

    /// Everything revealed.
    pub fn ones(batch: usize, num_patches: usize) -> Self {
        Self {
            bits: vec![true; batch * num_patches],
            batch,
            num_patches,
        }
    }

    /// Build from a 0/1 tensor of shape `(batch, P)`; any non-zero entry counts as set.
    pub fn from_tensor(t: &Tensor) -> Result<Self> {
        t.expect_rank(2)?;
        let (batch, num_patches) = (t.dims()[0], t.dims()[1]);
        Ok(Self {
            bits: t.data().iter().map(|&v| v != 0.0).collect(),
            batch,
            num_patches,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch
    }

    pub fn num_patches(&self) -> usize {
        self.num_patches
    }

    pub fn is_set(&self, sample: usize, patch: usize) -> bool {
        self.bits[sample * self.num_patches + patch]
    }

    /// Reveal `patch` for `sample`. Setting an already-set bit is a no-op.
    pub fn set(&mut self, sample: usize, patch: usize) -> Result<()> {
        if sample >= self.batch {
            return Err(CoreError::IndexOutOfBounds {
                index: sample,
                axis: 0,
                size: self.batch,
            }
            .into());
        }
        if patch >= self.num_patches {
            return Err(CoreError::IndexOutOfBounds {
                index: patch,
                axis: 1,
                size: self.num_patches,
            }
            .into());
        }
        self.bits[sample * self.num_patches + patch] = true;
        Ok(())
    }

    pub fn row(&self, sample: usize) -> &[bool] {
        &self.bits[sample * self.num_patches..(sample + 1) * self.num_patches]
    }

    pub(crate) fn rows(&self) -> std::slice::Chunks<'_, bool> {
        self.bits.chunks(self.num_patches.max(1))
    }

    pub(crate) fn rows_mut(&mut self) -> std::slice::ChunksMut<'_, bool> {
        self.bits.chunks_mut(self.num_patches.max(1))
    }

    /// Number of revealed patches for `sample`.
    pub fn count(&self, sample: usize) -> usize {
        self.row(sample).iter().filter(|&&b| b).count()
    }

    /// Revealed patch indices for `sample`, ascending.
    pub fn revealed(&self, sample: usize) -> Vec<usize> {
        self.row(sample)
            .iter()
            .enumerate()
            .filter_map(|(p, &b)| b.then_some(p))
            .collect()
    }

    /// True when every bit set in `earlier` is also set here.
    pub fn contains(&self, earlier: &QueryMask) -> bool {
        self.batch == earlier.batch
            && self.num_patches == earlier.num_patches
            && self.bits.iter().zip(&earlier.bits).all(|(&now, &then)| now || !then)
    }

    /// 0/1 float view, shape `(batch, P)`, for models that consume the mask.
    pub fn to_tensor(&self) -> Tensor {
        let mut t = Tensor::zeros(&[self.batch, self.num_patches]);
        for (dst, &b) in t.data_mut().iter_mut().zip(&self.bits) {
            if b {
                *dst = 1.0;
            }
        }
        t
    }
}
