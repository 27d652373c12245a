//! Collaborator contracts: what the acquisition core needs from the networks.

use vip_core::Tensor;

use crate::mask::QueryMask;
use crate::Result;

/// Predicts a label distribution from a partially revealed image batch.
pub trait Classifier: Send + Sync {
    /// `(batch, C, H, W)` → logits `(batch, num_classes)`.
    fn predict(&self, partial_image: &Tensor) -> Result<Tensor>;

    fn num_classes(&self) -> usize;
}

/// Scores every candidate patch for the next query.
///
/// Scores are raw (unnormalised); excluding already-queried patches and any
/// temperature scaling happen in [`crate::selector`].
pub trait Querier: Send + Sync {
    /// `(batch, C, H, W)` + mask → scores `(batch, P)`.
    fn score(&self, partial_image: &Tensor, mask: &QueryMask) -> Result<Tensor>;
}

impl<T: Classifier + ?Sized> Classifier for &T {
    fn predict(&self, partial_image: &Tensor) -> Result<Tensor> {
        (**self).predict(partial_image)
    }

    fn num_classes(&self) -> usize {
        (**self).num_classes()
    }
}

impl<T: Querier + ?Sized> Querier for &T {
    fn score(&self, partial_image: &Tensor, mask: &QueryMask) -> Result<Tensor> {
        (**self).score(partial_image, mask)
    }
}
