//! The classifier and querier networks.
//!
//! Both are MLPs over the flattened partial image. The querier emits one raw
//! score per patch; exclusion of queried patches and temperature live in the
//! selector, not here.

use rand::Rng;
use vip_core::{Gradients, Module, Tensor};
use vip_query::{Classifier, PatchGrid, Querier, QueryMask};

use crate::nn::{Mlp, MlpCache};

fn layer_dims(input: usize, hidden: &[usize], output: usize) -> Vec<usize> {
    let mut dims = Vec::with_capacity(hidden.len() + 2);
    dims.push(input);
    dims.extend_from_slice(hidden);
    dims.push(output);
    dims
}

/// Predicts class logits from a partial image.
#[derive(Clone, Debug)]
pub struct MlpClassifier {
    net: Mlp,
    grid: PatchGrid,
    num_classes: usize,
}

impl MlpClassifier {
    pub fn new(grid: PatchGrid, hidden: &[usize], num_classes: usize, rng: &mut impl Rng) -> Self {
        Self {
            net: Mlp::new(&layer_dims(grid.image_len(), hidden, num_classes), rng),
            grid,
            num_classes,
        }
    }

    /// Forward pass that keeps what [`MlpClassifier::backward`] needs.
    pub fn forward_train(&self, images: &Tensor) -> vip_core::Result<(Tensor, MlpCache)> {
        self.net.forward_cached(&images.clone().flatten_rows())
    }

    /// Parameter gradients into `grads`; returns the gradient w.r.t. the image,
    /// shaped `(batch, C, H, W)`.
    pub fn backward(
        &self,
        cache: &MlpCache,
        grad_logits: &Tensor,
        grads: &mut Gradients,
    ) -> vip_core::Result<Tensor> {
        let dx = self.net.backward(cache, grad_logits, grads)?;
        let dims = self.grid.image_dims(grad_logits.batch_size());
        dx.reshape(&dims.map(|d| d as isize))
    }
}

impl Classifier for MlpClassifier {
    fn predict(&self, partial_image: &Tensor) -> vip_query::Result<Tensor> {
        Ok(self.net.forward(&partial_image.clone().flatten_rows())?)
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}

impl Module for MlpClassifier {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        self.net.named_parameters()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        self.net.named_parameters_mut()
    }
}

/// Scores every patch for the next query.
#[derive(Clone, Debug)]
pub struct MlpQuerier {
    net: Mlp,
    num_patches: usize,
}

impl MlpQuerier {
    pub fn new(grid: PatchGrid, hidden: &[usize], rng: &mut impl Rng) -> Self {
        let num_patches = grid.num_patches();
        Self {
            net: Mlp::new(&layer_dims(grid.image_len(), hidden, num_patches), rng),
            num_patches,
        }
    }

    pub fn forward_train(&self, partial_image: &Tensor) -> vip_core::Result<(Tensor, MlpCache)> {
        self.net.forward_cached(&partial_image.clone().flatten_rows())
    }

    /// Parameter gradients into `grads`. The input gradient is not needed.
    pub fn backward(
        &self,
        cache: &MlpCache,
        grad_scores: &Tensor,
        grads: &mut Gradients,
    ) -> vip_core::Result<()> {
        self.net.backward(cache, grad_scores, grads).map(drop)
    }
}

impl Querier for MlpQuerier {
    fn score(&self, partial_image: &Tensor, mask: &QueryMask) -> vip_query::Result<Tensor> {
        let scores = self.net.forward(&partial_image.clone().flatten_rows())?;
        scores.expect_dims(&[mask.batch_size(), self.num_patches])?;
        Ok(scores)
    }
}

impl Module for MlpQuerier {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        self.net.named_parameters()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        self.net.named_parameters_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use vip_query::PatchLayout;

    fn grid() -> PatchGrid {
        PatchGrid::new(1, 4, 4, 2, PatchLayout::Tiled).unwrap()
    }

    #[test]
    fn test_output_shapes() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let cls = MlpClassifier::new(grid(), &[8], 3, &mut rng);
        let qry = MlpQuerier::new(grid(), &[8], &mut rng);
        let images = Tensor::zeros(&[5, 1, 4, 4]);
        assert_eq!(cls.predict(&images).unwrap().dims(), &[5, 3]);
        assert_eq!(qry.score(&images, &QueryMask::zeros(5, 4)).unwrap().dims(), &[5, 4]);
        assert_eq!(cls.num_classes(), 3);
    }

    #[test]
    fn test_classifier_input_grad_is_image_shaped() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let cls = MlpClassifier::new(grid(), &[8], 3, &mut rng);
        let images = Tensor::full(&[2, 1, 4, 4], 0.5);
        let (logits, cache) = cls.forward_train(&images).unwrap();
        let mut grads = Gradients::new();
        let dx = cls.backward(&cache, &logits.map(|_| 1.0), &mut grads).unwrap();
        assert_eq!(dx.dims(), images.dims());
        assert_eq!(grads.len(), cls.named_parameters().len());
    }

    #[test]
    fn test_querier_rejects_wrong_mask_batch() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let qry = MlpQuerier::new(grid(), &[8], &mut rng);
        assert!(qry.score(&Tensor::zeros(&[2, 1, 4, 4]), &QueryMask::zeros(3, 4)).is_err());
    }
}
