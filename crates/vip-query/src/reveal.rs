//! Partial-image construction: true pixels under revealed patches, a fixed
//! placeholder everywhere else.

use rayon::prelude::*;
use vip_core::{CoreError, Tensor};

use crate::geometry::PatchGrid;
use crate::mask::QueryMask;
use crate::Result;

/// Placeholder for unrevealed pixels: midpoint of the binarised [-1, 1] input range.
pub const DEFAULT_PLACEHOLDER: f32 = 0.0;

/// Builds partially observed images from a mask and the ground-truth batch.
#[derive(Clone, Copy, Debug)]
pub struct PatchRevealer {
    grid: PatchGrid,
    placeholder: f32,
}

impl PatchRevealer {
    pub fn new(grid: PatchGrid) -> Self {
        Self::with_placeholder(grid, DEFAULT_PLACEHOLDER)
    }

    pub fn with_placeholder(grid: PatchGrid, placeholder: f32) -> Self {
        Self { grid, placeholder }
    }

    pub fn grid(&self) -> &PatchGrid {
        &self.grid
    }

    pub fn placeholder(&self) -> f32 {
        self.placeholder
    }

    /// A batch where nothing is revealed.
    pub fn blank(&self, batch: usize) -> Tensor {
        Tensor::full(&self.grid.image_dims(batch), self.placeholder)
    }

    /// Partial image for `mask` over `images` `(batch, C, H, W)`.
    ///
    /// Each pixel keeps its true value iff at least one revealed patch covers
    /// it. Inputs are not modified.
    pub fn reveal(&self, mask: &QueryMask, images: &Tensor) -> Result<Tensor> {
        self.check_batch(mask, images)?;
        let plane = self.grid.height * self.grid.width;
        let placeholder = self.placeholder;

        let mut out = images.clone();
        out.par_rows_mut().enumerate().for_each(|(n, row)| {
            let covered = self.coverage_of(mask.row(n));
            for channel in row.chunks_mut(plane) {
                for (v, &c) in channel.iter_mut().zip(&covered) {
                    if !c {
                        *v = placeholder;
                    }
                }
            }
        });
        Ok(out)
    }

    /// Per-pixel revealed map (H × W, row-major) for one sample.
    pub fn coverage(&self, mask: &QueryMask, sample: usize) -> Vec<bool> {
        self.coverage_of(mask.row(sample))
    }

    pub(crate) fn coverage_of(&self, mask_row: &[bool]) -> Vec<bool> {
        let mut covered = vec![false; self.grid.height * self.grid.width];
        for (p, _) in mask_row.iter().enumerate().filter(|&(_, &b)| b) {
            self.grid.for_each_pixel(p, |i| covered[i] = true);
        }
        covered
    }

    /// Copy patch `patch` from `full_row` into `partial_row` across all channels.
    pub(crate) fn copy_patch(&self, partial_row: &mut [f32], full_row: &[f32], patch: usize) {
        let plane = self.grid.height * self.grid.width;
        for c in 0..self.grid.channels {
            let base = c * plane;
            self.grid
                .for_each_pixel(patch, |i| partial_row[base + i] = full_row[base + i]);
        }
    }

    pub(crate) fn check_batch(&self, mask: &QueryMask, images: &Tensor) -> Result<()> {
        let batch = images.batch_size();
        images.expect_dims(&self.grid.image_dims(batch))?;
        let expected = [batch, self.grid.num_patches()];
        let got = [mask.batch_size(), mask.num_patches()];
        if got != expected {
            return Err(CoreError::ShapeMismatch {
                expected: expected.to_vec(),
                got: got.to_vec(),
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::PatchLayout;

    fn quad_grid() -> PatchGrid {
        PatchGrid::new(1, 4, 4, 2, PatchLayout::Tiled).unwrap()
    }

    fn counting_image(grid: &PatchGrid, batch: usize) -> Tensor {
        let n = batch * grid.image_len();
        Tensor::from_vec((0..n).map(|i| i as f32 + 1.0).collect(), &grid.image_dims(batch)).unwrap()
    }

    #[test]
    fn test_two_quadrants_revealed() {
        let grid = quad_grid();
        let revealer = PatchRevealer::new(grid);
        let image = counting_image(&grid, 1);
        let mut mask = QueryMask::zeros(1, 4);
        mask.set(0, 0).unwrap();
        mask.set(0, 3).unwrap();

        let partial = revealer.reveal(&mask, &image).unwrap();
        #[rustfmt::skip]
        let expected = vec![
            1.0, 2.0, 0.0, 0.0,
            5.0, 6.0, 0.0, 0.0,
            0.0, 0.0, 11.0, 12.0,
            0.0, 0.0, 15.0, 16.0,
        ];
        assert_eq!(partial.data(), expected.as_slice());
        // input untouched
        assert_eq!(image.data()[2], 3.0);
    }

    #[test]
    fn test_consistency_every_patch_multichannel() {
        let grid = PatchGrid::new(3, 6, 6, 3, PatchLayout::Tiled).unwrap();
        let revealer = PatchRevealer::with_placeholder(grid, -7.0);
        let image = counting_image(&grid, 2);
        let mut mask = QueryMask::zeros(2, grid.num_patches());
        mask.set(0, 1).unwrap();
        mask.set(1, 2).unwrap();
        let partial = revealer.reveal(&mask, &image).unwrap();

        let plane = 36;
        for n in 0..2 {
            let src = image.row(n).unwrap();
            let dst = partial.row(n).unwrap();
            for p in 0..grid.num_patches() {
                for c in 0..3 {
                    grid.for_each_pixel(p, |i| {
                        let idx = c * plane + i;
                        if mask.is_set(n, p) {
                            assert_eq!(dst[idx], src[idx]);
                        } else {
                            assert_eq!(dst[idx], -7.0);
                        }
                    });
                }
            }
        }
    }

    #[test]
    fn test_sliding_overlap_coverage() {
        let grid = PatchGrid::new(1, 4, 4, 3, PatchLayout::Sliding).unwrap();
        let revealer = PatchRevealer::new(grid);
        let mut mask = QueryMask::zeros(1, grid.num_patches());
        mask.set(0, 0).unwrap();
        mask.set(0, 3).unwrap();
        let cov = revealer.coverage(&mask, 0);
        // patch 0 covers rows/cols 0..3, patch 3 covers 1..4; union misses (0,3) and (3,0)
        assert_eq!(cov.iter().filter(|&&c| c).count(), 14);
        assert!(!cov[3]);
        assert!(!cov[12]);
    }

    #[test]
    fn test_mask_shape_checked() {
        let grid = quad_grid();
        let revealer = PatchRevealer::new(grid);
        let image = counting_image(&grid, 2);
        assert!(revealer.reveal(&QueryMask::zeros(1, 4), &image).is_err());
        assert!(revealer.reveal(&QueryMask::zeros(2, 5), &image).is_err());
    }

    #[test]
    fn test_empty_mask_is_blank() {
        let grid = quad_grid();
        let revealer = PatchRevealer::new(grid);
        let image = counting_image(&grid, 3);
        let partial = revealer.reveal(&QueryMask::zeros(3, 4), &image).unwrap();
        assert_eq!(partial, revealer.blank(3));
    }
}
