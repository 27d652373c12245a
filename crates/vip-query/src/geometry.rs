//! Patch geometry: flat patch index ⇄ top-left pixel of its rectangle.

use serde::{Deserialize, Serialize};

use crate::{QueryError, Result};

/// How patches are laid over the image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PatchLayout {
    /// Non-overlapping tiles, stride = patch_size. `patch_size` must divide H and W.
    #[default]
    Tiled,
    /// Every `patch_size × patch_size` window at stride 1 (overlapping).
    Sliding,
}

/// Top-left corner `(row, col)` of tile `patch_index` in a tiled image of
/// width `image_width`.
///
/// The height is not known here, so callers must keep `patch_index < P`;
/// [`PatchGrid::patch_bounds`] is the checked variant.
pub fn patch_bounds(patch_index: usize, patch_size: usize, image_width: usize) -> (usize, usize) {
    assert!(
        patch_size > 0 && patch_size <= image_width,
        "patch_bounds: patch_size {} invalid for width {}",
        patch_size,
        image_width
    );
    let per_row = image_width / patch_size;
    ((patch_index / per_row) * patch_size, (patch_index % per_row) * patch_size)
}

/// Geometry of the patch index space for one dataset configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchGrid {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub patch_size: usize,
    pub layout: PatchLayout,
}

impl PatchGrid {
    /// Validate and build a grid. Geometry errors are configuration errors.
    pub fn new(
        channels: usize,
        height: usize,
        width: usize,
        patch_size: usize,
        layout: PatchLayout,
    ) -> Result<Self> {
        if channels == 0 || height == 0 || width == 0 {
            return Err(QueryError::InvalidGeometry(format!(
                "image dimensions must be non-zero, got {}x{}x{}",
                channels, height, width
            )));
        }
        if patch_size == 0 || patch_size > height || patch_size > width {
            return Err(QueryError::InvalidGeometry(format!(
                "patch_size {} does not fit a {}x{} image",
                patch_size, height, width
            )));
        }
        if layout == PatchLayout::Tiled
            && (!height.is_multiple_of(patch_size) || !width.is_multiple_of(patch_size))
        {
            return Err(QueryError::InvalidGeometry(format!(
                "patch_size {} must divide {}x{} for a tiled layout",
                patch_size, height, width
            )));
        }
        Ok(Self { channels, height, width, patch_size, layout })
    }

    /// 28×28 single-channel images, 3×3 sliding patches: 26×26 = 676 queries.
    pub fn mnist() -> Self {
        Self {
            channels: 1,
            height: 28,
            width: 28,
            patch_size: 3,
            layout: PatchLayout::Sliding,
        }
    }

    pub fn stride(&self) -> usize {
        match self.layout {
            PatchLayout::Tiled => self.patch_size,
            PatchLayout::Sliding => 1,
        }
    }

    pub fn grid_height(&self) -> usize {
        (self.height - self.patch_size) / self.stride() + 1
    }

    pub fn grid_width(&self) -> usize {
        (self.width - self.patch_size) / self.stride() + 1
    }

    /// P, the size of the patch index space.
    pub fn num_patches(&self) -> usize {
        self.grid_height() * self.grid_width()
    }

    /// Elements in one image (C × H × W).
    pub fn image_len(&self) -> usize {
        self.channels * self.height * self.width
    }

    /// Image dims for a batch: `[batch, C, H, W]`.
    pub fn image_dims(&self, batch: usize) -> [usize; 4] {
        [batch, self.channels, self.height, self.width]
    }

    /// Top-left pixel of patch `index`. Panics if `index >= P`.
    pub fn patch_bounds(&self, index: usize) -> (usize, usize) {
        assert!(
            index < self.num_patches(),
            "patch index {} out of range for {} patches",
            index,
            self.num_patches()
        );
        let gw = self.grid_width();
        let s = self.stride();
        ((index / gw) * s, (index % gw) * s)
    }

    /// Patch whose top-left corner is `(row, col)`, if one exists.
    pub fn patch_index(&self, row: usize, col: usize) -> Option<usize> {
        let s = self.stride();
        if !row.is_multiple_of(s) || !col.is_multiple_of(s) {
            return None;
        }
        let (gy, gx) = (row / s, col / s);
        (gy < self.grid_height() && gx < self.grid_width()).then(|| gy * self.grid_width() + gx)
    }

    /// Calls `f(pixel_offset)` for every `(y, x)` offset within one channel plane
    /// covered by patch `index`.
    pub(crate) fn for_each_pixel(&self, index: usize, mut f: impl FnMut(usize)) {
        let (r0, c0) = self.patch_bounds(index);
        for y in r0..r0 + self.patch_size {
            let base = y * self.width;
            for x in c0..c0 + self.patch_size {
                f(base + x);
            }
        }
    }
}
