//! Image datasets: MNIST IDX files and a seeded synthetic set.

use std::path::Path;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::info;
use vip_core::Tensor;
use vip_query::PatchGrid;

use crate::error::{DatasetError, TrainResult};

const IDX_IMAGES_MAGIC: u32 = 0x0000_0803;
const IDX_LABELS_MAGIC: u32 = 0x0000_0801;

/// Labelled images held in memory as `(N, C, H, W)`.
#[derive(Clone, Debug)]
pub struct ImageDataset {
    images: Tensor,
    labels: Vec<usize>,
    num_classes: usize,
}

impl ImageDataset {
    pub fn new(images: Tensor, labels: Vec<usize>, num_classes: usize) -> TrainResult<Self> {
        images.expect_rank(4)?;
        if images.batch_size() != labels.len() {
            return Err(DatasetError::CountMismatch {
                images: images.batch_size(),
                labels: labels.len(),
            }
            .into());
        }
        if let Some(&label) = labels.iter().find(|&&l| l >= num_classes) {
            return Err(DatasetError::LabelOutOfRange { label, num_classes }.into());
        }
        Ok(Self {
            images,
            labels,
            num_classes,
        })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn images(&self) -> &Tensor {
        &self.images
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Sequential batches; the last one may be short.
    pub fn batches(&self, batch_size: usize) -> Batches<'_> {
        Batches {
            dataset: self,
            batch_size: batch_size.max(1),
            cursor: 0,
        }
    }
}

pub struct Batches<'a> {
    dataset: &'a ImageDataset,
    batch_size: usize,
    cursor: usize,
}

impl<'a> Iterator for Batches<'a> {
    type Item = (Tensor, &'a [usize]);

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.dataset.len();
        if self.cursor >= n {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(n);
        let images = self.dataset.images.batch_range(self.cursor..end);
        let labels = &self.dataset.labels[self.cursor..end];
        self.cursor = end;
        Some((images, labels))
    }
}

/// `train-*` or `t10k-*` MNIST split from `dir`, pixels binarised to ±1.
pub fn load_mnist(dir: &Path, train: bool) -> TrainResult<ImageDataset> {
    let prefix = if train { "train" } else { "t10k" };
    let images_path = dir.join(format!("{}-images-idx3-ubyte", prefix));
    let labels_path = dir.join(format!("{}-labels-idx1-ubyte", prefix));

    let (dims, pixels) = read_idx(&images_path, IDX_IMAGES_MAGIC, 3)?;
    let (_, raw_labels) = read_idx(&labels_path, IDX_LABELS_MAGIC, 1)?;

    let data: Vec<f32> = pixels.iter().map(|&b| binarise(b)).collect();
    let images = Tensor::from_vec(data, &[dims[0], 1, dims[1], dims[2]])?;
    let labels = raw_labels.into_iter().map(usize::from).collect();
    let ds = ImageDataset::new(images, labels, 10)?;
    info!(split = prefix, samples = ds.len(), "loaded MNIST");
    Ok(ds)
}

/// `x / 255 < 0.5 → −1`, else `+1`.
fn binarise(byte: u8) -> f32 {
    if (byte as f32 / 255.0) < 0.5 {
        -1.0
    } else {
        1.0
    }
}

/// Parses an unsigned-byte IDX file: big-endian magic, `ndim` big-endian
/// u32 dims, then the payload.
fn read_idx(path: &Path, magic: u32, ndim: usize) -> TrainResult<(Vec<usize>, Vec<u8>)> {
    if !path.exists() {
        return Err(DatasetError::MissingFile(path.to_path_buf()).into());
    }
    let bytes = std::fs::read(path)?;
    let header_len = 4 * (ndim + 1);
    if bytes.len() < header_len {
        return Err(DatasetError::Truncated {
            path: path.to_path_buf(),
            expected: header_len,
            got: bytes.len(),
        }
        .into());
    }
    let word = |i: usize| u32::from_be_bytes([bytes[4 * i], bytes[4 * i + 1], bytes[4 * i + 2], bytes[4 * i + 3]]);
    let got = word(0);
    if got != magic {
        return Err(DatasetError::BadMagic {
            path: path.to_path_buf(),
            expected: magic,
            got,
        }
        .into());
    }
    let dims: Vec<usize> = (1..=ndim).map(|i| word(i) as usize).collect();
    let expected = header_len + dims.iter().product::<usize>();
    if bytes.len() < expected {
        return Err(DatasetError::Truncated {
            path: path.to_path_buf(),
            expected,
            got: bytes.len(),
        }
        .into());
    }
    Ok((dims, bytes[header_len..expected].to_vec()))
}

/// `n` binary images where class `c` lights up its own block of the image,
/// with a few pixels flipped. Deterministic in `seed`.
pub fn synthetic(grid: &PatchGrid, n: usize, num_classes: usize, seed: u64) -> TrainResult<ImageDataset> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let side = (num_classes as f64).sqrt().ceil().max(1.0) as usize;
    let (bh, bw) = ((grid.height / side).max(1), (grid.width / side).max(1));
    let plane = grid.height * grid.width;

    let mut data = Vec::with_capacity(n * grid.image_len());
    let mut labels = Vec::with_capacity(n);
    for _ in 0..n {
        let class = rng.gen_range(0..num_classes);
        let (r0, c0) = ((class / side) * bh, (class % side) * bw);
        let mut img = vec![-1.0f32; plane];
        for y in r0..(r0 + bh).min(grid.height) {
            for x in c0..(c0 + bw).min(grid.width) {
                img[y * grid.width + x] = 1.0;
            }
        }
        for v in img.iter_mut() {
            if rng.gen_bool(0.05) {
                *v = -*v;
            }
        }
        for _ in 0..grid.channels {
            data.extend_from_slice(&img);
        }
        labels.push(class);
    }
    let images = Tensor::from_vec(data, &grid.image_dims(n))?;
    ImageDataset::new(images, labels, num_classes)
}
