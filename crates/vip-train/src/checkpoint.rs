//! SafeTensors checkpoints for the classifier and querier.
//!
//! Every parameter is stored as `"{model}.{param}"`, e.g.
//! `classifier.layers.0.weight`. Files are written as F32; F16 and BF16
//! files load too.

use std::collections::HashMap;
use std::path::Path;

use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use tracing::debug;
use vip_core::{Module, Tensor};

use crate::error::{CheckpointError, TrainResult};

/// Write the named modules' parameters to `path`.
pub fn save_checkpoint(
    path: &Path,
    modules: &[(&str, &dyn Module)],
    metadata: Option<HashMap<String, String>>,
) -> TrainResult<()> {
    let mut named: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::new();
    for (prefix, module) in modules {
        for (name, t) in module.named_parameters() {
            let bytes: Vec<u8> = t.data().iter().flat_map(|v| v.to_le_bytes()).collect();
            named.push((format!("{}.{}", prefix, name), t.dims().to_vec(), bytes));
        }
    }

    let views = named
        .iter()
        .map(|(name, shape, bytes)| {
            TensorView::new(Dtype::F32, shape.clone(), bytes)
                .map(|view| (name.clone(), view))
                .map_err(|e| CheckpointError::SafeTensors(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let buffer = safetensors::serialize(views, &metadata)
        .map_err(|e| CheckpointError::SafeTensors(e.to_string()))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, buffer)?;
    debug!(path = %path.display(), tensors = named.len(), "checkpoint saved");
    Ok(())
}

/// Read every tensor in `path`, converted to f32.
pub fn load_tensors(path: &Path) -> TrainResult<HashMap<String, Tensor>> {
    let data = std::fs::read(path)?;
    let tensors =
        SafeTensors::deserialize(&data).map_err(|e| CheckpointError::SafeTensors(e.to_string()))?;

    let mut result = HashMap::new();
    for (name, view) in tensors.tensors() {
        let bytes = view.data();
        let values: Vec<f32> = match view.dtype() {
            Dtype::F32 => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::F16 => bytes
                .chunks_exact(2)
                .map(|c| half::f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            Dtype::BF16 => bytes
                .chunks_exact(2)
                .map(|c| half::bf16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
                .collect(),
            other => {
                return Err(CheckpointError::UnsupportedDtype {
                    name,
                    dtype: format!("{:?}", other),
                }
                .into())
            }
        };
        let tensor = Tensor::from_vec(values, view.shape())?;
        result.insert(name, tensor);
    }
    Ok(result)
}

/// Load `path` into each module, matching on the `"{prefix}."` key prefix.
/// Missing parameters and shape mismatches are errors.
pub fn load_checkpoint(path: &Path, modules: &mut [(&str, &mut dyn Module)]) -> TrainResult<()> {
    let tensors = load_tensors(path)?;
    for (prefix, module) in modules.iter_mut() {
        let head = format!("{}.", prefix);
        let state: HashMap<String, Tensor> = tensors
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&head).map(|rest| (rest.to_string(), v.clone())))
            .collect();
        module.load_state_dict(&state)?;
    }
    debug!(path = %path.display(), tensors = tensors.len(), "checkpoint loaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Mlp;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_save_load_restores_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt").join("epoch0.safetensors");
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let a = Mlp::new(&[3, 4, 2], &mut rng);
        let b = Mlp::new(&[3, 2], &mut rng);
        let modules: [(&str, &dyn Module); 2] = [("classifier", &a), ("querier", &b)];
        save_checkpoint(&path, &modules, None).unwrap();

        let keys = load_tensors(&path).unwrap();
        assert!(keys.contains_key("classifier.layers.1.bias"));
        assert!(keys.contains_key("querier.layers.0.weight"));

        let mut a2 = Mlp::new(&[3, 4, 2], &mut rng);
        let mut b2 = Mlp::new(&[3, 2], &mut rng);
        let mut targets: [(&str, &mut dyn Module); 2] = [("classifier", &mut a2), ("querier", &mut b2)];
        load_checkpoint(&path, &mut targets).unwrap();
        assert_eq!(a2.state_dict(), a.state_dict());
        assert_eq!(b2.state_dict(), b.state_dict());
    }

    #[test]
    fn test_load_rejects_wrong_architecture() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.safetensors");
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let saved = Mlp::new(&[3, 2], &mut rng);
        save_checkpoint(&path, &[("classifier", &saved as &dyn Module)], None).unwrap();

        let mut wider = Mlp::new(&[3, 5], &mut rng);
        let mut targets: [(&str, &mut dyn Module); 1] = [("classifier", &mut wider)];
        assert!(load_checkpoint(&path, &mut targets).is_err());

        let mut deeper = Mlp::new(&[3, 2, 2], &mut rng);
        let mut targets: [(&str, &mut dyn Module); 1] = [("classifier", &mut deeper)];
        assert!(load_checkpoint(&path, &mut targets).is_err());
    }

    #[test]
    fn test_load_half_precision() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("half.safetensors");
        let values = [0.5f32, -2.0, 1.25];
        let f16: Vec<u8> = values
            .iter()
            .flat_map(|&v| half::f16::from_f32(v).to_bits().to_le_bytes())
            .collect();
        let bf16: Vec<u8> = values
            .iter()
            .flat_map(|&v| half::bf16::from_f32(v).to_bits().to_le_bytes())
            .collect();
        let views = vec![
            ("a".to_string(), TensorView::new(Dtype::F16, vec![3], &f16).unwrap()),
            ("b".to_string(), TensorView::new(Dtype::BF16, vec![1, 3], &bf16).unwrap()),
        ];
        std::fs::write(&path, safetensors::serialize(views, &None).unwrap()).unwrap();

        let loaded = load_tensors(&path).unwrap();
        assert_eq!(loaded["a"].data(), &values);
        assert_eq!(loaded["b"].dims(), &[1, 3]);
        assert_eq!(loaded["b"].data(), &values);
    }
}
