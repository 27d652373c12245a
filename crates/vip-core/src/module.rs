use std::collections::HashMap;

use crate::{CoreError, Result, Tensor};

/// Gradients keyed by parameter name, in the same naming as [`Module::named_parameters`].
pub type Gradients = HashMap<String, Tensor>;

/// Base trait for every model with trainable parameters.
pub trait Module: Send + Sync {
    /// Named parameters (for state_dict / checkpoints).
    fn named_parameters(&self) -> Vec<(String, &Tensor)>;

    /// Mutable named parameters, same names and order as [`Module::named_parameters`].
    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)>;

    /// Total number of scalar parameters.
    fn param_count(&self) -> usize {
        self.named_parameters().iter().map(|(_, t)| t.numel()).sum()
    }

    /// Export state dictionary.
    fn state_dict(&self) -> HashMap<String, Tensor> {
        self.named_parameters()
            .into_iter()
            .map(|(name, t)| (name, t.clone()))
            .collect()
    }

    /// Overwrite parameters from a state dictionary. Every parameter must be
    /// present with a matching shape; extra entries are ignored.
    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        for (name, param) in self.named_parameters_mut() {
            let src = state
                .get(&name)
                .ok_or_else(|| CoreError::MissingParameter(name.clone()))?;
            src.expect_dims(param.dims())?;
            param.data_mut().copy_from_slice(src.data());
        }
        Ok(())
    }
}

/// L2 norm over every gradient tensor.
pub fn grad_norm(grads: &Gradients) -> f32 {
    grads.values().map(Tensor::sum_squares).sum::<f32>().sqrt()
}
