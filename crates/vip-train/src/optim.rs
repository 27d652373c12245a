use std::collections::HashMap;

use vip_core::{CoreError, Gradients, Module, Result, Tensor};

/// SGD with heavy-ball momentum.
///
/// Velocity is keyed by `"{prefix}.{param}"`, so one optimizer can step
/// several modules.
#[derive(Clone, Debug)]
pub struct Sgd {
    lr: f32,
    momentum: f32,
    velocity: HashMap<String, Tensor>,
}

impl Sgd {
    pub fn new(lr: f32, momentum: f32) -> Self {
        Self {
            lr,
            momentum,
            velocity: HashMap::new(),
        }
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    /// `v ← μ·v + g`, `θ ← θ − lr·v` for every parameter with a gradient.
    ///
    /// A gradient shaped differently from its parameter is an error, and
    /// nothing is updated in that case.
    pub fn step<M: Module + ?Sized>(&mut self, prefix: &str, module: &mut M, grads: &Gradients) -> Result<()> {
        let mut params: Vec<(String, &mut Tensor, &Tensor)> = module
            .named_parameters_mut()
            .into_iter()
            .filter_map(|(name, param)| grads.get(&name).map(|g| (name, param, g)))
            .collect();
        if let Some((_, param, g)) = params.iter().find(|(_, p, g)| p.dims() != g.dims()) {
            return Err(CoreError::ShapeMismatch {
                expected: param.dims().to_vec(),
                got: g.dims().to_vec(),
            });
        }

        for (name, param, g) in params.iter_mut() {
            let v = self
                .velocity
                .entry(format!("{}.{}", prefix, name))
                .or_insert_with(|| Tensor::zeros(param.dims()));
            for ((p, vel), &gv) in param.data_mut().iter_mut().zip(v.data_mut()).zip(g.data()) {
                *vel = self.momentum * *vel + gv;
                *p -= self.lr * *vel;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scalar {
        w: Tensor,
    }

    impl Module for Scalar {
        fn named_parameters(&self) -> Vec<(String, &Tensor)> {
            vec![("w".into(), &self.w)]
        }
        fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
            vec![("w".into(), &mut self.w)]
        }
    }

    #[test]
    fn test_momentum_accumulates() {
        let mut m = Scalar { w: Tensor::zeros(&[1]) };
        let mut grads = Gradients::new();
        grads.insert("w".into(), Tensor::full(&[1], 1.0));
        let mut opt = Sgd::new(0.1, 0.5);
        opt.step("m", &mut m, &grads).unwrap();
        assert!((m.w.data()[0] + 0.1).abs() < 1e-6);
        opt.step("m", &mut m, &grads).unwrap();
        // v = 0.5 * 1 + 1 = 1.5
        assert!((m.w.data()[0] + 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_prefixes_keep_separate_velocity() {
        let mut a = Scalar { w: Tensor::zeros(&[1]) };
        let mut b = Scalar { w: Tensor::zeros(&[1]) };
        let mut grads = Gradients::new();
        grads.insert("w".into(), Tensor::full(&[1], 1.0));
        let mut opt = Sgd::new(1.0, 0.9);
        opt.step("a", &mut a, &grads).unwrap();
        opt.step("a", &mut a, &grads).unwrap();
        opt.step("b", &mut b, &grads).unwrap();
        assert!((b.w.data()[0] + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mismatched_gradient_is_an_error() {
        let mut m = Scalar { w: Tensor::zeros(&[1]) };
        let mut grads = Gradients::new();
        grads.insert("w".into(), Tensor::full(&[2], 1.0));
        let mut opt = Sgd::new(0.1, 0.0);
        assert!(matches!(
            opt.step("m", &mut m, &grads),
            Err(CoreError::ShapeMismatch { .. })
        ));
        assert_eq!(m.w.data(), &[0.0]);
    }
}
