//! Dense layers with explicit backward passes.

use rand::Rng;
use rayon::prelude::*;
use vip_core::{Gradients, Module, Result, Tensor};

/// Fully connected layer. Weight is `(out_dim, in_dim)`, row-major.
#[derive(Clone, Debug)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Tensor,
}

/// Gradients of one [`Linear`] call.
pub struct LinearGrads {
    pub weight: Tensor,
    pub bias: Tensor,
    pub input: Tensor,
}

impl Linear {
    /// He-uniform weights, zero bias.
    pub fn new(in_dim: usize, out_dim: usize, rng: &mut impl Rng) -> Self {
        let std = (2.0 / in_dim.max(1) as f32).sqrt();
        let mut weight = Tensor::zeros(&[out_dim, in_dim]);
        for w in weight.data_mut() {
            *w = rng.gen_range(-std..std);
        }
        Self {
            weight,
            bias: Tensor::zeros(&[out_dim]),
        }
    }

    pub fn in_dim(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn out_dim(&self) -> usize {
        self.weight.dims()[0]
    }

    /// `(batch, in_dim)` → `(batch, out_dim)`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (d_in, d_out) = (self.in_dim(), self.out_dim());
        x.expect_dims(&[x.batch_size(), d_in])?;
        let w = self.weight.data();
        let b = self.bias.data();

        let mut out = Tensor::zeros(&[x.batch_size(), d_out]);
        out.par_rows_mut()
            .zip(x.data().par_chunks(d_in.max(1)))
            .for_each(|(y, xr)| {
                for (o, yo) in y.iter_mut().enumerate() {
                    let wr = &w[o * d_in..(o + 1) * d_in];
                    *yo = b[o] + wr.iter().zip(xr).map(|(a, v)| a * v).sum::<f32>();
                }
            });
        Ok(out)
    }

    /// Gradients given the forward input `x` and the gradient of the output.
    pub fn backward(&self, x: &Tensor, grad_out: &Tensor) -> Result<LinearGrads> {
        let (d_in, d_out) = (self.in_dim(), self.out_dim());
        let batch = x.batch_size();
        x.expect_dims(&[batch, d_in])?;
        grad_out.expect_dims(&[batch, d_out])?;
        let (xd, gd, w) = (x.data(), grad_out.data(), self.weight.data());

        let mut dw = Tensor::zeros(&[d_out, d_in]);
        dw.par_rows_mut().enumerate().for_each(|(o, row)| {
            for n in 0..batch {
                let g = gd[n * d_out + o];
                if g == 0.0 {
                    continue;
                }
                for (acc, &v) in row.iter_mut().zip(&xd[n * d_in..(n + 1) * d_in]) {
                    *acc += g * v;
                }
            }
        });

        let mut db = Tensor::zeros(&[d_out]);
        for g in grad_out.rows() {
            for (acc, &v) in db.data_mut().iter_mut().zip(g) {
                *acc += v;
            }
        }

        let mut dx = Tensor::zeros(&[batch, d_in]);
        dx.par_rows_mut().enumerate().for_each(|(n, row)| {
            for o in 0..d_out {
                let g = gd[n * d_out + o];
                if g == 0.0 {
                    continue;
                }
                for (acc, &wv) in row.iter_mut().zip(&w[o * d_in..(o + 1) * d_in]) {
                    *acc += g * wv;
                }
            }
        });

        Ok(LinearGrads {
            weight: dw,
            bias: db,
            input: dx,
        })
    }
}

pub fn relu(x: &Tensor) -> Tensor {
    x.map(|v| v.max(0.0))
}

/// Passes `grad` where the pre-activation was positive.
pub fn relu_backward(pre: &Tensor, grad: &Tensor) -> Result<Tensor> {
    pre.zip_map(grad, |p, g| if p > 0.0 { g } else { 0.0 })
}

/// Activations saved by [`Mlp::forward_cached`].
pub struct MlpCache {
    inputs: Vec<Tensor>,
}

/// Linear → ReLU → … → Linear.
#[derive(Clone, Debug)]
pub struct Mlp {
    pub layers: Vec<Linear>,
}

impl Mlp {
    /// `dims = [in, hidden…, out]`.
    pub fn new(dims: &[usize], rng: &mut impl Rng) -> Self {
        let layers = dims.windows(2).map(|w| Linear::new(w[0], w[1], rng)).collect();
        Self { layers }
    }

    pub fn in_dim(&self) -> usize {
        self.layers.first().map_or(0, Linear::in_dim)
    }

    pub fn out_dim(&self) -> usize {
        self.layers.last().map_or(0, Linear::out_dim)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        Ok(self.forward_cached(x)?.0)
    }

    pub fn forward_cached(&self, x: &Tensor) -> Result<(Tensor, MlpCache)> {
        let mut inputs = Vec::with_capacity(self.layers.len());
        let mut h = x.clone();
        let last = self.layers.len().saturating_sub(1);
        for (i, layer) in self.layers.iter().enumerate() {
            let pre = layer.forward(&h)?;
            inputs.push(h);
            h = if i < last { relu(&pre) } else { pre };
        }
        Ok((h, MlpCache { inputs }))
    }

    /// Accumulates parameter gradients into `grads` and returns the gradient
    /// w.r.t. the network input.
    pub fn backward(&self, cache: &MlpCache, grad_out: &Tensor, grads: &mut Gradients) -> Result<Tensor> {
        let mut g = grad_out.clone();
        for (i, layer) in self.layers.iter().enumerate().rev() {
            let x = &cache.inputs[i];
            let lg = layer.backward(x, &g)?;
            accumulate(grads, format!("layers.{}.weight", i), lg.weight)?;
            accumulate(grads, format!("layers.{}.bias", i), lg.bias)?;
            // `x` is relu(pre) for every layer but the first, and relu(pre) > 0 iff pre > 0.
            g = if i > 0 { relu_backward(x, &lg.input)? } else { lg.input };
        }
        Ok(g)
    }
}

fn accumulate(grads: &mut Gradients, name: String, g: Tensor) -> Result<()> {
    match grads.get_mut(&name) {
        Some(acc) => *acc = acc.add(&g)?,
        None => {
            grads.insert(name, g);
        }
    }
    Ok(())
}

impl Module for Mlp {
    fn named_parameters(&self) -> Vec<(String, &Tensor)> {
        self.layers
            .iter()
            .enumerate()
            .flat_map(|(i, l)| {
                [
                    (format!("layers.{}.weight", i), &l.weight),
                    (format!("layers.{}.bias", i), &l.bias),
                ]
            })
            .collect()
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        self.layers
            .iter_mut()
            .enumerate()
            .flat_map(|(i, l)| {
                [
                    (format!("layers.{}.weight", i), &mut l.weight),
                    (format!("layers.{}.bias", i), &mut l.bias),
                ]
            })
            .collect()
    }
}
