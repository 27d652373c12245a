//! Cross-entropy over class logits.

use vip_core::{softmax_in_place, CoreError, Result, Tensor};

/// Mean cross-entropy of `(batch, K)` logits against integer labels, with its
/// gradient w.r.t. the logits (`(softmax − onehot) / batch`).
pub fn cross_entropy(logits: &Tensor, labels: &[usize]) -> Result<(f32, Tensor)> {
    logits.expect_rank(2)?;
    let (batch, k) = (logits.dims()[0], logits.dims()[1]);
    if labels.len() != batch {
        return Err(CoreError::ShapeMismatch {
            expected: vec![batch],
            got: vec![labels.len()],
        });
    }
    if let Some(&label) = labels.iter().find(|&&l| l >= k) {
        return Err(CoreError::IndexOutOfBounds {
            index: label,
            axis: 1,
            size: k,
        });
    }

    let mut grad = logits.clone();
    let mut total = 0.0f32;
    let scale = 1.0 / batch.max(1) as f32;
    for (row, &label) in grad.rows_mut().zip(labels) {
        // log-sum-exp before the row is overwritten
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let lse = max_val + row.iter().map(|&v| (v - max_val).exp()).sum::<f32>().ln();
        total += lse - row[label];

        softmax_in_place(row);
        row[label] -= 1.0;
        row.iter_mut().for_each(|g| *g *= scale);
    }
    Ok((total * scale, grad))
}
