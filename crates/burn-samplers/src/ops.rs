//! Tensor kernels shared across samplers

use burn::prelude::*;

/// Linear combination of equal-shaped tensors with scalar weights.
///
/// Computes `Σ weightᵢ · valueᵢ` elementwise. Every multistep formula, the
/// previous-sample solver, and noise injection route through this kernel.
///
/// Panics when fewer than two terms are given, when the weight and value
/// counts differ, or when operand shapes disagree.
pub fn weighted_sum<B: Backend, const D: usize>(
    weights: &[f32],
    values: &[Tensor<B, D>],
) -> Tensor<B, D> {
    assert!(
        weights.len() >= 2,
        "weighted sum needs at least 2 terms, got {}",
        weights.len()
    );
    assert_eq!(
        weights.len(),
        values.len(),
        "weight and value counts differ"
    );

    let dims = values[0].dims();
    let mut acc = Tensor::zeros(dims, &values[0].device());
    for (weight, value) in weights.iter().zip(values) {
        assert_eq!(value.dims(), dims, "weighted sum operands must share a shape");
        acc = acc + value.clone() * *weight;
    }
    acc
}
