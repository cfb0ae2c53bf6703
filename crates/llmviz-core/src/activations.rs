//! Scalar activation and softmax helpers shared by kernels and the CPU reference.

use libm::tanh;

const SQRT_2_OVER_PI: f64 = 0.797_884_560_802_865_4;
const GELU_COEFF: f64 = 0.044715;

/// Tanh approximation of GELU, as used by GPT-2:
/// `0.5 * x * (1 + tanh(sqrt(2 / pi) * (x + 0.044715 * x^3)))`.
///
/// Evaluated in f64 and rounded once.
#[inline]
pub fn gelu_tanh(x: f32) -> f32 {
    let x = f64::from(x);
    (0.5 * x * (1.0 + tanh(SQRT_2_OVER_PI * (x + GELU_COEFF * x * x * x)))) as f32
}

/// Two-pass softmax statistics: the row maximum, then the inverse of the
/// max-shifted exponential sum. Returns `(inv_sum, max)`.
pub fn softmax_stats(row: &[f32]) -> (f32, f32) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let sum: f32 = row.iter().map(|&v| (v - max).exp()).sum();
    (1.0 / sum, max)
}

/// In-place softmax over `row` using [`softmax_stats`].
pub fn softmax_in_place(row: &mut [f32]) {
    if row.is_empty() {
        return;
    }
    let (inv_sum, max) = softmax_stats(row);
    for v in row.iter_mut() {
        *v = (*v - max).exp() * inv_sum;
    }
}
