//! Per-cell kernels of the GPT forward pass.
//!
//! Buffers use a folded 2D layout: `y` enumerates `(batch, time)` rows, or
//! `(batch, head, time)` rows inside attention, and `x` enumerates features.
//! Each kernel computes one destination cell.

mod argmax;
mod attention;
mod elementwise;
mod embed;
mod layer_norm;
mod linear;
mod softmax;

pub use argmax::ArgmaxCopy;
pub use attention::{AttnAgg, AttnSoftmax, Qkv, ScaledVectors, SelfAttend};
pub use elementwise::{Add, Gelu};
pub use embed::Embed;
pub use layer_norm::{NormAgg, NormApply};
pub use linear::Linear;
pub use softmax::{Softmax, SoftmaxAgg};

#[cfg(test)]
mod tests;
