//! Two-phase layer normalization.
//!
//! Phase one reduces each row to `(mean, 1 / sqrt(var + eps))` with Welford's
//! algorithm; phase two applies `(x - mean) * inv_std * weight + bias`.

use crate::kernel::{CellKernel, CellPos, CellWriter, KernelFault, KernelInputs};

/// ```text
/// normInput  (B, T) (n)
/// normAgg    (B, T) (1) [mean, inv_std]
/// ```
#[derive(Debug)]
pub struct NormAgg {
    pub n: usize,
    pub eps: f32,
}

impl CellKernel for NormAgg {
    fn eval(
        &self,
        pos: CellPos,
        inputs: &KernelInputs<'_>,
        out: &mut CellWriter<'_, '_>,
    ) -> Result<(), KernelFault> {
        let mut mean = 0.0f32;
        let mut m2 = 0.0f32;
        for i in 0..self.n {
            let x = inputs.fetch1(0, i, pos.y)?;
            let delta = x - mean;
            mean += delta / (i + 1) as f32;
            m2 += delta * (x - mean);
        }
        let inv_std = 1.0 / (m2 / self.n as f32 + self.eps).sqrt();

        out.set(0, 0, mean)?;
        out.set(0, 1, inv_std)
    }
}

/// ```text
/// normInput   (B, T) (n)
/// normAgg     (B, T) (1) [mean, inv_std]
/// normWeight  (n)    (1)
/// normBias    (n)    (1)
/// normOutput  (B, T) (n)
/// ```
#[derive(Debug)]
pub struct NormApply;

impl CellKernel for NormApply {
    fn eval(
        &self,
        pos: CellPos,
        inputs: &KernelInputs<'_>,
        out: &mut CellWriter<'_, '_>,
    ) -> Result<(), KernelFault> {
        let mean = inputs.fetch_channel(1, 0, pos.y, 0)?;
        let inv_std = inputs.fetch_channel(1, 0, pos.y, 1)?;

        let x = inputs.fetch1(0, pos.x, pos.y)?;
        let weight = inputs.fetch1(2, 0, pos.x)?;
        let bias = inputs.fetch1(3, 0, pos.x)?;

        out.set(0, 0, (x - mean) * inv_std * weight + bias)
    }
}
