//! Causal self-attention kernels.
//!
//! Attention internals fold `(batch, head, time)` into rows, so row `y`
//! addresses batch `y / (H * T)`, head `(y / T) % H`, time `y % T`.

use crate::kernel::{CellKernel, CellPos, CellWriter, KernelFault, KernelInputs};

/// QKV projection with q, k and v packed into channels 0, 1 and 2.
///
/// ```text
/// attnInput  (B, T)    (C)
/// qkvWeight  (H, A)    (C) [3]
/// qkvBias    (H, A)    (1) [3]
/// qkvOutput  (B, H, T) (A) [3]
/// ```
#[derive(Debug)]
pub struct Qkv {
    pub t: usize,
    pub n_head: usize,
    pub head_size: usize,
    pub n_embd: usize,
}

impl CellKernel for Qkv {
    fn eval(
        &self,
        pos: CellPos,
        inputs: &KernelInputs<'_>,
        out: &mut CellWriter<'_, '_>,
    ) -> Result<(), KernelFault> {
        let bh = pos.y / self.t;
        let t_idx = pos.y % self.t;
        let b_idx = bh / self.n_head;
        let head_idx = bh % self.n_head;
        let feature = head_idx * self.head_size + pos.x;
        let in_row = b_idx * self.t + t_idx;

        for channel in 0..3 {
            let mut acc = inputs.fetch_channel(2, 0, feature, channel)?;
            for i in 0..self.n_embd {
                let x = inputs.fetch1(0, i, in_row)?;
                acc += x * inputs.fetch_channel(1, i, feature, channel)?;
            }
            out.set(0, channel, acc)?;
        }
        Ok(())
    }
}

/// Scaled causal scores, `q . k / sqrt(A)` for `k <= q`. Cells above the
/// diagonal are never written and read back as 0.
///
/// ```text
/// qkvOutput   (B, H, T) (A) [3]
/// attnMatrix  (B, H, T) (T)
/// ```
#[derive(Debug)]
pub struct SelfAttend {
    pub t: usize,
    pub head_size: usize,
}

impl CellKernel for SelfAttend {
    fn eval(
        &self,
        pos: CellPos,
        inputs: &KernelInputs<'_>,
        out: &mut CellWriter<'_, '_>,
    ) -> Result<(), KernelFault> {
        let k_idx = pos.x;
        let q_idx = pos.y % self.t;
        if k_idx > q_idx {
            return Ok(());
        }
        let y_offset = pos.y - q_idx;

        let mut dot = 0.0f32;
        for i in 0..self.head_size {
            let q = inputs.fetch_channel(0, i, y_offset + q_idx, 0)?;
            let k = inputs.fetch_channel(0, i, y_offset + k_idx, 1)?;
            dot += q * k;
        }
        out.set(0, 0, dot / (self.head_size as f32).sqrt())
    }
}

/// Softmax statistics over the causal prefix `0..=q` of each score row:
/// channel 0 holds `1 / sum(exp(s - max))`, channel 1 the max.
///
/// ```text
/// attnMatrix     (B, H, T) (T)
/// attnMatrixAgg  (B, H, T) (1) [inv_sum, max]
/// ```
#[derive(Debug)]
pub struct AttnAgg {
    pub t: usize,
}

impl CellKernel for AttnAgg {
    fn eval(
        &self,
        pos: CellPos,
        inputs: &KernelInputs<'_>,
        out: &mut CellWriter<'_, '_>,
    ) -> Result<(), KernelFault> {
        let q_idx = pos.y % self.t;

        let mut max = inputs.fetch1(0, 0, pos.y)?;
        for i in 1..=q_idx {
            max = max.max(inputs.fetch1(0, i, pos.y)?);
        }

        let mut sum = 0.0f32;
        for i in 0..=q_idx {
            sum += (inputs.fetch1(0, i, pos.y)? - max).exp();
        }

        out.set(0, 0, 1.0 / sum)?;
        out.set(0, 1, max)
    }
}

/// Applies the row statistics; cells above the diagonal stay 0.
///
/// ```text
/// attnMatrix         (B, H, T) (T)
/// attnMatrixAgg      (B, H, T) (1) [inv_sum, max]
/// attnMatrixSoftmax  (B, H, T) (T)
/// ```
#[derive(Debug)]
pub struct AttnSoftmax {
    pub t: usize,
}

impl CellKernel for AttnSoftmax {
    fn eval(
        &self,
        pos: CellPos,
        inputs: &KernelInputs<'_>,
        out: &mut CellWriter<'_, '_>,
    ) -> Result<(), KernelFault> {
        if pos.x > pos.y % self.t {
            return Ok(());
        }
        let inv_sum = inputs.fetch_channel(1, 0, pos.y, 0)?;
        let max = inputs.fetch_channel(1, 0, pos.y, 1)?;
        let score = inputs.fetch1(0, pos.x, pos.y)?;
        out.set(0, 0, (score - max).exp() * inv_sum)
    }
}

/// Attention-weighted sum of value vectors, heads laid side by side.
///
/// ```text
/// qkvOutput          (B, H, T) (A) [3]
/// attnMatrixSoftmax  (B, H, T) (T)
/// scaledVectors      (B, T)    (H * A)
/// ```
#[derive(Debug)]
pub struct ScaledVectors {
    pub t: usize,
    pub n_head: usize,
    pub head_size: usize,
}

impl CellKernel for ScaledVectors {
    fn eval(
        &self,
        pos: CellPos,
        inputs: &KernelInputs<'_>,
        out: &mut CellWriter<'_, '_>,
    ) -> Result<(), KernelFault> {
        let a_idx = pos.x % self.head_size;
        let head_idx = pos.x / self.head_size;
        let q_idx = pos.y % self.t;
        let b_idx = pos.y / self.t;
        let y_offset = (b_idx * self.n_head + head_idx) * self.t;

        let mut acc = 0.0f32;
        for i in 0..=q_idx {
            let weight = inputs.fetch1(1, i, y_offset + q_idx)?;
            let v = inputs.fetch_channel(0, a_idx, y_offset + i, 2)?;
            acc += weight * v;
        }
        out.set(0, 0, acc)
    }
}
