use crate::kernel::{CellKernel, CellPos, CellWriter, KernelFault, KernelInputs};

/// Row statistics for a full-width softmax, two passes: max, then exp-sum.
///
/// ```text
/// smInput  (B, T) (n)
/// smAgg    (B, T) (1) [inv_sum, max]
/// ```
#[derive(Debug)]
pub struct SoftmaxAgg {
    pub n: usize,
}

impl CellKernel for SoftmaxAgg {
    fn eval(
        &self,
        pos: CellPos,
        inputs: &KernelInputs<'_>,
        out: &mut CellWriter<'_, '_>,
    ) -> Result<(), KernelFault> {
        let mut max = inputs.fetch1(0, 0, pos.y)?;
        for i in 1..self.n {
            max = max.max(inputs.fetch1(0, i, pos.y)?);
        }

        let mut sum = 0.0f32;
        for i in 0..self.n {
            sum += (inputs.fetch1(0, i, pos.y)? - max).exp();
        }

        out.set(0, 0, 1.0 / sum)?;
        out.set(0, 1, max)
    }
}

/// ```text
/// smInput   (B, T) (n)
/// smAgg     (B, T) (1) [inv_sum, max]
/// smOutput  (B, T) (n)
/// ```
#[derive(Debug)]
pub struct Softmax;

impl CellKernel for Softmax {
    fn eval(
        &self,
        pos: CellPos,
        inputs: &KernelInputs<'_>,
        out: &mut CellWriter<'_, '_>,
    ) -> Result<(), KernelFault> {
        let inv_sum = inputs.fetch_channel(1, 0, pos.y, 0)?;
        let max = inputs.fetch_channel(1, 0, pos.y, 1)?;
        let p = inputs.fetch1(0, pos.x, pos.y)?;
        out.set(0, 0, (p - max).exp() * inv_sum)
    }
}
