use crate::kernel::{CellKernel, CellPos, CellWriter, KernelFault, KernelInputs};

/// Feeds the model's prediction back into its input.
///
/// At time index `targetTIdx` writes the most probable token predicted by the
/// previous position; every other row copies its current token, so the output
/// is a complete next-step token buffer.
///
/// ```text
/// prevOutput   (B, T) (n_vocab)
/// currInput    (B, T) (1)
/// targetTIdx   uniform
/// nextTokens   (B, T) (1)
/// ```
#[derive(Debug)]
pub struct ArgmaxCopy {
    pub t: usize,
    pub vocab: usize,
}

impl CellKernel for ArgmaxCopy {
    fn eval(
        &self,
        pos: CellPos,
        inputs: &KernelInputs<'_>,
        out: &mut CellWriter<'_, '_>,
    ) -> Result<(), KernelFault> {
        let t_idx = pos.y % self.t;
        let target = inputs.uniform(0)?;

        if t_idx == 0 || i64::try_from(t_idx).ok() != Some(i64::from(target)) {
            return out.set(0, 0, inputs.fetch1(1, 0, pos.y)?);
        }

        let mut best = 0;
        let mut best_p = inputs.fetch1(0, 0, pos.y - 1)?;
        for i in 1..self.vocab {
            let p = inputs.fetch1(0, i, pos.y - 1)?;
            if p > best_p {
                best_p = p;
                best = i;
            }
        }
        out.set(0, 0, best as f32)
    }
}
