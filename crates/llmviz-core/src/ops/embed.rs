use crate::kernel::{CellKernel, CellPos, CellWriter, KernelFault, KernelInputs};

/// Embedding lookup.
///
/// ```text
/// embedInput   (B, T)   (1)      integer index per row
/// embedWeight  (n_rows) (n_dims)
/// embedOutput  (B, T)   (n_dims)
/// ```
#[derive(Debug)]
pub struct Embed {
    pub n_rows: usize,
}

impl CellKernel for Embed {
    fn eval(
        &self,
        pos: CellPos,
        inputs: &KernelInputs<'_>,
        out: &mut CellWriter<'_, '_>,
    ) -> Result<(), KernelFault> {
        let value = inputs.fetch1(0, 0, pos.y)?;
        if !value.is_finite() || value < 0.0 || value as usize >= self.n_rows {
            return Err(KernelFault::IndexOutOfRange {
                value,
                rows: self.n_rows,
            });
        }
        let row = value as usize;
        out.set(0, 0, inputs.fetch1(1, pos.x, row)?)
    }
}
