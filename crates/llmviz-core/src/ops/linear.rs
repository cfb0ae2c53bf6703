use crate::kernel::{CellKernel, CellPos, CellWriter, KernelFault, KernelInputs};

/// Dense layer, `out = bias + input . weight_row`.
///
/// ```text
/// linearInput   (B, T)  (n_in)
/// linearWeight  (n_out) (n_in)   PyTorch [out, in] layout, unchanged
/// linearBias    (n_out) (1)      optional
/// linearOutput  (B, T)  (n_out)
/// ```
#[derive(Debug)]
pub struct Linear {
    pub n_in: usize,
    pub bias: bool,
}

impl CellKernel for Linear {
    fn eval(
        &self,
        pos: CellPos,
        inputs: &KernelInputs<'_>,
        out: &mut CellWriter<'_, '_>,
    ) -> Result<(), KernelFault> {
        let mut acc = if self.bias {
            inputs.fetch1(2, 0, pos.x)?
        } else {
            0.0
        };
        for i in 0..self.n_in {
            let x = inputs.fetch1(0, i, pos.y)?;
            let w = inputs.fetch1(1, i, pos.x)?;
            acc += x * w;
        }
        out.set(0, 0, acc)
    }
}
