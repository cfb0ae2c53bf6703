use crate::activations::gelu_tanh;
use crate::kernel::{CellKernel, CellPos, CellWriter, KernelFault, KernelInputs};

/// `inputA + inputB`, cell by cell.
#[derive(Debug)]
pub struct Add;

impl CellKernel for Add {
    fn eval(
        &self,
        pos: CellPos,
        inputs: &KernelInputs<'_>,
        out: &mut CellWriter<'_, '_>,
    ) -> Result<(), KernelFault> {
        let a = inputs.fetch1(0, pos.x, pos.y)?;
        let b = inputs.fetch1(1, pos.x, pos.y)?;
        out.set(0, 0, a + b)
    }
}

/// Tanh-approximated GELU, cell by cell.
#[derive(Debug)]
pub struct Gelu;

impl CellKernel for Gelu {
    fn eval(
        &self,
        pos: CellPos,
        inputs: &KernelInputs<'_>,
        out: &mut CellWriter<'_, '_>,
    ) -> Result<(), KernelFault> {
        let x = inputs.fetch1(0, pos.x, pos.y)?;
        out.set(0, 0, gelu_tanh(x))
    }
}
