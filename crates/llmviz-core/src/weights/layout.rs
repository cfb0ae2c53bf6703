use super::TensorSet;
use crate::config::ModelShape;
use crate::error::{PipelineError, Result};
use crate::tensor::TensorView;

/// One tensor the GPT graph consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<usize>,
    /// Optional tensors may be absent; the term they contribute is dropped.
    pub required: bool,
}

impl TensorSpec {
    fn required(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
            required: true,
        }
    }

    fn optional(name: impl Into<String>, shape: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            shape,
            required: false,
        }
    }
}

/// Every tensor the forward pass reads, with the shape implied by `shape`.
pub fn gpt_tensor_layout(shape: &ModelShape) -> Vec<TensorSpec> {
    let (c, t, v) = (shape.n_embd, shape.block_size, shape.vocab_size);
    let mut specs = vec![
        TensorSpec::required("transformer.wte.weight", vec![v, c]),
        TensorSpec::required("transformer.wpe.weight", vec![t, c]),
    ];
    for i in 0..shape.n_layer {
        let p = format!("transformer.h.{i}");
        specs.extend([
            TensorSpec::required(format!("{p}.ln_1.weight"), vec![c]),
            TensorSpec::required(format!("{p}.ln_1.bias"), vec![c]),
            TensorSpec::required(format!("{p}.attn.c_attn.weight"), vec![3 * c, c]),
            TensorSpec::required(format!("{p}.attn.c_attn.bias"), vec![3 * c]),
            TensorSpec::required(format!("{p}.attn.c_proj.weight"), vec![c, c]),
            TensorSpec::optional(format!("{p}.attn.c_proj.bias"), vec![c]),
            TensorSpec::required(format!("{p}.ln_2.weight"), vec![c]),
            TensorSpec::required(format!("{p}.ln_2.bias"), vec![c]),
            TensorSpec::required(format!("{p}.mlp.c_fc.weight"), vec![4 * c, c]),
            TensorSpec::optional(format!("{p}.mlp.c_fc.bias"), vec![4 * c]),
            TensorSpec::required(format!("{p}.mlp.c_proj.weight"), vec![c, 4 * c]),
            TensorSpec::optional(format!("{p}.mlp.c_proj.bias"), vec![c]),
        ]);
    }
    specs.extend([
        TensorSpec::required("transformer.ln_f.weight", vec![c]),
        TensorSpec::required("transformer.ln_f.bias", vec![c]),
        TensorSpec::required("lm_head.weight", vec![v, c]),
    ]);
    specs
}

impl TensorSet {
    /// Checks every tensor of the GPT layout for presence and shape.
    /// Tensors outside the layout are ignored.
    pub fn check_layout(&self, shape: &ModelShape) -> Result<()> {
        for spec in gpt_tensor_layout(shape) {
            match self.get(&spec.name) {
                Some(tensor) => check_shape(&spec.name, tensor, &spec.shape)?,
                None if spec.required => return Err(PipelineError::MissingTensor(spec.name)),
                None => log::debug!("optional tensor '{}' absent", spec.name),
            }
        }
        Ok(())
    }

    /// A required tensor with an exact shape.
    pub fn require_shaped(&self, name: &str, shape: &[usize]) -> Result<&TensorView> {
        let tensor = self.require(name)?;
        check_shape(name, tensor, shape)?;
        Ok(tensor)
    }

    /// An optional tensor; if present it must have exactly `shape`.
    pub fn optional_shaped(&self, name: &str, shape: &[usize]) -> Result<Option<&TensorView>> {
        match self.get(name) {
            Some(tensor) => {
                check_shape(name, tensor, shape)?;
                Ok(Some(tensor))
            }
            None => Ok(None),
        }
    }
}

fn check_shape(name: &str, tensor: &TensorView, expected: &[usize]) -> Result<()> {
    if tensor.shape() != expected {
        return Err(PipelineError::ShapeMismatch {
            tensor: name.to_string(),
            expected: expected.to_vec(),
            actual: tensor.shape().to_vec(),
        });
    }
    Ok(())
}
