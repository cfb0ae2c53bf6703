//! Layer assembly.
//!
//! Each `create_*` method allocates the buffers of one layer, binds its phases
//! and appends them to the phase list in execution order. The returned buffer
//! is the layer's output.

use std::collections::HashMap;
use std::sync::Arc;

use crate::compute::{BufferResource, ComputeContext};
use crate::config::ModelShape;
use crate::error::{PipelineError, Result};
use crate::kernel::{KernelProgram, KernelRegistry, KernelSource, Phase};
use crate::tensor::TensorView;
use crate::weights::TensorSet;

/// Staged parameters of one linear layer.
pub(crate) struct LinearWeights {
    pub weight: BufferResource,
    pub bias: Option<BufferResource>,
}

pub(crate) struct LayerNormWeights {
    pub weight: BufferResource,
    pub bias: BufferResource,
}

pub(crate) struct BlockWeights {
    pub ln_1: LayerNormWeights,
    pub qkv_weight: BufferResource,
    pub qkv_bias: BufferResource,
    pub attn_proj: LinearWeights,
    pub ln_2: LayerNormWeights,
    pub fc: LinearWeights,
    pub mlp_proj: LinearWeights,
}

pub(crate) struct LayerBuilder<'a> {
    context: &'a ComputeContext,
    shape: ModelShape,
    eps: f32,
    registry: KernelRegistry,
    buffers: HashMap<String, BufferResource>,
    order: Vec<String>,
    phases: Vec<Phase>,
}

/// What the builder hands back once the graph is complete.
pub(crate) struct BuiltGraph {
    pub registry: KernelRegistry,
    pub buffers: HashMap<String, BufferResource>,
    pub order: Vec<String>,
    pub phases: Vec<Phase>,
}

impl<'a> LayerBuilder<'a> {
    pub fn new(context: &'a ComputeContext, shape: ModelShape, eps: f32) -> Self {
        Self {
            context,
            shape,
            eps,
            registry: KernelRegistry::new(),
            buffers: HashMap::new(),
            order: Vec::new(),
            phases: Vec::new(),
        }
    }

    pub fn finish(self) -> BuiltGraph {
        BuiltGraph {
            registry: self.registry,
            buffers: self.buffers,
            order: self.order,
            phases: self.phases,
        }
    }

    pub fn alloc(
        &mut self,
        name: &str,
        width: usize,
        height: usize,
        channels: usize,
    ) -> Result<BufferResource> {
        if self.buffers.contains_key(name) {
            return Err(PipelineError::InvalidConfig(format!(
                "buffer '{name}' allocated twice"
            )));
        }
        let buffer = BufferResource::allocate(self.context, width, height, channels, name)?;
        self.buffers.insert(name.to_string(), buffer.clone());
        self.order.push(name.to_string());
        Ok(buffer)
    }

    /// Allocates a buffer and uploads `tensor` into it in dense row-major order.
    pub fn stage(
        &mut self,
        name: &str,
        tensor: &TensorView,
        width: usize,
        height: usize,
        channels: usize,
    ) -> Result<BufferResource> {
        let buffer = self.alloc(name, width, height, channels)?;
        buffer.write(&tensor.to_dense_vec())?;
        Ok(buffer)
    }

    pub fn program(&mut self, source: &KernelSource) -> Result<Arc<KernelProgram>> {
        self.registry.get_or_compile(source)
    }

    fn push_phase(
        &mut self,
        label: &str,
        source: KernelSource,
        dests: Vec<BufferResource>,
        sources: Vec<BufferResource>,
        names: &[&str],
    ) -> Result<()> {
        let program = self.program(&source)?;
        self.phases
            .push(Phase::new(label, program, dests, sources, names)?);
        Ok(())
    }

    // Weight staging.

    pub fn stage_layer_norm(&mut self, set: &TensorSet, prefix: &str) -> Result<LayerNormWeights> {
        let c = self.shape.n_embd;
        let weight_name = format!("{prefix}.weight");
        let bias_name = format!("{prefix}.bias");
        Ok(LayerNormWeights {
            weight: self.stage(&weight_name, set.require(&weight_name)?, 1, c, 1)?,
            bias: self.stage(&bias_name, set.require(&bias_name)?, 1, c, 1)?,
        })
    }

    /// `[out, in]` weight as an `in x out` grid, bias as `1 x out`.
    pub fn stage_linear(
        &mut self,
        set: &TensorSet,
        prefix: &str,
        with_bias: bool,
    ) -> Result<LinearWeights> {
        let weight_name = format!("{prefix}.weight");
        let tensor = set.require(&weight_name)?;
        let (n_out, n_in) = match tensor.shape() {
            &[n_out, n_in] => (n_out, n_in),
            other => {
                return Err(PipelineError::InvalidShape {
                    shape: other.to_vec(),
                    reason: format!("'{weight_name}' must be rank 2"),
                })
            }
        };
        let weight = self.stage(&weight_name, tensor, n_in, n_out, 1)?;

        let bias_name = format!("{prefix}.bias");
        let bias = match set.get(&bias_name) {
            Some(tensor) if with_bias => Some(self.stage(&bias_name, tensor, 1, n_out, 1)?),
            _ => None,
        };
        Ok(LinearWeights { weight, bias })
    }

    /// `c_attn` weight `[3C, C]` viewed `[3, H, A, C]` and permuted so q, k and v
    /// land in the channels of one `C x HA` grid; the bias likewise as `1 x HA`.
    pub fn stage_qkv(
        &mut self,
        set: &TensorSet,
        prefix: &str,
    ) -> Result<(BufferResource, BufferResource)> {
        let s = self.shape;
        let (h, a, c) = (s.n_head, s.head_size, s.n_embd);

        let weight_name = format!("{prefix}.weight");
        let weight = set
            .require(&weight_name)?
            .contiguous()?
            .view(&[3, h, a, c])?
            .permute(&[1, 2, 3, 0])?;
        let weight = self.stage(&weight_name, &weight, c, h * a, 3)?;

        let bias_name = format!("{prefix}.bias");
        let bias = set
            .require(&bias_name)?
            .contiguous()?
            .view(&[3, h, a])?
            .permute(&[1, 2, 0])?;
        let bias = self.stage(&bias_name, &bias, 1, h * a, 3)?;

        Ok((weight, bias))
    }

    pub fn stage_block(&mut self, set: &TensorSet, i: usize) -> Result<BlockWeights> {
        let p = format!("transformer.h.{i}");
        let ln_1 = self.stage_layer_norm(set, &format!("{p}.ln_1"))?;
        let (qkv_weight, qkv_bias) = self.stage_qkv(set, &format!("{p}.attn.c_attn"))?;
        Ok(BlockWeights {
            ln_1,
            qkv_weight,
            qkv_bias,
            attn_proj: self.stage_linear(set, &format!("{p}.attn.c_proj"), true)?,
            ln_2: self.stage_layer_norm(set, &format!("{p}.ln_2"))?,
            fc: self.stage_linear(set, &format!("{p}.mlp.c_fc"), true)?,
            mlp_proj: self.stage_linear(set, &format!("{p}.mlp.c_proj"), true)?,
        })
    }

    // Layers.

    pub fn create_embedding_layer(
        &mut self,
        name: &str,
        indices: &BufferResource,
        table: &BufferResource,
    ) -> Result<BufferResource> {
        let output = self.alloc(name, table.width(), indices.height(), 1)?;
        self.push_phase(
            name,
            KernelSource::Embed {
                n_rows: table.height(),
            },
            vec![output.clone()],
            vec![indices.clone(), table.clone()],
            &["embedInput", "embedWeight"],
        )?;
        Ok(output)
    }

    pub fn create_add_layer(
        &mut self,
        name: &str,
        a: &BufferResource,
        b: &BufferResource,
    ) -> Result<BufferResource> {
        let output = self.alloc(name, a.width(), a.height(), 1)?;
        self.push_phase(
            name,
            KernelSource::Add,
            vec![output.clone()],
            vec![a.clone(), b.clone()],
            &["inputA", "inputB"],
        )?;
        Ok(output)
    }

    /// `{prefix}.agg` holds `(mean, inv_std)` per row, `{prefix}.output` the result.
    pub fn create_layer_norm(
        &mut self,
        prefix: &str,
        input: &BufferResource,
        weights: &LayerNormWeights,
    ) -> Result<BufferResource> {
        let (width, height) = (input.width(), input.height());

        let agg = self.alloc(&format!("{prefix}.agg"), 1, height, 2)?;
        self.push_phase(
            &format!("{prefix}.agg"),
            KernelSource::norm_agg(width, self.eps),
            vec![agg.clone()],
            vec![input.clone()],
            &["normInput"],
        )?;

        let output = self.alloc(&format!("{prefix}.output"), width, height, 1)?;
        self.push_phase(
            &format!("{prefix}.apply"),
            KernelSource::NormApply,
            vec![output.clone()],
            vec![
                input.clone(),
                agg,
                weights.weight.clone(),
                weights.bias.clone(),
            ],
            &["normInput", "normAgg", "normWeight", "normBias"],
        )?;
        Ok(output)
    }

    pub fn create_linear_layer(
        &mut self,
        name: &str,
        input: &BufferResource,
        weights: &LinearWeights,
    ) -> Result<BufferResource> {
        let n_out = weights.weight.height();
        let output = self.alloc(name, n_out, input.height(), 1)?;

        let mut sources = vec![input.clone(), weights.weight.clone()];
        let mut names = vec!["linearInput", "linearWeight"];
        if let Some(bias) = &weights.bias {
            sources.push(bias.clone());
            names.push("linearBias");
        }
        self.push_phase(
            name,
            KernelSource::Linear {
                n_in: input.width(),
                bias: weights.bias.is_some(),
            },
            vec![output.clone()],
            sources,
            &names,
        )?;
        Ok(output)
    }

    /// QKV projection, causal scores, two-phase softmax and the weighted value
    /// sum. Returns `{prefix}.scaled`, heads side by side.
    pub fn create_attention_layer(
        &mut self,
        prefix: &str,
        input: &BufferResource,
        qkv_weight: &BufferResource,
        qkv_bias: &BufferResource,
    ) -> Result<BufferResource> {
        let s = self.shape;
        let (t, h, a, c) = (s.block_size, s.n_head, s.head_size, s.n_embd);
        let head_rows = s.head_rows();

        let qkv = self.alloc(&format!("{prefix}.qkv"), a, head_rows, 3)?;
        self.push_phase(
            &format!("{prefix}.qkv"),
            KernelSource::Qkv {
                t,
                n_head: h,
                head_size: a,
                n_embd: c,
            },
            vec![qkv.clone()],
            vec![input.clone(), qkv_weight.clone(), qkv_bias.clone()],
            &["attnInput", "qkvWeight", "qkvBias"],
        )?;

        let scores = self.alloc(&format!("{prefix}.scores"), t, head_rows, 1)?;
        self.push_phase(
            &format!("{prefix}.selfAttend"),
            KernelSource::SelfAttend { t, head_size: a },
            vec![scores.clone()],
            vec![qkv.clone()],
            &["qkvOutput"],
        )?;

        let agg = self.alloc(&format!("{prefix}.agg"), 1, head_rows, 2)?;
        self.push_phase(
            &format!("{prefix}.agg"),
            KernelSource::AttnAgg { t },
            vec![agg.clone()],
            vec![scores.clone()],
            &["attnMatrix"],
        )?;

        let softmax = self.alloc(&format!("{prefix}.softmax"), t, head_rows, 1)?;
        self.push_phase(
            &format!("{prefix}.softmax"),
            KernelSource::AttnSoftmax { t },
            vec![softmax.clone()],
            vec![scores, agg],
            &["attnMatrix", "attnMatrixAgg"],
        )?;

        let scaled = self.alloc(&format!("{prefix}.scaled"), c, s.rows(), 1)?;
        self.push_phase(
            &format!("{prefix}.scaled"),
            KernelSource::ScaledVectors {
                t,
                n_head: h,
                head_size: a,
            },
            vec![scaled.clone()],
            vec![qkv, softmax],
            &["qkvOutput", "attnMatrixSoftmax"],
        )?;
        Ok(scaled)
    }

    /// fc, GELU, proj. Returns `{prefix}.proj`.
    pub fn create_mlp(
        &mut self,
        prefix: &str,
        input: &BufferResource,
        fc: &LinearWeights,
        proj: &LinearWeights,
    ) -> Result<BufferResource> {
        let fc_out = self.create_linear_layer(&format!("{prefix}.fc"), input, fc)?;

        let gelu = self.alloc(&format!("{prefix}.gelu"), fc_out.width(), fc_out.height(), 1)?;
        self.push_phase(
            &format!("{prefix}.gelu"),
            KernelSource::Gelu,
            vec![gelu.clone()],
            vec![fc_out],
            &["geluInput"],
        )?;

        self.create_linear_layer(&format!("{prefix}.proj"), &gelu, proj)
    }

    pub fn create_block_layer(
        &mut self,
        i: usize,
        input: &BufferResource,
        weights: &BlockWeights,
    ) -> Result<BufferResource> {
        let p = format!("block{i}");

        let ln1 = self.create_layer_norm(&format!("{p}.ln1"), input, &weights.ln_1)?;
        let scaled = self.create_attention_layer(
            &format!("{p}.attn"),
            &ln1,
            &weights.qkv_weight,
            &weights.qkv_bias,
        )?;
        let proj = self.create_linear_layer(&format!("{p}.attn.proj"), &scaled, &weights.attn_proj)?;
        let attn_out = self.create_add_layer(&format!("{p}.attn.output"), &proj, input)?;

        let ln2 = self.create_layer_norm(&format!("{p}.ln2"), &attn_out, &weights.ln_2)?;
        let mlp = self.create_mlp(&format!("{p}.mlp"), &ln2, &weights.fc, &weights.mlp_proj)?;
        self.create_add_layer(&format!("{p}.output"), &mlp, &attn_out)
    }

    /// Two-phase stable softmax over full rows.
    pub fn create_softmax_layer(
        &mut self,
        prefix: &str,
        input: &BufferResource,
    ) -> Result<BufferResource> {
        let (width, height) = (input.width(), input.height());

        let agg = self.alloc(&format!("{prefix}.agg"), 1, height, 2)?;
        self.push_phase(
            &format!("{prefix}.agg"),
            KernelSource::SoftmaxAgg { n: width },
            vec![agg.clone()],
            vec![input.clone()],
            &["smInput"],
        )?;

        let output = self.alloc(&format!("{prefix}.output"), width, height, 1)?;
        self.push_phase(
            &format!("{prefix}.apply"),
            KernelSource::Softmax,
            vec![output.clone()],
            vec![input.clone(), agg],
            &["smInput", "smAgg"],
        )?;
        Ok(output)
    }

    /// The loop-back phase. It is not part of the forward pass, so it is
    /// returned rather than appended.
    pub fn create_copy_output_to_input_layer(
        &mut self,
        name: &str,
        probs: &BufferResource,
        tokens: &BufferResource,
    ) -> Result<Phase> {
        let next = self.alloc(name, 1, tokens.height(), 1)?;
        let program = self.program(&KernelSource::ArgmaxCopy {
            t: self.shape.block_size,
            vocab: probs.width(),
        })?;
        Phase::new(
            "copy",
            program,
            vec![next],
            vec![probs.clone(), tokens.clone()],
            &["prevOutput", "currInput"],
        )
    }
}
