//! The GPT forward pass as an ordered list of bound phases.
//!
//! [`GptPipeline::build`] validates the weight set against the configuration,
//! stages the weights, allocates every activation buffer under a stable name
//! and binds the phases in execution order:
//!
//! ```text
//! wte, wpe -> embed
//! block i:  ln1 -> qkv -> selfAttend -> agg -> softmax -> scaled -> proj -> + residual
//!           ln2 -> fc -> gelu -> proj -> + residual
//! ln_f -> lm_head -> softmax
//! ```
//!
//! The loop-back phase is built alongside but kept out of the forward pass.

mod builder;

use std::collections::HashMap;

use crate::compute::{BufferResource, ComputeContext};
use crate::config::{ModelShape, PipelineOptions};
use crate::error::{PipelineError, Result};
use crate::kernel::{KernelRegistry, Phase};
use crate::weights::TensorSet;

use builder::LayerBuilder;

pub const INPUT_TOKENS: &str = "input.tokens";
pub const INPUT_POSITIONS: &str = "input.positions";
pub const EMBED_OUTPUT: &str = "embed.output";
pub const LOGITS: &str = "lm_head.output";
pub const PROBABILITIES: &str = "softmax.output";
pub const NEXT_TOKENS: &str = "loop.next_tokens";

/// A built forward pass: buffers by name plus phases in execution order.
pub struct GptPipeline {
    context: ComputeContext,
    shape: ModelShape,
    options: PipelineOptions,
    registry: KernelRegistry,
    buffers: HashMap<String, BufferResource>,
    buffer_order: Vec<String>,
    phases: Vec<Phase>,
    copy_phase: Phase,
}

impl std::fmt::Debug for GptPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GptPipeline")
            .field("shape", &self.shape)
            .field("buffers", &self.buffer_order.len())
            .field("phases", &self.phases.len())
            .finish_non_exhaustive()
    }
}

impl GptPipeline {
    /// Builds the pipeline for `weights` on `context`.
    ///
    /// Configuration and weight shapes are checked before anything is
    /// allocated on the device.
    pub fn build(
        context: &ComputeContext,
        weights: &TensorSet,
        options: &PipelineOptions,
    ) -> Result<Self> {
        let shape = ModelShape::from_options(weights.config(), options)?;
        weights.check_layout(&shape)?;
        log::info!(
            "building pipeline: B={} T={} C={} H={} L={} V={}",
            shape.batch_size,
            shape.block_size,
            shape.n_embd,
            shape.n_head,
            shape.n_layer,
            shape.vocab_size
        );

        let mut b = LayerBuilder::new(context, shape, options.layer_norm_eps);
        let rows = shape.rows();

        let tokens = b.alloc(INPUT_TOKENS, 1, rows, 1)?;
        let positions = b.alloc(INPUT_POSITIONS, 1, rows, 1)?;
        let position_ids: Vec<f32> = (0..rows).map(|i| (i % shape.block_size) as f32).collect();
        positions.write(&position_ids)?;

        let c = shape.n_embd;
        let wte = b.stage(
            "transformer.wte.weight",
            weights.require("transformer.wte.weight")?,
            c,
            shape.vocab_size,
            1,
        )?;
        let wpe = b.stage(
            "transformer.wpe.weight",
            weights.require("transformer.wpe.weight")?,
            c,
            shape.block_size,
            1,
        )?;
        let blocks = (0..shape.n_layer)
            .map(|i| b.stage_block(weights, i))
            .collect::<Result<Vec<_>>>()?;
        let ln_f = b.stage_layer_norm(weights, "transformer.ln_f")?;
        let lm_head = b.stage_linear(weights, "lm_head", false)?;

        let tok_emb = b.create_embedding_layer("wte.output", &tokens, &wte)?;
        let pos_emb = b.create_embedding_layer("wpe.output", &positions, &wpe)?;
        let mut x = b.create_add_layer(EMBED_OUTPUT, &tok_emb, &pos_emb)?;

        for (i, block) in blocks.iter().enumerate() {
            x = b.create_block_layer(i, &x, block)?;
        }

        let ln_f = b.create_layer_norm("ln_f", &x, &ln_f)?;
        let logits = b.create_linear_layer(LOGITS, &ln_f, &lm_head)?;
        let probs = b.create_softmax_layer("softmax", &logits)?;
        let copy_phase = b.create_copy_output_to_input_layer(NEXT_TOKENS, &probs, &tokens)?;

        let graph = b.finish();
        log::info!(
            "pipeline built: {} buffers, {} phases, {} kernel programs",
            graph.order.len(),
            graph.phases.len(),
            graph.registry.len()
        );

        Ok(Self {
            context: context.clone(),
            shape,
            options: options.clone(),
            registry: graph.registry,
            buffers: graph.buffers,
            buffer_order: graph.order,
            phases: graph.phases,
            copy_phase,
        })
    }

    pub fn context(&self) -> &ComputeContext {
        &self.context
    }

    pub fn shape(&self) -> &ModelShape {
        &self.shape
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn registry(&self) -> &KernelRegistry {
        &self.registry
    }

    /// Looks up a buffer by its stable name.
    pub fn buffer(&self, name: &str) -> Result<&BufferResource> {
        self.buffers
            .get(name)
            .ok_or_else(|| PipelineError::UnknownBuffer(name.to_string()))
    }

    /// Buffer names in allocation order.
    pub fn buffer_names(&self) -> impl Iterator<Item = &str> {
        self.buffer_order.iter().map(String::as_str)
    }

    /// Forward-pass phases in execution order.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    pub fn copy_phase(&self) -> &Phase {
        &self.copy_phase
    }

    pub(crate) fn copy_phase_mut(&mut self) -> &mut Phase {
        &mut self.copy_phase
    }

    pub fn tokens(&self) -> Result<&BufferResource> {
        self.buffer(INPUT_TOKENS)
    }
}

#[cfg(test)]
mod tests;
