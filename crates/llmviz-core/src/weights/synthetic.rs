use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::TensorSet;
use crate::config::GptConfig;
use crate::error::{PipelineError, Result};
use crate::tensor::TensorView;

const EMBED_SCALE: f32 = 0.5;
const WEIGHT_SCALE: f32 = 0.15;
const BIAS_SCALE: f32 = 0.05;

fn uniform(rng: &mut StdRng, shape: Vec<usize>, center: f32, scale: f32) -> Result<TensorView> {
    let n = shape.iter().product();
    let data = (0..n)
        .map(|_| center + rng.gen_range(-scale..scale))
        .collect();
    TensorView::new(shape, data)
}

/// Lower-triangular `[1, 1, T, T]` mask, stored by minGPT alongside the weights.
fn causal_mask(t: usize) -> Result<TensorView> {
    let mut data = vec![0.0; t * t];
    for q in 0..t {
        for k in 0..=q {
            data[q * t + k] = 1.0;
        }
    }
    TensorView::new(vec![1, 1, t, t], data)
}

pub(super) fn generate(config: &GptConfig, seed: u64) -> Result<TensorSet> {
    let (n_layer, _, c) = config.dims()?;
    let (v, t) = (config.vocab_size, config.block_size);
    if c == 0 || v == 0 || t == 0 {
        return Err(PipelineError::InvalidConfig(
            "synthetic weights need non-zero n_embd, vocab_size and block_size".to_string(),
        ));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut set = TensorSet::new(config.clone());

    set.insert(
        "transformer.wte.weight",
        uniform(&mut rng, vec![v, c], 0.0, EMBED_SCALE)?,
    );
    set.insert(
        "transformer.wpe.weight",
        uniform(&mut rng, vec![t, c], 0.0, EMBED_SCALE)?,
    );

    for i in 0..n_layer {
        let p = format!("transformer.h.{i}");
        for ln in ["ln_1", "ln_2"] {
            set.insert(
                format!("{p}.{ln}.weight"),
                uniform(&mut rng, vec![c], 1.0, 0.1)?,
            );
            set.insert(
                format!("{p}.{ln}.bias"),
                uniform(&mut rng, vec![c], 0.0, BIAS_SCALE)?,
            );
        }
        set.insert(format!("{p}.attn.bias"), causal_mask(t)?);
        set.insert(
            format!("{p}.attn.c_attn.weight"),
            uniform(&mut rng, vec![3 * c, c], 0.0, WEIGHT_SCALE)?,
        );
        set.insert(
            format!("{p}.attn.c_attn.bias"),
            uniform(&mut rng, vec![3 * c], 0.0, BIAS_SCALE)?,
        );
        set.insert(
            format!("{p}.attn.c_proj.weight"),
            uniform(&mut rng, vec![c, c], 0.0, WEIGHT_SCALE)?,
        );
        set.insert(
            format!("{p}.attn.c_proj.bias"),
            uniform(&mut rng, vec![c], 0.0, BIAS_SCALE)?,
        );
        set.insert(
            format!("{p}.mlp.c_fc.weight"),
            uniform(&mut rng, vec![4 * c, c], 0.0, WEIGHT_SCALE)?,
        );
        set.insert(
            format!("{p}.mlp.c_fc.bias"),
            uniform(&mut rng, vec![4 * c], 0.0, BIAS_SCALE)?,
        );
        set.insert(
            format!("{p}.mlp.c_proj.weight"),
            uniform(&mut rng, vec![c, 4 * c], 0.0, WEIGHT_SCALE)?,
        );
        set.insert(
            format!("{p}.mlp.c_proj.bias"),
            uniform(&mut rng, vec![c], 0.0, BIAS_SCALE)?,
        );
    }

    set.insert(
        "transformer.ln_f.weight",
        uniform(&mut rng, vec![c], 1.0, 0.1)?,
    );
    set.insert(
        "transformer.ln_f.bias",
        uniform(&mut rng, vec![c], 0.0, BIAS_SCALE)?,
    );
    set.insert(
        "lm_head.weight",
        uniform(&mut rng, vec![v, c], 0.0, WEIGHT_SCALE)?,
    );

    log::debug!(
        "generated {} synthetic tensors (seed {seed}, n_layer {n_layer}, n_embd {c})",
        set.len()
    );
    Ok(set)
}
