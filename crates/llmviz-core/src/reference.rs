//! CPU reference forward pass on `ndarray`.
//!
//! Computes the same model as the device pipeline, but straightforwardly, in
//! the minGPT formulation, and records the intermediate checkpoints under the
//! names used by the reference partials files (`x`, `ln1`, `attSm`, `y`, ...).
//! Block-internal checkpoints are recorded for block 0 only.

use ndarray::{s, Array1, Array2, Array4, ArrayView2, Ix1, Ix2};

use crate::activations::{gelu_tanh, softmax_stats};
use crate::config::{GptConfig, ModelShape, PipelineOptions};
use crate::error::{PipelineError, Result};
use crate::tensor::TensorView;
use crate::weights::TensorSet;

struct LayerNormParams {
    weight: Array1<f32>,
    bias: Array1<f32>,
}

/// PyTorch layout: `weight` is `[out, in]`.
struct LinearParams {
    weight: Array2<f32>,
    bias: Option<Array1<f32>>,
}

impl LinearParams {
    fn forward(&self, input: &Array2<f32>) -> Array2<f32> {
        let mut out = input.dot(&self.weight.t());
        if let Some(bias) = &self.bias {
            out += bias;
        }
        out
    }
}

struct ReferenceBlock {
    ln_1: LayerNormParams,
    c_attn: LinearParams,
    attn_proj: LinearParams,
    ln_2: LayerNormParams,
    c_fc: LinearParams,
    mlp_proj: LinearParams,
}

/// Straightforward GPT forward pass used to validate the device pipeline.
pub struct ReferenceModel {
    config: GptConfig,
    shape: ModelShape,
    eps: f32,
    wte: Array2<f32>,
    wpe: Array2<f32>,
    blocks: Vec<ReferenceBlock>,
    ln_f: LayerNormParams,
    lm_head: LinearParams,
}

fn matrix(tensor: &TensorView) -> Result<Array2<f32>> {
    tensor
        .to_ndarray()?
        .into_dimensionality::<Ix2>()
        .map_err(|e| PipelineError::InvalidShape {
            shape: tensor.shape().to_vec(),
            reason: e.to_string(),
        })
}

fn vector(tensor: &TensorView) -> Result<Array1<f32>> {
    tensor
        .to_ndarray()?
        .into_dimensionality::<Ix1>()
        .map_err(|e| PipelineError::InvalidShape {
            shape: tensor.shape().to_vec(),
            reason: e.to_string(),
        })
}

fn layer_norm_params(set: &TensorSet, prefix: &str, c: usize) -> Result<LayerNormParams> {
    Ok(LayerNormParams {
        weight: vector(set.require_shaped(&format!("{prefix}.weight"), &[c])?)?,
        bias: vector(set.require_shaped(&format!("{prefix}.bias"), &[c])?)?,
    })
}

fn linear_params(
    set: &TensorSet,
    prefix: &str,
    n_in: usize,
    n_out: usize,
    bias_required: bool,
) -> Result<LinearParams> {
    let weight = matrix(set.require_shaped(&format!("{prefix}.weight"), &[n_out, n_in])?)?;
    let bias_name = format!("{prefix}.bias");
    let bias = if bias_required {
        Some(set.require_shaped(&bias_name, &[n_out])?)
    } else {
        set.optional_shaped(&bias_name, &[n_out])?
    };
    Ok(LinearParams {
        weight,
        bias: bias.map(vector).transpose()?,
    })
}

impl ReferenceModel {
    pub fn new(set: &TensorSet, options: &PipelineOptions) -> Result<Self> {
        let shape = ModelShape::from_options(set.config(), options)?;
        set.check_layout(&shape)?;
        let (c, t, v) = (shape.n_embd, shape.block_size, shape.vocab_size);

        let blocks = (0..shape.n_layer)
            .map(|i| {
                let p = format!("transformer.h.{i}");
                Ok(ReferenceBlock {
                    ln_1: layer_norm_params(set, &format!("{p}.ln_1"), c)?,
                    c_attn: linear_params(set, &format!("{p}.attn.c_attn"), c, 3 * c, true)?,
                    attn_proj: linear_params(set, &format!("{p}.attn.c_proj"), c, c, false)?,
                    ln_2: layer_norm_params(set, &format!("{p}.ln_2"), c)?,
                    c_fc: linear_params(set, &format!("{p}.mlp.c_fc"), c, 4 * c, false)?,
                    mlp_proj: linear_params(set, &format!("{p}.mlp.c_proj"), 4 * c, c, false)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            config: set.config().clone(),
            shape,
            eps: options.layer_norm_eps,
            wte: matrix(set.require_shaped("transformer.wte.weight", &[v, c])?)?,
            wpe: matrix(set.require_shaped("transformer.wpe.weight", &[t, c])?)?,
            blocks,
            ln_f: layer_norm_params(set, "transformer.ln_f", c)?,
            lm_head: LinearParams {
                weight: matrix(set.require_shaped("lm_head.weight", &[v, c])?)?,
                bias: None,
            },
        })
    }

    pub fn shape(&self) -> &ModelShape {
        &self.shape
    }

    /// Runs the model on `B * T` tokens and returns the named checkpoints.
    ///
    /// The returned set carries the model config with `batch_size` filled in,
    /// so it can be saved as a partials file.
    pub fn forward(&self, tokens: &[u32]) -> Result<TensorSet> {
        let s = self.shape;
        let (b, t, c, v) = (s.batch_size, s.block_size, s.n_embd, s.vocab_size);
        if tokens.len() != s.rows() {
            return Err(PipelineError::SizeMismatch {
                label: "tokens".to_string(),
                expected: s.rows(),
                actual: tokens.len(),
            });
        }
        if let Some(&bad) = tokens.iter().find(|&&tok| tok as usize >= v) {
            return Err(PipelineError::Bounds {
                index: vec![bad as usize],
                shape: vec![v],
            });
        }

        let mut config = self.config.clone();
        config.batch_size = Some(b);
        let mut out = TensorSet::new(config);
        let mut record = |name: &str, dims: Vec<usize>, data: Vec<f32>| -> Result<()> {
            out.insert(name, TensorView::new(dims, data)?);
            Ok(())
        };
        let bt = |cols: usize| vec![b, t, cols];

        record(
            "idx",
            vec![b, t],
            tokens.iter().map(|&tok| tok as f32).collect(),
        )?;

        let mut tok_emb = Array2::<f32>::zeros((s.rows(), c));
        let mut x = Array2::<f32>::zeros((s.rows(), c));
        for (row, &tok) in tokens.iter().enumerate() {
            tok_emb.row_mut(row).assign(&self.wte.row(tok as usize));
            x.row_mut(row)
                .assign(&(&self.wte.row(tok as usize) + &self.wpe.row(row % t)));
        }
        record("tok_emb", bt(c), flat(&tok_emb))?;
        record("x", bt(c), flat(&x))?;

        for (i, block) in self.blocks.iter().enumerate() {
            let ln1 = self.layer_norm(&x, &block.ln_1);
            let qkv = block.c_attn.forward(&ln1);
            let (att, y) = self.attention(&qkv);
            let y_proj = block.attn_proj.forward(&y);
            let attn_resid = &x + &y_proj;

            let ln2 = self.layer_norm(&attn_resid, &block.ln_2);
            let fc = block.c_fc.forward(&ln2);
            let gelu = fc.mapv(gelu_tanh);
            let mlp = block.mlp_proj.forward(&gelu);
            let mlp_resid = &attn_resid + &mlp;

            if i == 0 {
                record("ln1", bt(c), flat(&ln1))?;
                record(
                    "attSm",
                    vec![b, s.n_head, t, t],
                    att.iter().copied().collect(),
                )?;
                record("y", bt(c), flat(&y))?;
                record("yProj", bt(c), flat(&y_proj))?;
                record("attnResid", bt(c), flat(&attn_resid))?;
                record("ln2", bt(c), flat(&ln2))?;
                record("fc", bt(4 * c), flat(&fc))?;
                record("gelu", bt(4 * c), flat(&gelu))?;
                record("mlp", bt(c), flat(&mlp))?;
                record("mlpResid", bt(c), flat(&mlp_resid))?;
            }
            record(&format!("block{i}"), bt(c), flat(&mlp_resid))?;
            x = mlp_resid;
        }

        let ln_f = self.layer_norm(&x, &self.ln_f);
        let logits = self.lm_head.forward(&ln_f);
        let mut probs = logits.clone();
        for mut row in probs.rows_mut() {
            let (inv_sum, max) = softmax_stats(&row.to_vec());
            row.mapv_inplace(|p| (p - max).exp() * inv_sum);
        }

        record("ln_f", bt(c), flat(&ln_f))?;
        record("lm_head", bt(v), flat(&logits))?;
        record("probs", bt(v), flat(&probs))?;
        Ok(out)
    }

    fn layer_norm(&self, x: &Array2<f32>, params: &LayerNormParams) -> Array2<f32> {
        let mut out = x.clone();
        for mut row in out.rows_mut() {
            let n = row.len() as f32;
            let mean = row.sum() / n;
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
            let inv_std = 1.0 / (var + self.eps).sqrt();
            for ((v, w), b) in row.iter_mut().zip(&params.weight).zip(&params.bias) {
                *v = (*v - mean) * inv_std * w + b;
            }
        }
        out
    }

    /// Causal attention over packed `[q | k | v]` rows. Returns the attention
    /// probabilities `[B, H, T, T]` (0 above the diagonal) and the head-major
    /// weighted values `[B * T, C]`.
    fn attention(&self, qkv: &Array2<f32>) -> (Array4<f32>, Array2<f32>) {
        let s = &self.shape;
        let (t, c, a) = (s.block_size, s.n_embd, s.head_size);
        let scale = (a as f32).sqrt();

        let mut att = Array4::<f32>::zeros((s.batch_size, s.n_head, t, t));
        let mut y = Array2::<f32>::zeros((s.rows(), c));
        for b in 0..s.batch_size {
            let rows = b * t..(b + 1) * t;
            for h in 0..s.n_head {
                let cols = h * a..(h + 1) * a;
                let q: ArrayView2<f32> = qkv.slice(s![rows.clone(), cols.clone()]);
                let k = qkv.slice(s![rows.clone(), c + cols.start..c + cols.end]);
                let v = qkv.slice(s![rows.clone(), 2 * c + cols.start..2 * c + cols.end]);

                for tq in 0..t {
                    let scores: Vec<f32> =
                        (0..=tq).map(|tk| q.row(tq).dot(&k.row(tk)) / scale).collect();
                    let (inv_sum, max) = softmax_stats(&scores);

                    let mut out_row = y.slice_mut(s![b * t + tq, cols.clone()]);
                    for (tk, score) in scores.iter().enumerate() {
                        let p = (score - max).exp() * inv_sum;
                        att[[b, h, tq, tk]] = p;
                        out_row.scaled_add(p, &v.row(tk));
                    }
                }
            }
        }
        (att, y)
    }
}

fn flat(array: &Array2<f32>) -> Vec<f32> {
    array.iter().copied().collect()
}
