use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::CellKernel;
use crate::error::{PipelineError, Result};
use crate::ops;

/// Kernel definition: the kind of per-cell program plus the constants baked into it.
///
/// Two equal definitions compile to interchangeable programs, which is what the
/// [`KernelRegistry`](super::KernelRegistry) relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KernelSource {
    /// Table lookup: output row = table row at the integer index.
    Embed { n_rows: usize },
    Add,
    /// Welford mean and inverse standard deviation over `n` features.
    NormAgg { n: usize, eps_bits: u32 },
    NormApply,
    Linear { n_in: usize, bias: bool },
    Qkv {
        t: usize,
        n_head: usize,
        head_size: usize,
        n_embd: usize,
    },
    SelfAttend { t: usize, head_size: usize },
    AttnAgg { t: usize },
    AttnSoftmax { t: usize },
    ScaledVectors {
        t: usize,
        n_head: usize,
        head_size: usize,
    },
    Gelu,
    SoftmaxAgg { n: usize },
    Softmax,
    ArgmaxCopy { t: usize, vocab: usize },
}

impl KernelSource {
    pub fn norm_agg(n: usize, eps: f32) -> Self {
        KernelSource::NormAgg {
            n,
            eps_bits: eps.to_bits(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            KernelSource::Embed { .. } => "embed",
            KernelSource::Add => "add",
            KernelSource::NormAgg { .. } => "normAgg",
            KernelSource::NormApply => "normApply",
            KernelSource::Linear { .. } => "linear",
            KernelSource::Qkv { .. } => "qkv",
            KernelSource::SelfAttend { .. } => "selfAttend",
            KernelSource::AttnAgg { .. } => "attnMatrixAgg",
            KernelSource::AttnSoftmax { .. } => "attnMatrixSoftmax",
            KernelSource::ScaledVectors { .. } => "scaledVectors",
            KernelSource::Gelu => "mlpGelu",
            KernelSource::SoftmaxAgg { .. } => "softmaxAgg",
            KernelSource::Softmax => "softmax",
            KernelSource::ArgmaxCopy { .. } => "copy",
        }
    }

    /// Declared input names, in binding order.
    pub fn input_names(&self) -> Vec<&'static str> {
        match self {
            KernelSource::Embed { .. } => vec!["embedInput", "embedWeight"],
            KernelSource::Add => vec!["inputA", "inputB"],
            KernelSource::NormAgg { .. } => vec!["normInput"],
            KernelSource::NormApply => vec!["normInput", "normAgg", "normWeight", "normBias"],
            KernelSource::Linear { bias: true, .. } => {
                vec!["linearInput", "linearWeight", "linearBias"]
            }
            KernelSource::Linear { bias: false, .. } => vec!["linearInput", "linearWeight"],
            KernelSource::Qkv { .. } => vec!["attnInput", "qkvWeight", "qkvBias"],
            KernelSource::SelfAttend { .. } => vec!["qkvOutput"],
            KernelSource::AttnAgg { .. } => vec!["attnMatrix"],
            KernelSource::AttnSoftmax { .. } => vec!["attnMatrix", "attnMatrixAgg"],
            KernelSource::ScaledVectors { .. } => vec!["qkvOutput", "attnMatrixSoftmax"],
            KernelSource::Gelu => vec!["geluInput"],
            KernelSource::SoftmaxAgg { .. } => vec!["smInput"],
            KernelSource::Softmax => vec!["smInput", "smAgg"],
            KernelSource::ArgmaxCopy { .. } => vec!["prevOutput", "currInput"],
        }
    }

    /// Declared integer uniforms, in slot order.
    pub fn uniform_names(&self) -> &'static [&'static str] {
        match self {
            KernelSource::ArgmaxCopy { .. } => &["targetTIdx"],
            _ => &[],
        }
    }

    /// Channels written per destination cell, one entry per destination.
    pub fn output_channels(&self) -> &'static [usize] {
        match self {
            KernelSource::NormAgg { .. }
            | KernelSource::AttnAgg { .. }
            | KernelSource::SoftmaxAgg { .. } => &[2],
            KernelSource::Qkv { .. } => &[3],
            _ => &[1],
        }
    }

    fn constants(&self) -> Vec<(&'static str, usize)> {
        match *self {
            KernelSource::Embed { n_rows } => vec![("n_rows", n_rows)],
            KernelSource::NormAgg { n, .. } => vec![("n", n)],
            KernelSource::Linear { n_in, .. } => vec![("n_in", n_in)],
            KernelSource::Qkv {
                t,
                n_head,
                head_size,
                n_embd,
            } => vec![
                ("t", t),
                ("n_head", n_head),
                ("head_size", head_size),
                ("n_embd", n_embd),
            ],
            KernelSource::SelfAttend { t, head_size } => vec![("t", t), ("head_size", head_size)],
            KernelSource::AttnAgg { t } | KernelSource::AttnSoftmax { t } => vec![("t", t)],
            KernelSource::ScaledVectors {
                t,
                n_head,
                head_size,
            } => vec![("t", t), ("n_head", n_head), ("head_size", head_size)],
            KernelSource::SoftmaxAgg { n } => vec![("n", n)],
            KernelSource::ArgmaxCopy { t, vocab } => vec![("t", t), ("vocab", vocab)],
            KernelSource::Add
            | KernelSource::NormApply
            | KernelSource::Gelu
            | KernelSource::Softmax => Vec::new(),
        }
    }

    /// Human-readable listing of the definition, attached to compile errors.
    pub fn source_text(&self) -> String {
        let mut text = format!(
            "kernel {}({}) -> [{}]",
            self.name(),
            self.input_names().join(", "),
            self.output_channels()
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        for uniform in self.uniform_names() {
            text.push_str(&format!("\n  uniform int {uniform};"));
        }
        for (name, value) in self.constants() {
            text.push_str(&format!("\n  const int {name} = {value};"));
        }
        if let KernelSource::NormAgg { eps_bits, .. } = self {
            text.push_str(&format!("\n  const float eps = {:e};", f32::from_bits(*eps_bits)));
        }
        text
    }

    /// Stable content hash of the definition.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn compile_error(&self, log: String) -> PipelineError {
        PipelineError::KernelCompile {
            kernel: self.name().to_string(),
            source_text: self.source_text(),
            log,
        }
    }

    /// Validates the baked constants and builds the program.
    pub fn compile(&self) -> Result<KernelProgram> {
        if let Some((name, _)) = self.constants().into_iter().find(|(_, v)| *v == 0) {
            return Err(self.compile_error(format!("error: constant '{name}' must be non-zero")));
        }

        let kernel: Arc<dyn CellKernel> = match *self {
            KernelSource::Embed { n_rows } => Arc::new(ops::Embed { n_rows }),
            KernelSource::Add => Arc::new(ops::Add),
            KernelSource::NormAgg { n, eps_bits } => {
                let eps = f32::from_bits(eps_bits);
                if !eps.is_finite() || eps < 0.0 {
                    return Err(self.compile_error(format!(
                        "error: eps must be finite and non-negative, got {eps}"
                    )));
                }
                Arc::new(ops::NormAgg { n, eps })
            }
            KernelSource::NormApply => Arc::new(ops::NormApply),
            KernelSource::Linear { n_in, bias } => Arc::new(ops::Linear { n_in, bias }),
            KernelSource::Qkv {
                t,
                n_head,
                head_size,
                n_embd,
            } => Arc::new(ops::Qkv {
                t,
                n_head,
                head_size,
                n_embd,
            }),
            KernelSource::SelfAttend { t, head_size } => {
                Arc::new(ops::SelfAttend { t, head_size })
            }
            KernelSource::AttnAgg { t } => Arc::new(ops::AttnAgg { t }),
            KernelSource::AttnSoftmax { t } => Arc::new(ops::AttnSoftmax { t }),
            KernelSource::ScaledVectors {
                t,
                n_head,
                head_size,
            } => Arc::new(ops::ScaledVectors {
                t,
                n_head,
                head_size,
            }),
            KernelSource::Gelu => Arc::new(ops::Gelu),
            KernelSource::SoftmaxAgg { n } => Arc::new(ops::SoftmaxAgg { n }),
            KernelSource::Softmax => Arc::new(ops::Softmax),
            KernelSource::ArgmaxCopy { t, vocab } => Arc::new(ops::ArgmaxCopy { t, vocab }),
        };

        Ok(KernelProgram {
            source: self.clone(),
            kernel,
        })
    }
}

impl fmt::Display for KernelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A compiled kernel with its declared interface.
#[derive(Debug)]
pub struct KernelProgram {
    source: KernelSource,
    kernel: Arc<dyn CellKernel>,
}

impl KernelProgram {
    pub fn source(&self) -> &KernelSource {
        &self.source
    }

    pub fn name(&self) -> &'static str {
        self.source.name()
    }

    pub fn kernel(&self) -> &dyn CellKernel {
        self.kernel.as_ref()
    }

    pub fn input_names(&self) -> Vec<&'static str> {
        self.source.input_names()
    }

    pub fn uniform_names(&self) -> &'static [&'static str] {
        self.source.uniform_names()
    }

    pub fn output_channels(&self) -> &'static [usize] {
        self.source.output_channels()
    }
}
