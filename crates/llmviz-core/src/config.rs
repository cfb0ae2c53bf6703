//! Model configuration and the derived buffer shape.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Default layer-norm epsilon, matching PyTorch.
pub const DEFAULT_LAYER_NORM_EPS: f32 = 1e-5;

/// Default absolute tolerance for checkpoint validation.
pub const DEFAULT_VALIDATION_TOLERANCE: f32 = 1e-4;

/// GPT configuration as stored under the `config` key of a tensor set.
///
/// Unknown keys (dropout rates and the like) are ignored. Layer, head and
/// embedding counts may be omitted when `model_type` names a known preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GptConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(default)]
    pub n_layer: Option<usize>,
    #[serde(default)]
    pub n_head: Option<usize>,
    #[serde(default)]
    pub n_embd: Option<usize>,
    pub vocab_size: usize,
    pub block_size: usize,

    /// Batch size the reference partials were captured with.
    #[serde(default, alias = "B", skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

fn default_model_type() -> String {
    "gpt".to_string()
}

/// `(n_layer, n_head, n_embd)` for the named model presets.
fn preset(model_type: &str) -> Option<(usize, usize, usize)> {
    match model_type {
        "openai-gpt" | "gpt2" => Some((12, 12, 768)),
        "gpt2-medium" => Some((24, 16, 1024)),
        "gpt2-large" => Some((36, 20, 1280)),
        "gpt2-xl" => Some((48, 25, 1600)),
        "gopher-44m" => Some((8, 16, 512)),
        "gpt-mini" => Some((6, 6, 192)),
        "gpt-micro" => Some((4, 4, 128)),
        "gpt-nano" => Some((3, 3, 48)),
        _ => None,
    }
}

impl GptConfig {
    pub fn new(
        n_layer: usize,
        n_head: usize,
        n_embd: usize,
        vocab_size: usize,
        block_size: usize,
    ) -> Self {
        Self {
            model_type: default_model_type(),
            n_layer: Some(n_layer),
            n_head: Some(n_head),
            n_embd: Some(n_embd),
            vocab_size,
            block_size,
            batch_size: None,
        }
    }

    /// The toy sorting model: 3 layers, 3 heads, 48 channels, 3 tokens, 11 positions.
    pub fn nano_sort() -> Self {
        Self {
            model_type: "gpt-nano".to_string(),
            ..Self::new(3, 3, 48, 3, 11)
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Explicit `(n_layer, n_head, n_embd)`, falling back to the preset named
    /// by `model_type` for any that are missing.
    pub fn dims(&self) -> Result<(usize, usize, usize)> {
        let preset = preset(&self.model_type);
        let pick = |explicit: Option<usize>, from_preset: Option<usize>, key: &str| {
            explicit.or(from_preset).ok_or_else(|| {
                PipelineError::InvalidConfig(format!(
                    "'{key}' is missing and model_type '{}' is not a known preset",
                    self.model_type
                ))
            })
        };
        Ok((
            pick(self.n_layer, preset.map(|p| p.0), "n_layer")?,
            pick(self.n_head, preset.map(|p| p.1), "n_head")?,
            pick(self.n_embd, preset.map(|p| p.2), "n_embd")?,
        ))
    }
}

/// Options applied when building a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOptions {
    /// Overrides the batch size recorded in the config (default 1).
    pub batch_size: Option<usize>,
    pub layer_norm_eps: f32,
    pub validation_tolerance: f32,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            batch_size: None,
            layer_norm_eps: DEFAULT_LAYER_NORM_EPS,
            validation_tolerance: DEFAULT_VALIDATION_TOLERANCE,
        }
    }
}

impl PipelineOptions {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }
}

/// Resolved extents of one pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModelShape {
    /// B
    pub batch_size: usize,
    /// T
    pub block_size: usize,
    /// C
    pub n_embd: usize,
    /// H
    pub n_head: usize,
    /// A = C / H
    pub head_size: usize,
    /// L
    pub n_layer: usize,
    /// V
    pub vocab_size: usize,
}

impl ModelShape {
    pub fn new(config: &GptConfig, batch_size: usize) -> Result<Self> {
        let (n_layer, n_head, n_embd) = config.dims()?;

        let extents = [
            ("batch_size", batch_size),
            ("block_size", config.block_size),
            ("n_embd", n_embd),
            ("n_head", n_head),
            ("n_layer", n_layer),
            ("vocab_size", config.vocab_size),
        ];
        if let Some((key, _)) = extents.iter().find(|(_, v)| *v == 0) {
            return Err(PipelineError::InvalidConfig(format!("{key} must be non-zero")));
        }
        if n_embd % n_head != 0 {
            return Err(PipelineError::InvalidConfig(format!(
                "n_embd ({n_embd}) is not divisible by n_head ({n_head})"
            )));
        }

        Ok(Self {
            batch_size,
            block_size: config.block_size,
            n_embd,
            n_head,
            head_size: n_embd / n_head,
            n_layer,
            vocab_size: config.vocab_size,
        })
    }

    /// Resolves the batch size from options, then config, then 1.
    pub fn from_options(config: &GptConfig, options: &PipelineOptions) -> Result<Self> {
        let batch_size = options.batch_size.or(config.batch_size).unwrap_or(1);
        Self::new(config, batch_size)
    }

    /// B * T: rows of the folded `(batch, time)` layout.
    pub fn rows(&self) -> usize {
        self.batch_size * self.block_size
    }

    /// B * H * T: rows of the folded `(batch, head, time)` layout.
    pub fn head_rows(&self) -> usize {
        self.batch_size * self.n_head * self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NANO_CONFIG_JSON: &str = r#"{
        "model_type": "gpt-nano",
        "n_layer": 3,
        "n_head": 3,
        "n_embd": 48,
        "vocab_size": 3,
        "block_size": 11,
        "embd_pdrop": 0.1,
        "resid_pdrop": 0.1,
        "attn_pdrop": 0.1,
        "B": 3
    }"#;

    #[test]
    fn test_parse_ignores_unknown_keys() {
        let config = GptConfig::from_json(NANO_CONFIG_JSON).unwrap();
        assert_eq!(config.model_type, "gpt-nano");
        assert_eq!(config.dims().unwrap(), (3, 3, 48));
        assert_eq!(config.vocab_size, 3);
        assert_eq!(config.block_size, 11);
        assert_eq!(config.batch_size, Some(3));
    }

    #[test]
    fn test_batch_size_key_alias() {
        let json = r#"{"n_layer":1,"n_head":2,"n_embd":8,"vocab_size":5,"block_size":4,"batch_size":2}"#;
        let config = GptConfig::from_json(json).unwrap();
        assert_eq!(config.batch_size, Some(2));
    }

    #[test]
    fn test_preset_fills_missing_dims() {
        let json = r#"{"model_type":"gpt-micro","n_layer":null,"vocab_size":10,"block_size":8}"#;
        let config = GptConfig::from_json(json).unwrap();
        assert_eq!(config.dims().unwrap(), (4, 4, 128));
    }

    #[test]
    fn test_unknown_preset_without_dims() {
        let json = r#"{"model_type":"mystery","vocab_size":10,"block_size":8}"#;
        let config = GptConfig::from_json(json).unwrap();
        assert!(matches!(config.dims(), Err(PipelineError::InvalidConfig(_))));
    }

    #[test]
    fn test_model_shape() {
        let shape = ModelShape::new(&GptConfig::nano_sort(), 2).unwrap();
        assert_eq!(shape.head_size, 16);
        assert_eq!(shape.rows(), 22);
        assert_eq!(shape.head_rows(), 66);
    }

    #[test]
    fn test_model_shape_rejects_indivisible_heads() {
        let config = GptConfig::new(1, 5, 48, 3, 11);
        let err = ModelShape::new(&config, 1).unwrap_err();
        assert!(err.to_string().contains("not divisible"));
    }

    #[test]
    fn test_model_shape_rejects_zero_extent() {
        let config = GptConfig::new(1, 1, 8, 0, 11);
        assert!(matches!(
            ModelShape::new(&config, 1),
            Err(PipelineError::InvalidConfig(_))
        ));
        assert!(ModelShape::new(&GptConfig::nano_sort(), 0).is_err());
    }

    #[test]
    fn test_batch_size_resolution() {
        let mut config = GptConfig::nano_sort();
        config.batch_size = Some(3);

        let shape = ModelShape::from_options(&config, &PipelineOptions::default()).unwrap();
        assert_eq!(shape.batch_size, 3);

        let options = PipelineOptions::default().with_batch_size(1);
        let shape = ModelShape::from_options(&config, &options).unwrap();
        assert_eq!(shape.batch_size, 1);

        config.batch_size = None;
        let shape = ModelShape::from_options(&config, &PipelineOptions::default()).unwrap();
        assert_eq!(shape.batch_size, 1);
    }
}
