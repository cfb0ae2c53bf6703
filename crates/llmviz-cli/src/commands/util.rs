use std::path::Path;

use anyhow::{anyhow, Context, Result};

use llmviz_core::{ComputeContext, GptPipeline, PipelineOptions, TensorSet};

pub fn load_tensor_set(path: &Path) -> Result<TensorSet> {
    TensorSet::load(path).with_context(|| format!("Failed to load '{}'", path.display()))
}

pub fn pipeline_options(batch: Option<usize>) -> PipelineOptions {
    match batch {
        Some(b) => PipelineOptions::default().with_batch_size(b),
        None => PipelineOptions::default(),
    }
}

pub fn build_pipeline(weights: &TensorSet, options: &PipelineOptions) -> Result<GptPipeline> {
    let ctx = ComputeContext::new().context("Failed to create compute device")?;
    GptPipeline::build(&ctx, weights, options).context("Failed to build pipeline")
}

/// Pads `prompt` with 0 to `block_size` and repeats it for every batch row.
pub fn batch_tokens(prompt: &[u32], block_size: usize, batch_size: usize) -> Result<Vec<u32>> {
    if prompt.is_empty() {
        return Err(anyhow!("No tokens given"));
    }
    if prompt.len() > block_size {
        return Err(anyhow!(
            "{} tokens given, block size is {block_size}",
            prompt.len()
        ));
    }
    let mut row = prompt.to_vec();
    row.resize(block_size, 0);
    Ok(row.repeat(batch_size))
}

pub fn format_tokens(tokens: &[f32]) -> String {
    tokens
        .iter()
        .map(|t| (*t as u32).to_string())
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_tokens_pads_and_repeats() {
        assert_eq!(
            batch_tokens(&[2, 1], 4, 2).unwrap(),
            vec![2, 1, 0, 0, 2, 1, 0, 0]
        );
        assert!(batch_tokens(&[], 4, 1).is_err());
        assert!(batch_tokens(&[0; 5], 4, 1).is_err());
    }

    #[test]
    fn test_format_tokens() {
        assert_eq!(format_tokens(&[2.0, 0.0, 1.0]), "2,0,1");
    }
}
