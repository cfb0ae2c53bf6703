use std::path::Path;

use anyhow::{Context, Result};

use llmviz_core::{GptConfig, TensorSet};

pub fn run(out: &Path, seed: u64) -> Result<()> {
    let config = GptConfig::nano_sort();
    let set = TensorSet::synthetic(&config, seed).context("Failed to generate weights")?;
    set.save(out)
        .with_context(|| format!("Failed to write '{}'", out.display()))?;
    println!(
        "wrote {} tensors ({}, seed {seed}) to {}",
        set.len(),
        config.model_type,
        out.display()
    );
    Ok(())
}
