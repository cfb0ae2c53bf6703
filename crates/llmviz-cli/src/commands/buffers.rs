use std::path::Path;

use anyhow::Result;

use super::util::{build_pipeline, load_tensor_set, pipeline_options};

pub fn run(weights: &Path, batch: Option<usize>) -> Result<()> {
    let weights = load_tensor_set(weights)?;
    let pipeline = build_pipeline(&weights, &pipeline_options(batch))?;

    let names: Vec<&str> = pipeline.buffer_names().collect();
    let width = names.iter().map(|n| n.len()).max().unwrap_or(0);
    for name in names {
        let buffer = pipeline.buffer(name)?;
        println!(
            "{name:<width$}  {} x {} x {}",
            buffer.width(),
            buffer.height(),
            buffer.channels()
        );
    }
    println!(
        "{} buffers, {} phases",
        pipeline.buffer_names().count(),
        pipeline.phases().len()
    );
    Ok(())
}
