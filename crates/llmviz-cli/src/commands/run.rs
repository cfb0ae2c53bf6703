use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};

use llmviz_core::{Executor, PipelineOptions, ReferenceModel, TensorSet, ValidationSummary};

use super::util::{batch_tokens, build_pipeline, format_tokens, load_tensor_set, pipeline_options};

pub fn run(
    weights: &Path,
    batch: Option<usize>,
    tokens: &[u32],
    steps: usize,
    validate: Option<&Path>,
    reference: bool,
    tolerance: Option<f32>,
) -> Result<()> {
    let weights = load_tensor_set(weights)?;
    let partials = validate.map(load_tensor_set).transpose()?;

    // Partials carry their own input and batch size.
    let batch = batch.or_else(|| partials.as_ref().and_then(|p| p.config().batch_size));
    let mut options = pipeline_options(batch);
    if let Some(tolerance) = tolerance {
        options.validation_tolerance = tolerance;
    }

    let pipeline = build_pipeline(&weights, &options)?;
    let shape = *pipeline.shape();
    let mut executor = Executor::new(pipeline);

    let input = match &partials {
        Some(partials) if tokens.is_empty() => {
            let idx = partials
                .require("idx")
                .context("Partials file has no 'idx' tensor")?;
            executor.set_input_len(shape.block_size)?;
            idx.to_dense_vec().iter().map(|&t| t as u32).collect()
        }
        _ => {
            let prompt = if tokens.is_empty() { &[0][..] } else { tokens };
            executor.set_input_len(prompt.len())?;
            batch_tokens(prompt, shape.block_size, shape.batch_size)?
        }
    };

    executor
        .run_forward_pass(&input)?
        .wait()
        .context("Forward pass failed")?;

    let mut failed = false;
    if let Some(partials) = &partials {
        let summary = executor.validate_checkpoints(partials, options.validation_tolerance);
        failed |= !report("partials", &summary);
    }
    if reference {
        let checkpoints = reference_checkpoints(&weights, &options, &input)?;
        let summary = executor.validate_checkpoints(&checkpoints, options.validation_tolerance);
        failed |= !report("reference", &summary);
    }

    for _ in 0..steps {
        if executor.input_len() >= shape.block_size {
            log::warn!("block is full after {} tokens, stopping", executor.input_len());
            break;
        }
        executor.loop_output_to_input()?;
        executor.run_resident_pass()?;
    }

    let results = executor.read_results()?;
    let tokens = executor.pipeline().tokens()?.to_vec()?;
    let len = executor.input_len();
    for (b, row) in tokens.chunks(shape.block_size).enumerate() {
        println!("batch {b}: tokens {}", format_tokens(&row[..len]));
        let last = &results[b * shape.block_size + len - 1];
        let top = last
            .first()
            .ok_or_else(|| anyhow!("Empty prediction row"))?;
        println!(
            "batch {b}: next token {} (p = {:.4})",
            top.token, top.probability
        );
    }

    if failed {
        bail!("VALIDATION FAILED");
    }
    Ok(())
}

fn reference_checkpoints(
    weights: &TensorSet,
    options: &PipelineOptions,
    input: &[u32],
) -> Result<TensorSet> {
    let model = ReferenceModel::new(weights, options).context("Failed to build CPU reference")?;
    model.forward(input).context("CPU reference forward failed")
}

fn report(source: &str, summary: &ValidationSummary) -> bool {
    for failure in summary.failures() {
        println!("  mismatch: {failure}");
    }
    let passed = summary.passed();
    println!(
        "validation against {source}: {} ({} checkpoints, {} skipped)",
        if passed { "ok" } else { "FAILED" },
        summary.reports.len(),
        summary.skipped.len()
    );
    passed
}
