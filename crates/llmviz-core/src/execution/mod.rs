//! Running the pipeline: forward passes, readback, validation and the
//! autoregressive loop-back.

mod validation;

pub use validation::{checkpoint_buffer, ValidationReport, ValidationSummary};

use std::cmp::Ordering;

use crate::compute::Fence;
use crate::error::{PipelineError, Result};
use crate::pipeline::{GptPipeline, INPUT_TOKENS, NEXT_TOKENS, PROBABILITIES};
use crate::tensor::TensorView;
use crate::weights::TensorSet;

/// One candidate next token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub token: u32,
    pub probability: f32,
}

/// Drives a [`GptPipeline`].
///
/// Every pass encodes all phases in build order into a single submission.
/// Results stay on the device until read back.
pub struct Executor {
    pipeline: GptPipeline,
    input_len: usize,
    passes: u64,
    /// Fence of the most recent forward pass, until its results are collected.
    pending: Option<Fence>,
}

impl Executor {
    pub fn new(pipeline: GptPipeline) -> Self {
        Self {
            pipeline,
            input_len: 1,
            passes: 0,
            pending: None,
        }
    }

    pub fn pipeline(&self) -> &GptPipeline {
        &self.pipeline
    }

    pub fn into_pipeline(self) -> GptPipeline {
        self.pipeline
    }

    /// Number of forward passes submitted so far.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    /// Number of leading time steps holding real input tokens.
    pub fn input_len(&self) -> usize {
        self.input_len
    }

    pub fn set_input_len(&mut self, len: usize) -> Result<()> {
        let t = self.pipeline.shape().block_size;
        if len == 0 || len > t {
            return Err(PipelineError::InvalidConfig(format!(
                "input length {len} outside 1..={t}"
            )));
        }
        self.input_len = len;
        Ok(())
    }

    /// Writes `tokens` (`B * T` of them) and runs a full forward pass.
    pub fn run_forward_pass(&mut self, tokens: &[u32]) -> Result<Fence> {
        let values: Vec<f32> = tokens.iter().map(|&t| t as f32).collect();
        self.pipeline.buffer(INPUT_TOKENS)?.write(&values)?;
        self.run_resident_pass()
    }

    /// Runs a forward pass over whatever the token buffer currently holds.
    pub fn run_resident_pass(&mut self) -> Result<Fence> {
        self.passes += 1;
        let context = self.pipeline.context();
        let mut encoder = context.create_command_encoder(&format!("forward pass {}", self.passes));
        for phase in self.pipeline.phases() {
            phase.encode(&mut encoder);
        }
        log::debug!(
            "encoded forward pass {} ({} phases)",
            self.passes,
            encoder.len()
        );
        context.submit(encoder)?;

        self.pending = Some(context.on_submitted_work_done());
        Ok(context.on_submitted_work_done())
    }

    /// Feeds the prediction for position `input_len` back into the token
    /// buffer and advances the input length.
    ///
    /// Runs on the device after the last submitted pass; the next forward pass
    /// sees the extended input.
    pub fn loop_output_to_input(&mut self) -> Result<Fence> {
        let t = self.pipeline.shape().block_size;
        if self.input_len >= t {
            return Err(PipelineError::InvalidConfig(format!(
                "input length {} already fills the block of {t}",
                self.input_len
            )));
        }
        let target = i32::try_from(self.input_len).map_err(|_| {
            PipelineError::InvalidConfig(format!("input length {} overflows", self.input_len))
        })?;

        self.pipeline
            .copy_phase_mut()
            .set_uniform("targetTIdx", target)?;

        let context = self.pipeline.context();
        let mut encoder = context.create_command_encoder("loop output to input");
        self.pipeline.copy_phase().encode(&mut encoder);
        encoder.copy_buffer(
            self.pipeline.buffer(NEXT_TOKENS)?,
            self.pipeline.buffer(INPUT_TOKENS)?,
        )?;
        context.submit(encoder)?;

        self.input_len += 1;
        log::debug!("looped prediction into t={target}, input length now {}", self.input_len);
        Ok(context.on_submitted_work_done())
    }

    /// Compares the named buffer against `reference`. Never fails; problems
    /// are logged and reported.
    pub fn validate(&self, name: &str, reference: &TensorView, tolerance: f32) -> ValidationReport {
        let report = match self.pipeline.buffer(name).and_then(|b| b.to_vec()) {
            Ok(actual) => validation::compare(name, name, &actual, reference, tolerance),
            Err(e) => ValidationReport::failed(name, name, e.to_string()),
        };
        log_report(&report);
        report
    }

    /// Validates every checkpoint in `partials` that maps to a buffer.
    pub fn validate_checkpoints(&self, partials: &TensorSet, tolerance: f32) -> ValidationSummary {
        let mut summary = ValidationSummary::default();
        let n_layer = self.pipeline.shape().n_layer;
        for (name, reference) in partials.iter() {
            let Some(buffer) = checkpoint_buffer(name, n_layer) else {
                summary.skipped.push(name.to_string());
                continue;
            };
            let report = match self.pipeline.buffer(&buffer).and_then(|b| b.to_vec()) {
                Ok(actual) => validation::compare(name, &buffer, &actual, reference, tolerance),
                Err(e) => ValidationReport::failed(name, &buffer, e.to_string()),
            };
            log_report(&report);
            summary.reports.push(report);
        }
        log_summary(&summary);
        summary
    }

    /// Awaits `fence`, then validates like
    /// [`validate_checkpoints`](Self::validate_checkpoints) without blocking.
    pub async fn validate_when_ready(
        &self,
        fence: Fence,
        partials: &TensorSet,
        tolerance: f32,
    ) -> Result<ValidationSummary> {
        fence.await?;

        let mut summary = ValidationSummary::default();
        let n_layer = self.pipeline.shape().n_layer;
        for (name, reference) in partials.iter() {
            let Some(buffer) = checkpoint_buffer(name, n_layer) else {
                summary.skipped.push(name.to_string());
                continue;
            };
            let readback = match self.pipeline.buffer(&buffer) {
                Ok(b) => b.read_async().await,
                Err(e) => Err(e),
            };
            let report = match readback {
                Ok(actual) => validation::compare(name, &buffer, &actual, reference, tolerance),
                Err(e) => ValidationReport::failed(name, &buffer, e.to_string()),
            };
            log_report(&report);
            summary.reports.push(report);
        }
        log_summary(&summary);
        Ok(summary)
    }

    /// Blocking readback of the output probabilities, one list per `(b, t)`
    /// row, most probable first.
    pub fn read_results(&self) -> Result<Vec<Vec<Prediction>>> {
        let probs = self.pipeline.buffer(PROBABILITIES)?;
        let data = probs.to_vec()?;
        Ok(sorted_predictions(&data, probs.width()))
    }

    /// Results of the last pass if it has finished, `None` while it is still
    /// running or before any pass was submitted.
    pub fn read_results_when_ready(&mut self) -> Result<Option<Vec<Vec<Prediction>>>> {
        if self.passes == 0 {
            return Ok(None);
        }
        if let Some(fence) = self.pending.as_mut() {
            if !fence.is_ready() {
                return Ok(None);
            }
        }
        // Ready fences hold their outcome, so this does not block.
        if let Some(fence) = self.pending.take() {
            fence.wait()?;
        }
        self.read_results().map(Some)
    }
}

fn sorted_predictions(data: &[f32], vocab: usize) -> Vec<Vec<Prediction>> {
    data.chunks(vocab.max(1))
        .map(|row| {
            let mut predictions: Vec<Prediction> = row
                .iter()
                .enumerate()
                .map(|(token, &probability)| Prediction {
                    token: token as u32,
                    probability,
                })
                .collect();
            predictions.sort_by(|a, b| {
                b.probability
                    .partial_cmp(&a.probability)
                    .unwrap_or(Ordering::Equal)
            });
            predictions
        })
        .collect()
}

fn log_report(report: &ValidationReport) {
    if report.passed() {
        log::debug!("validated {report}");
    } else {
        log::warn!("mismatch {report}");
    }
}

fn log_summary(summary: &ValidationSummary) {
    let failed = summary.failures().count();
    if failed > 0 {
        log::error!(
            "VALIDATION FAILED: {failed} of {} checkpoints out of tolerance",
            summary.reports.len()
        );
    } else {
        log::info!(
            "validation passed: {} checkpoints ({} skipped)",
            summary.reports.len(),
            summary.skipped.len()
        );
    }
}
