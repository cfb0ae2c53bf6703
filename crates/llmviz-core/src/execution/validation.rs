//! Readback comparison against reference checkpoints.

use std::fmt;

use crate::tensor::TensorView;

/// Outcome of comparing one buffer against a reference tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationReport {
    /// Checkpoint or buffer name the comparison was requested for.
    pub name: String,
    pub buffer: String,
    pub compared: usize,
    pub mismatches: usize,
    pub max_abs_diff: f32,
    /// `(flat index, actual, expected)` of the first element out of tolerance.
    pub first_mismatch: Option<(usize, f32, f32)>,
    /// Set when the comparison could not be made at all.
    pub error: Option<String>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.error.is_none() && self.mismatches == 0
    }

    pub(crate) fn failed(name: &str, buffer: &str, error: String) -> Self {
        Self {
            name: name.to_string(),
            buffer: buffer.to_string(),
            compared: 0,
            mismatches: 0,
            max_abs_diff: 0.0,
            first_mismatch: None,
            error: Some(error),
        }
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(error) = &self.error {
            return write!(f, "{} ({}): {error}", self.name, self.buffer);
        }
        write!(
            f,
            "{} ({}): {}/{} within tolerance, max diff {:.3e}",
            self.name,
            self.buffer,
            self.compared - self.mismatches,
            self.compared,
            self.max_abs_diff
        )?;
        if let Some((i, actual, expected)) = self.first_mismatch {
            write!(f, ", first mismatch at {i}: {actual} vs {expected}")?;
        }
        Ok(())
    }
}

/// Reports for a set of checkpoints.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationSummary {
    pub reports: Vec<ValidationReport>,
    /// Reference entries with no buffer to compare against.
    pub skipped: Vec<String>,
}

impl ValidationSummary {
    pub fn passed(&self) -> bool {
        self.reports.iter().all(ValidationReport::passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ValidationReport> {
        self.reports.iter().filter(|r| !r.passed())
    }

    pub fn report(&self, name: &str) -> Option<&ValidationReport> {
        self.reports.iter().find(|r| r.name == name)
    }
}

/// Maps a reference checkpoint name to the buffer holding the same values.
/// Block-internal checkpoints refer to block 0.
pub fn checkpoint_buffer(name: &str, n_layer: usize) -> Option<String> {
    let buffer = match name {
        "idx" => "input.tokens",
        "tok_emb" => "wte.output",
        "x" => "embed.output",
        "ln1" => "block0.ln1.output",
        "attSm" => "block0.attn.softmax",
        "y" => "block0.attn.scaled",
        "yProj" => "block0.attn.proj",
        "attnResid" => "block0.attn.output",
        "ln2" => "block0.ln2.output",
        "fc" => "block0.mlp.fc",
        "gelu" => "block0.mlp.gelu",
        "mlp" => "block0.mlp.proj",
        "mlpResid" => "block0.output",
        "ln_f" => "ln_f.output",
        "lm_head" | "logits" => "lm_head.output",
        "probs" => "softmax.output",
        other => {
            let i: usize = other.strip_prefix("block")?.parse().ok()?;
            return (i < n_layer).then(|| format!("block{i}.output"));
        }
    };
    Some(buffer.to_string())
}

/// Element-wise `|actual - expected| <= tolerance`; NaN never passes.
pub(crate) fn compare(
    name: &str,
    buffer: &str,
    actual: &[f32],
    expected: &TensorView,
    tolerance: f32,
) -> ValidationReport {
    let expected = expected.to_dense_vec();
    if actual.len() != expected.len() {
        return ValidationReport::failed(
            name,
            buffer,
            format!(
                "buffer holds {} elements, reference has {}",
                actual.len(),
                expected.len()
            ),
        );
    }

    let mut report = ValidationReport {
        name: name.to_string(),
        buffer: buffer.to_string(),
        compared: actual.len(),
        mismatches: 0,
        max_abs_diff: 0.0,
        first_mismatch: None,
        error: None,
    };
    for (i, (&a, &e)) in actual.iter().zip(&expected).enumerate() {
        let diff = (a - e).abs();
        report.max_abs_diff = report.max_abs_diff.max(diff);
        if diff <= tolerance {
            continue;
        }
        report.mismatches += 1;
        report.first_mismatch.get_or_insert((i, a, e));
    }
    report
}
