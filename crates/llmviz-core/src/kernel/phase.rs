use std::sync::Arc;

use super::KernelProgram;
use crate::compute::{BufferResource, CommandEncoder};
use crate::error::{PipelineError, Result};

/// A kernel program bound to its destination and source buffers.
///
/// Binding is checked once, here; encoding a phase afterwards cannot fail.
#[derive(Debug)]
pub struct Phase {
    label: String,
    program: Arc<KernelProgram>,
    dests: Vec<BufferResource>,
    sources: Vec<BufferResource>,
    uniforms: Vec<i32>,
}

impl Phase {
    /// Binds `sources` under `names`, which must match the program's declared
    /// inputs exactly, in number and order.
    pub fn new(
        label: impl Into<String>,
        program: Arc<KernelProgram>,
        dests: Vec<BufferResource>,
        sources: Vec<BufferResource>,
        names: &[&str],
    ) -> Result<Self> {
        let label = label.into();
        let binding_error = |reason: String| PipelineError::KernelBinding {
            phase: label.clone(),
            reason,
        };

        let declared = program.input_names();
        if names != declared.as_slice() {
            return Err(binding_error(format!(
                "program '{}' declares inputs {declared:?}, bound {names:?}",
                program.name()
            )));
        }
        if sources.len() != names.len() {
            return Err(binding_error(format!(
                "{} names given for {} source buffers",
                names.len(),
                sources.len()
            )));
        }

        let written = program.output_channels();
        if dests.len() != written.len() {
            return Err(binding_error(format!(
                "program '{}' writes {} destinations, {} bound",
                program.name(),
                written.len(),
                dests.len()
            )));
        }
        let (width, height) = (dests[0].width(), dests[0].height());
        for (i, (dest, &channels)) in dests.iter().zip(written).enumerate() {
            if dest.width() != width || dest.height() != height {
                return Err(binding_error(format!(
                    "destination '{}' is {}x{}, expected {width}x{height}",
                    dest.label(),
                    dest.width(),
                    dest.height()
                )));
            }
            if dest.channels() < channels {
                return Err(binding_error(format!(
                    "destination '{}' has {} channels, program writes {channels}",
                    dest.label(),
                    dest.channels()
                )));
            }
            if dests[..i].iter().any(|d| d.same_buffer(dest)) {
                return Err(binding_error(format!(
                    "buffer '{}' bound twice as a destination",
                    dest.label()
                )));
            }
            if sources.iter().any(|s| s.same_buffer(dest)) {
                return Err(binding_error(format!(
                    "buffer '{}' is both read and written",
                    dest.label()
                )));
            }
        }

        Ok(Self {
            label,
            uniforms: vec![0; program.uniform_names().len()],
            program,
            dests,
            sources,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn program(&self) -> &Arc<KernelProgram> {
        &self.program
    }

    pub fn dests(&self) -> &[BufferResource] {
        &self.dests
    }

    pub fn sources(&self) -> &[BufferResource] {
        &self.sources
    }

    /// The first destination; every phase has at least one.
    pub fn output(&self) -> &BufferResource {
        &self.dests[0]
    }

    pub fn set_uniform(&mut self, name: &str, value: i32) -> Result<()> {
        let slot = self
            .program
            .uniform_names()
            .iter()
            .position(|&u| u == name)
            .ok_or_else(|| PipelineError::KernelBinding {
                phase: self.label.clone(),
                reason: format!("program '{}' has no uniform '{name}'", self.program.name()),
            })?;
        self.uniforms[slot] = value;
        Ok(())
    }

    /// Records a dispatch. Uniform values are captured now, not at execution.
    pub fn encode(&self, encoder: &mut CommandEncoder) {
        encoder.dispatch(EncodedPhase {
            label: self.label.clone(),
            program: self.program.clone(),
            dests: self.dests.clone(),
            sources: self.sources.clone(),
            uniforms: self.uniforms.clone(),
        });
    }
}

/// A recorded dispatch as the device executes it.
pub(crate) struct EncodedPhase {
    label: String,
    program: Arc<KernelProgram>,
    dests: Vec<BufferResource>,
    sources: Vec<BufferResource>,
    uniforms: Vec<i32>,
}

impl EncodedPhase {
    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn program(&self) -> &KernelProgram {
        &self.program
    }

    pub(crate) fn dests(&self) -> &[BufferResource] {
        &self.dests
    }

    pub(crate) fn sources(&self) -> &[BufferResource] {
        &self.sources
    }

    pub(crate) fn uniforms(&self) -> &[i32] {
        &self.uniforms
    }

    pub(crate) fn width(&self) -> usize {
        self.dests.first().map_or(0, BufferResource::width)
    }

    pub(crate) fn height(&self) -> usize {
        self.dests.first().map_or(0, BufferResource::height)
    }
}
