//! Per-cell compute kernels and the phases that bind them to buffers.
//!
//! A kernel computes one destination cell at a time from its bound inputs.
//! Dispatching a [`Phase`] evaluates every cell of its destination grid in
//! parallel, rows split across the device's worker pool. Destination buffers are
//! zeroed first, so any channel a kernel leaves unwritten reads back as 0.

mod phase;
mod registry;
mod source;

use std::fmt;

use rayon::prelude::*;
use thiserror::Error;

pub use phase::Phase;
pub(crate) use phase::EncodedPhase;
pub use registry::KernelRegistry;
pub use source::{KernelProgram, KernelSource};

/// Faults raised while evaluating a cell.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelFault {
    #[error("input {slot} sampled at ({x}, {y}) outside its {width}x{height} extent")]
    OutOfBounds {
        slot: usize,
        x: usize,
        y: usize,
        width: usize,
        height: usize,
    },

    #[error("input slot {0} is not bound")]
    UnboundInput(usize),

    #[error("input {slot} has no channel {channel}")]
    MissingChannel { slot: usize, channel: usize },

    #[error("uniform {0} is not set")]
    MissingUniform(usize),

    #[error("write to channel {channel} of destination {dest} is out of range")]
    BadOutput { dest: usize, channel: usize },

    #[error("index {value} is outside a table of {rows} rows")]
    IndexOutOfRange { value: f32, rows: usize },

    #[error("destination {dest} holds {actual} elements, expected {expected}")]
    Layout {
        dest: usize,
        expected: usize,
        actual: usize,
    },
}

/// Destination cell coordinate: `x` is the column, `y` the row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellPos {
    pub x: usize,
    pub y: usize,
}

/// Read-only view of one bound source buffer.
#[derive(Debug, Clone, Copy)]
pub struct SourceView<'a> {
    data: &'a [f32],
    width: usize,
    height: usize,
    channels: usize,
}

impl<'a> SourceView<'a> {
    pub fn new(data: &'a [f32], width: usize, height: usize, channels: usize) -> Self {
        Self {
            data,
            width,
            height,
            channels,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// All channels of cell `(x, y)`, or `None` outside the grid.
    pub fn cell(&self, x: usize, y: usize) -> Option<&'a [f32]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let start = (y * self.width + x) * self.channels;
        self.data.get(start..start + self.channels)
    }
}

/// Everything a kernel can read: sources in binding order plus uniforms.
#[derive(Debug)]
pub struct KernelInputs<'a> {
    sources: Vec<SourceView<'a>>,
    uniforms: &'a [i32],
}

impl<'a> KernelInputs<'a> {
    pub fn new(sources: Vec<SourceView<'a>>, uniforms: &'a [i32]) -> Self {
        Self { sources, uniforms }
    }

    pub fn fetch(&self, slot: usize, x: usize, y: usize) -> Result<&'a [f32], KernelFault> {
        let source = self
            .sources
            .get(slot)
            .ok_or(KernelFault::UnboundInput(slot))?;
        source.cell(x, y).ok_or(KernelFault::OutOfBounds {
            slot,
            x,
            y,
            width: source.width,
            height: source.height,
        })
    }

    /// Channel 0 of cell `(x, y)`.
    pub fn fetch1(&self, slot: usize, x: usize, y: usize) -> Result<f32, KernelFault> {
        self.fetch_channel(slot, x, y, 0)
    }

    pub fn fetch_channel(
        &self,
        slot: usize,
        x: usize,
        y: usize,
        channel: usize,
    ) -> Result<f32, KernelFault> {
        self.fetch(slot, x, y)?
            .get(channel)
            .copied()
            .ok_or(KernelFault::MissingChannel { slot, channel })
    }

    pub fn uniform(&self, index: usize) -> Result<i32, KernelFault> {
        self.uniforms
            .get(index)
            .copied()
            .ok_or(KernelFault::MissingUniform(index))
    }
}

/// Write access to the current cell of every destination.
pub struct CellWriter<'w, 'd> {
    row: &'w mut [&'d mut [f32]],
    channels: &'w [usize],
    x: usize,
}

impl CellWriter<'_, '_> {
    pub fn set(&mut self, dest: usize, channel: usize, value: f32) -> Result<(), KernelFault> {
        let channels = match self.channels.get(dest) {
            Some(&c) if channel < c => c,
            _ => return Err(KernelFault::BadOutput { dest, channel }),
        };
        self.row[dest][self.x * channels + channel] = value;
        Ok(())
    }
}

/// A compiled per-cell program.
pub trait CellKernel: Send + Sync + fmt::Debug {
    fn eval(
        &self,
        pos: CellPos,
        inputs: &KernelInputs<'_>,
        out: &mut CellWriter<'_, '_>,
    ) -> Result<(), KernelFault>;
}

/// Evaluates `kernel` over every cell of a `width`-wide grid.
///
/// `outputs[d]` holds destination `d` with `channels[d]` channels per cell; all
/// destinations share the grid extent. Must run inside the intended rayon pool.
pub fn evaluate_grid(
    kernel: &dyn CellKernel,
    inputs: &KernelInputs<'_>,
    width: usize,
    channels: &[usize],
    outputs: &mut [Vec<f32>],
) -> Result<(), KernelFault> {
    if outputs.len() != channels.len() {
        return Err(KernelFault::Layout {
            dest: outputs.len().min(channels.len()),
            expected: channels.len(),
            actual: outputs.len(),
        });
    }
    let Some(&first) = channels.first() else {
        return Ok(());
    };
    if width == 0 {
        return Ok(());
    }
    let height = outputs.first().map_or(0, |o| o.len() / (width * first).max(1));

    let mut rows: Vec<Vec<&mut [f32]>> = (0..height)
        .map(|_| Vec::with_capacity(outputs.len()))
        .collect();
    for (dest, (data, &c)) in outputs.iter_mut().zip(channels).enumerate() {
        let expected = width * height * c;
        if data.len() != expected {
            return Err(KernelFault::Layout {
                dest,
                expected,
                actual: data.len(),
            });
        }
        data.fill(0.0);
        for (row, chunk) in rows.iter_mut().zip(data.chunks_mut(width * c)) {
            row.push(chunk);
        }
    }

    rows.into_par_iter()
        .enumerate()
        .try_for_each(|(y, mut row)| {
            let mut writer = CellWriter {
                row: &mut row,
                channels,
                x: 0,
            };
            for x in 0..width {
                writer.x = x;
                kernel.eval(CellPos { x, y }, inputs, &mut writer)?;
            }
            Ok(())
        })
}
