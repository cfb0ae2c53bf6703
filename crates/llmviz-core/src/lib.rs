//! Compute core for the llmviz transformer visualization.
//!
//! A small GPT-style forward pass executed as a fixed sequence of per-cell
//! parallel kernels over 2D buffers, plus the strided tensor model used to
//! stage weights into those buffers.

pub mod activations;
pub mod compute;
pub mod config;
pub mod error;
pub mod execution;
pub mod kernel;
pub mod ops;
pub mod pipeline;
pub mod reference;
pub mod tensor;
pub mod weights;

pub use crate::{
    compute::{BufferResource, ComputeContext, DeviceConfig, Fence},
    config::{GptConfig, ModelShape, PipelineOptions},
    error::{PipelineError, Result},
    execution::{Executor, Prediction, ValidationReport, ValidationSummary},
    kernel::{KernelRegistry, KernelSource, Phase},
    pipeline::GptPipeline,
    reference::ReferenceModel,
    tensor::TensorView,
    weights::TensorSet,
};

pub mod prelude {
    pub use crate::compute::{BufferResource, ComputeContext, Fence};
    pub use crate::config::{GptConfig, PipelineOptions};
    pub use crate::error::{PipelineError, Result};
    pub use crate::execution::Executor;
    pub use crate::pipeline::GptPipeline;
    pub use crate::weights::TensorSet;
}
