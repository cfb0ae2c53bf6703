//! The compute device.
//!
//! A [`ComputeContext`] owns a dedicated device thread that serves an in-order
//! command queue. Buffer memory lives on that thread and is addressed by id;
//! host code holds [`BufferResource`] handles and talks to the device only by
//! enqueueing commands. Kernel dispatches evaluate their destination cells in
//! parallel on the device's private rayon pool.
//!
//! Because the queue is strictly in order, the outputs of one dispatch are
//! visible to every command enqueued after it. A [`Fence`] resolves once all
//! work submitted before it has run and reports the first phase failure of the
//! most recent submission, if any.

mod buffer;
mod context;
mod device;
mod fence;

pub use buffer::BufferResource;
pub use context::{CommandEncoder, ComputeContext, DeviceConfig};
pub use fence::Fence;

/// Device-side identifier of an allocation.
pub type BufferId = u64;
