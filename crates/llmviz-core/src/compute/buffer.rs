use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;

use futures::channel::oneshot;

use super::context::{Command, ComputeContext};
use super::BufferId;
use crate::error::{PipelineError, Result};

struct BufferInner {
    id: BufferId,
    width: usize,
    height: usize,
    channels: usize,
    label: String,
    device: String,
    sender: Sender<Command>,
    kernel_writes: AtomicU64,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        // The device may already be gone.
        let _ = self.sender.send(Command::Free(self.id));
    }
}

/// A device-resident `width x height` grid with 1 to 4 channels per cell.
///
/// Cells are stored row-major with channels interleaved, so element
/// `(x, y, c)` lives at `(y * width + x) * channels + c`. Handles are cheap to
/// clone; the allocation is released when the last one drops.
#[derive(Clone)]
pub struct BufferResource {
    inner: Arc<BufferInner>,
}

impl fmt::Debug for BufferResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferResource")
            .field("label", &self.inner.label)
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("channels", &self.inner.channels)
            .finish()
    }
}

impl BufferResource {
    /// Allocates zero-initialised device memory.
    pub fn allocate(
        context: &ComputeContext,
        width: usize,
        height: usize,
        channels: usize,
        label: &str,
    ) -> Result<Self> {
        if !(1..=4).contains(&channels) {
            return Err(PipelineError::InvalidShape {
                shape: vec![width, height, channels],
                reason: format!("buffer '{label}' needs 1 to 4 channels, got {channels}"),
            });
        }
        if width == 0 || height == 0 {
            return Err(PipelineError::InvalidShape {
                shape: vec![width, height, channels],
                reason: format!("buffer '{label}' has a zero extent"),
            });
        }

        let id = context.next_buffer_id();
        context.send(Command::Allocate {
            id,
            len: width * height * channels,
        })?;
        log::trace!("allocated buffer '{label}' ({width}x{height}x{channels}) as #{id}");

        Ok(Self {
            inner: Arc::new(BufferInner {
                id,
                width,
                height,
                channels,
                label: label.to_string(),
                device: context.label().to_string(),
                sender: context.sender(),
                kernel_writes: AtomicU64::new(0),
            }),
        })
    }

    pub fn id(&self) -> BufferId {
        self.inner.id
    }

    pub fn width(&self) -> usize {
        self.inner.width
    }

    pub fn height(&self) -> usize {
        self.inner.height
    }

    pub fn channels(&self) -> usize {
        self.inner.channels
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Total element count, `width * height * channels`.
    pub fn len(&self) -> usize {
        self.inner.width * self.inner.height * self.inner.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn same_buffer(&self, other: &BufferResource) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of kernel dispatches that have written this buffer.
    pub fn kernel_write_count(&self) -> u64 {
        self.inner.kernel_writes.load(Ordering::Acquire)
    }

    pub(crate) fn record_kernel_write(&self) {
        self.inner.kernel_writes.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn check_len(&self, len: usize) -> Result<()> {
        if len != self.len() {
            return Err(PipelineError::SizeMismatch {
                label: self.inner.label.clone(),
                expected: self.len(),
                actual: len,
            });
        }
        Ok(())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.inner
            .sender
            .send(command)
            .map_err(|_| PipelineError::DeviceLost(self.inner.device.clone()))
    }

    /// Enqueues a host-to-device transfer of the whole buffer.
    pub fn write(&self, data: &[f32]) -> Result<()> {
        self.check_len(data.len())?;
        self.send(Command::Write {
            id: self.inner.id,
            data: data.to_vec(),
        })
    }

    fn request_read(&self) -> Result<oneshot::Receiver<Result<Vec<f32>>>> {
        let (reply, receiver) = oneshot::channel();
        self.send(Command::Read {
            id: self.inner.id,
            reply,
        })?;
        Ok(receiver)
    }

    /// Resolves with the buffer contents once all previously issued work has run.
    pub fn read_async(&self) -> impl Future<Output = Result<Vec<f32>>> + Send + 'static {
        let requested = self.request_read();
        let device = self.inner.device.clone();
        async move {
            requested?
                .await
                .map_err(|_| PipelineError::DeviceLost(device))?
        }
    }

    /// Blocking readback into `out`, after all previously issued work.
    pub fn read(&self, out: &mut [f32]) -> Result<()> {
        self.check_len(out.len())?;
        let data = self.to_vec()?;
        out.copy_from_slice(&data);
        Ok(())
    }

    /// Blocking readback into a fresh vector.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        futures::executor::block_on(self.read_async())
    }
}
