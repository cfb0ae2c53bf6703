use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use futures::channel::oneshot;

use super::buffer::BufferResource;
use super::device::{self, PhaseFailure};
use super::fence::Fence;
use super::BufferId;
use crate::error::{PipelineError, Result};
use crate::kernel::EncodedPhase;

/// Device construction options.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Size of the device's rayon pool. `None` uses rayon's default.
    pub worker_threads: Option<usize>,
    pub label: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            worker_threads: None,
            label: "llmviz-device".to_string(),
        }
    }
}

pub(crate) enum Command {
    Allocate {
        id: BufferId,
        len: usize,
    },
    Free(BufferId),
    Write {
        id: BufferId,
        data: Vec<f32>,
    },
    Read {
        id: BufferId,
        reply: oneshot::Sender<Result<Vec<f32>>>,
    },
    Copy {
        src: BufferId,
        dst: BufferId,
    },
    Dispatch(EncodedPhase),
    /// One submission. Commands run back to back; a failed dispatch skips
    /// the dispatches and copies after it.
    Submit(Vec<Command>),
    Signal(oneshot::Sender<Option<PhaseFailure>>),
    Shutdown,
}

struct ContextInner {
    label: String,
    sender: Sender<Command>,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let _ = self.sender.send(Command::Shutdown);
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("device thread '{}' panicked", self.label);
            }
        }
        log::debug!("device '{}' shut down", self.label);
    }
}

/// Handle to a compute device. Cheap to clone; the device thread exits when the
/// last handle is dropped.
#[derive(Clone)]
pub struct ComputeContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("label", &self.inner.label)
            .finish_non_exhaustive()
    }
}

impl ComputeContext {
    pub fn new() -> Result<Self> {
        Self::with_config(DeviceConfig::default())
    }

    pub fn with_config(config: DeviceConfig) -> Result<Self> {
        let mut pool = rayon::ThreadPoolBuilder::new();
        if let Some(n) = config.worker_threads {
            if n == 0 {
                return Err(PipelineError::InvalidConfig(
                    "worker_threads must be non-zero".to_string(),
                ));
            }
            pool = pool.num_threads(n);
        }
        let label = config.label.clone();
        let pool = pool
            .thread_name(move |i| format!("{label}-worker-{i}"))
            .build()
            .map_err(|e| PipelineError::DeviceLost(format!("failed to build worker pool: {e}")))?;

        let workers = pool.current_num_threads();
        let (sender, receiver) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(config.label.clone())
            .spawn(move || device::run(pool, receiver))?;

        log::info!(
            "device '{}' initialized with {} worker threads",
            config.label,
            workers
        );

        Ok(Self {
            inner: Arc::new(ContextInner {
                label: config.label,
                sender,
                next_id: AtomicU64::new(1),
                thread: Mutex::new(Some(thread)),
            }),
        })
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub(crate) fn next_buffer_id(&self) -> BufferId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn sender(&self) -> Sender<Command> {
        self.inner.sender.clone()
    }

    pub(crate) fn send(&self, command: Command) -> Result<()> {
        self.inner
            .sender
            .send(command)
            .map_err(|_| PipelineError::DeviceLost(self.inner.label.clone()))
    }

    pub fn create_command_encoder(&self, label: &str) -> CommandEncoder {
        CommandEncoder {
            label: label.to_string(),
            commands: Vec::new(),
        }
    }

    /// Enqueues everything recorded in `encoder` as one submission.
    pub fn submit(&self, encoder: CommandEncoder) -> Result<()> {
        log::debug!(
            "submitting '{}' ({} commands)",
            encoder.label,
            encoder.commands.len()
        );
        self.send(Command::Submit(encoder.commands))
    }

    /// Fence that resolves once all previously submitted work has run.
    pub fn on_submitted_work_done(&self) -> Fence {
        let (reply, receiver) = oneshot::channel();
        // A closed queue drops `reply`, which the fence reports as device loss.
        let _ = self.send(Command::Signal(reply));
        Fence::new(receiver)
    }

    /// Blocks until all previously submitted work has run.
    pub fn wait_idle(&self) -> Result<()> {
        self.on_submitted_work_done().wait()
    }
}

/// Records device commands for a single submission.
pub struct CommandEncoder {
    label: String,
    commands: Vec<Command>,
}

impl CommandEncoder {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn write_buffer(&mut self, buffer: &BufferResource, data: &[f32]) -> Result<()> {
        buffer.check_len(data.len())?;
        self.commands.push(Command::Write {
            id: buffer.id(),
            data: data.to_vec(),
        });
        Ok(())
    }

    /// Device-side copy; both buffers must hold the same number of elements.
    pub fn copy_buffer(&mut self, src: &BufferResource, dst: &BufferResource) -> Result<()> {
        dst.check_len(src.len())?;
        self.commands.push(Command::Copy {
            src: src.id(),
            dst: dst.id(),
        });
        Ok(())
    }

    pub(crate) fn dispatch(&mut self, phase: EncodedPhase) {
        self.commands.push(Command::Dispatch(phase));
    }
}
