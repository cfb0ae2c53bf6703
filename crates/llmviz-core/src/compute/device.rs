use std::collections::HashMap;
use std::sync::mpsc::Receiver;
use std::time::Instant;

use rayon::ThreadPool;

use super::context::Command;
use super::BufferId;
use crate::error::PipelineError;
use crate::kernel::{evaluate_grid, EncodedPhase, KernelInputs, SourceView};

/// A failed dispatch, as reported through fences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    pub phase: String,
    pub reason: String,
}

impl From<PhaseFailure> for PipelineError {
    fn from(failure: PhaseFailure) -> Self {
        PipelineError::PhaseFailed {
            phase: failure.phase,
            reason: failure.reason,
        }
    }
}

struct DeviceState {
    pool: ThreadPool,
    memory: HashMap<BufferId, Vec<f32>>,
    /// First failure of the current submission.
    failure: Option<PhaseFailure>,
}

pub(super) fn run(pool: ThreadPool, receiver: Receiver<Command>) {
    let mut state = DeviceState {
        pool,
        memory: HashMap::new(),
        failure: None,
    };
    while let Ok(command) = receiver.recv() {
        if let Command::Shutdown = command {
            break;
        }
        state.execute(command);
    }
    log::trace!("device thread exiting with {} live buffers", state.memory.len());
}

impl DeviceState {
    fn execute(&mut self, command: Command) {
        match command {
            Command::Allocate { id, len } => {
                self.memory.insert(id, vec![0.0; len]);
            }
            Command::Free(id) => {
                self.memory.remove(&id);
            }
            Command::Write { id, data } => match self.memory.get_mut(&id) {
                Some(target) if target.len() == data.len() => target.copy_from_slice(&data),
                Some(target) => log::error!(
                    "dropping write of {} elements to buffer #{id} of {}",
                    data.len(),
                    target.len()
                ),
                None => log::error!("dropping write to unknown buffer #{id}"),
            },
            Command::Read { id, reply } => {
                let result = self
                    .memory
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| PipelineError::UnknownBuffer(format!("#{id}")));
                let _ = reply.send(result);
            }
            Command::Copy { src, dst } => {
                if let Err(reason) = self.copy(src, dst) {
                    self.fail("copy", reason);
                }
            }
            Command::Dispatch(phase) => {
                let label = phase.label().to_string();
                if let Err(reason) = self.dispatch(&phase) {
                    self.fail(&label, reason);
                }
            }
            Command::Submit(commands) => {
                self.failure = None;
                for command in commands {
                    let is_device_work =
                        matches!(command, Command::Dispatch(_) | Command::Copy { .. });
                    if is_device_work && self.failure.is_some() {
                        if let Command::Dispatch(phase) = &command {
                            log::debug!("skipping phase '{}' after failure", phase.label());
                        }
                        continue;
                    }
                    self.execute(command);
                }
            }
            Command::Signal(reply) => {
                let _ = reply.send(self.failure.clone());
            }
            Command::Shutdown => {}
        }
    }

    fn fail(&mut self, phase: &str, reason: String) {
        log::error!("phase '{phase}' failed: {reason}");
        if self.failure.is_none() {
            self.failure = Some(PhaseFailure {
                phase: phase.to_string(),
                reason,
            });
        }
    }

    fn copy(&mut self, src: BufferId, dst: BufferId) -> Result<(), String> {
        let data = self
            .memory
            .get(&src)
            .cloned()
            .ok_or_else(|| format!("unknown source buffer #{src}"))?;
        let target = self
            .memory
            .get_mut(&dst)
            .ok_or_else(|| format!("unknown destination buffer #{dst}"))?;
        if target.len() != data.len() {
            return Err(format!(
                "copy of {} elements into buffer of {}",
                data.len(),
                target.len()
            ));
        }
        target.copy_from_slice(&data);
        Ok(())
    }

    fn dispatch(&mut self, phase: &EncodedPhase) -> Result<(), String> {
        let started = Instant::now();
        let dests = phase.dests();

        for buffer in dests.iter().chain(phase.sources()) {
            if !self.memory.contains_key(&buffer.id()) {
                return Err(format!("buffer '{}' is not resident", buffer.label()));
            }
        }

        // Destinations leave the map for the duration of the dispatch; the
        // binding rules guarantee none of them is also a source.
        let mut outputs: Vec<Vec<f32>> = dests
            .iter()
            .map(|b| self.memory.remove(&b.id()).unwrap_or_default())
            .collect();

        let result = {
            let sources: Vec<SourceView<'_>> = phase
                .sources()
                .iter()
                .map(|b| {
                    let data = self.memory.get(&b.id()).map(Vec::as_slice).unwrap_or(&[]);
                    SourceView::new(data, b.width(), b.height(), b.channels())
                })
                .collect();
            let inputs = KernelInputs::new(sources, phase.uniforms());
            let channels: Vec<usize> = dests.iter().map(|b| b.channels()).collect();
            let width = phase.width();
            let kernel = phase.program().kernel();

            self.pool.install(|| {
                evaluate_grid(kernel, &inputs, width, &channels, &mut outputs)
            })
        };

        for (buffer, data) in dests.iter().zip(outputs) {
            self.memory.insert(buffer.id(), data);
        }

        result.map_err(|fault| fault.to_string())?;
        for buffer in dests {
            buffer.record_kernel_write();
        }
        log::trace!(
            "phase '{}' ({}x{}) in {:?}",
            phase.label(),
            phase.width(),
            phase.height(),
            started.elapsed()
        );
        Ok(())
    }
}
