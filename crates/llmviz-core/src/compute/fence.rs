use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::channel::oneshot;

use super::device::PhaseFailure;
use crate::error::{PipelineError, Result};

/// Completion signal for all work submitted before it.
///
/// Poll with [`is_ready`](Fence::is_ready), `.await` it, or [`wait`](Fence::wait)
/// from blocking code. Dropping a fence without waiting is fine; the work it
/// tracks still runs.
#[derive(Debug)]
pub struct Fence {
    receiver: oneshot::Receiver<Option<PhaseFailure>>,
    outcome: Option<Result<()>>,
    issued: Instant,
}

fn settle(reply: std::result::Result<Option<PhaseFailure>, oneshot::Canceled>) -> Result<()> {
    match reply {
        Ok(None) => Ok(()),
        Ok(Some(failure)) => Err(failure.into()),
        Err(oneshot::Canceled) => Err(PipelineError::DeviceLost(
            "device dropped a pending fence".to_string(),
        )),
    }
}

impl Fence {
    pub(crate) fn new(receiver: oneshot::Receiver<Option<PhaseFailure>>) -> Self {
        Self {
            receiver,
            outcome: None,
            issued: Instant::now(),
        }
    }

    /// Non-blocking check. Once this returns true the outcome is retained for
    /// [`wait`](Fence::wait) or `.await`.
    pub fn is_ready(&mut self) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        match self.receiver.try_recv() {
            Ok(None) => false,
            Ok(Some(reply)) => {
                self.outcome = Some(settle(Ok(reply)));
                true
            }
            Err(canceled) => {
                self.outcome = Some(settle(Err(canceled)));
                true
            }
        }
    }

    /// Time since the fence was issued.
    pub fn elapsed(&self) -> Duration {
        self.issued.elapsed()
    }

    /// Blocks until the fenced work has run.
    pub fn wait(self) -> Result<()> {
        futures::executor::block_on(self)
    }
}

impl Future for Fence {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if let Some(outcome) = self.outcome.take() {
            return Poll::Ready(outcome);
        }
        Pin::new(&mut self.receiver).poll(cx).map(settle)
    }
}
