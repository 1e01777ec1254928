//! Per-session frame completion barrier.
//!
//! The worker opens a generation, the content surface registers asynchronous
//! subtasks against it while the frame is triggered, and the worker then closes
//! registration and drains. Closing only after the trigger returned is what lets a
//! frame with zero subtasks resolve at once without racing slow registrations.

use std::{
    collections::HashMap,
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::Notify;

use crate::foundation::error::{FramecastError, FramecastResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(pub u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubtaskFailure {
    pub label: String,
    pub error: String,
}

#[derive(Debug, Default)]
struct BarrierState {
    active: Option<Generation>,
    closed: bool,
    pending: HashMap<u64, String>,
    failures: Vec<SubtaskFailure>,
    next_task: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BarrierState>,
    drained: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, generation: Generation, task: u64, outcome: Result<(), String>) {
        let mut state = self.lock();
        if state.active != Some(generation) {
            tracing::warn!(%generation, "ignoring stale subtask completion");
            return;
        }
        let Some(label) = state.pending.remove(&task) else {
            tracing::warn!(%generation, task, "ignoring duplicate subtask completion");
            return;
        };
        if let Err(error) = outcome {
            state.failures.push(SubtaskFailure { label, error });
        }
        if state.closed && state.pending.is_empty() {
            self.drained.notify_one();
        }
    }
}

/// Cheap to clone; all clones share one barrier.
#[derive(Clone, Debug, Default)]
pub struct FrameCompletionBarrier {
    shared: Arc<Shared>,
}

impl FrameCompletionBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens registration for `generation`. Generations must increase; anything
    /// still pending from an older one becomes stale.
    pub fn begin(&self, generation: Generation) -> FramecastResult<()> {
        let mut state = self.shared.lock();
        if let Some(prev) = state.active {
            if generation <= prev {
                return Err(FramecastError::validation(format!(
                    "barrier generation {generation} is not newer than {prev}"
                )));
            }
            if !state.pending.is_empty() {
                tracing::debug!(
                    %prev,
                    abandoned = state.pending.len(),
                    "abandoning subtasks of previous generation"
                );
            }
        }
        state.active = Some(generation);
        state.closed = false;
        state.pending.clear();
        state.failures.clear();
        Ok(())
    }

    /// Registers a subtask with the open generation. The ticket must be completed or
    /// failed; dropping it counts as a failure.
    pub fn register(&self, label: impl Into<String>) -> FramecastResult<SubtaskTicket> {
        let label = label.into();
        let mut state = self.shared.lock();
        let Some(generation) = state.active else {
            return Err(FramecastError::validation(format!(
                "subtask '{label}' registered before any frame was triggered"
            )));
        };
        if state.closed {
            return Err(FramecastError::validation(format!(
                "subtask '{label}' registered after frame {generation} closed registration"
            )));
        }
        state.next_task += 1;
        let task = state.next_task;
        state.pending.insert(task, label.clone());
        Ok(SubtaskTicket {
            shared: Arc::clone(&self.shared),
            generation,
            task,
            label,
            resolved: false,
        })
    }

    /// Registers `task` and runs it on the runtime. An `Err` output is recorded as a
    /// failure of `label`.
    pub fn wait_for<F, E>(&self, label: impl Into<String>, task: F) -> FramecastResult<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display,
    {
        let ticket = self.register(label)?;
        tokio::spawn(async move {
            match task.await {
                Ok(()) => ticket.complete(),
                Err(e) => ticket.fail(e),
            }
        });
        Ok(())
    }

    /// Opens `generation`, runs `trigger` (which may register subtasks), closes
    /// registration and waits until every registered subtask settled.
    pub async fn trigger_and_await<F>(
        &self,
        generation: Generation,
        trigger: F,
    ) -> FramecastResult<Vec<SubtaskFailure>>
    where
        F: Future<Output = FramecastResult<()>>,
    {
        self.begin(generation)?;
        trigger.await?;
        self.close(generation)?;
        self.drain(generation).await
    }

    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }

    fn close(&self, generation: Generation) -> FramecastResult<()> {
        let mut state = self.shared.lock();
        if state.active != Some(generation) {
            return Err(FramecastError::validation(format!(
                "cannot close generation {generation}: not the active one"
            )));
        }
        state.closed = true;
        Ok(())
    }

    async fn drain(&self, generation: Generation) -> FramecastResult<Vec<SubtaskFailure>> {
        loop {
            {
                let mut state = self.shared.lock();
                if state.active != Some(generation) {
                    return Err(FramecastError::validation(format!(
                        "generation {generation} was superseded while draining"
                    )));
                }
                if state.pending.is_empty() {
                    return Ok(std::mem::take(&mut state.failures));
                }
            }
            self.shared.drained.notified().await;
        }
    }
}

pub struct SubtaskTicket {
    shared: Arc<Shared>,
    generation: Generation,
    task: u64,
    label: String,
    resolved: bool,
}

impl SubtaskTicket {
    pub fn complete(mut self) {
        self.resolved = true;
        self.shared.resolve(self.generation, self.task, Ok(()));
    }

    pub fn fail(mut self, error: impl fmt::Display) {
        self.resolved = true;
        self.shared
            .resolve(self.generation, self.task, Err(error.to_string()));
    }
}

impl Drop for SubtaskTicket {
    fn drop(&mut self) {
        if !self.resolved {
            self.shared.resolve(
                self.generation,
                self.task,
                Err(format!("subtask '{}' was dropped before completing", self.label)),
            );
        }
    }
}

#[cfg(test)]
#[path = "../../tests/unit/render/barrier.rs"]
mod tests;
