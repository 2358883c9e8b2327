//! Worker pool for the task coordinator.
//!
//! Each worker is a tokio task that takes one [`TaskRequest`] at a time from
//! its own channel, runs the registered handler and reports back on the
//! shared [`WorkerMessage`] channel. Workers hold no task state; all slot
//! bookkeeping lives here and is only touched by the coordinator.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::core::task::{TaskError, TaskId, TaskOutput};
use crate::handlers::HandlerRegistry;
use crate::worker::{TaskRequest, WorkerId, WorkerInfo, WorkerStatus};

/// Messages sent from workers to the coordinator.
#[derive(Debug)]
pub enum WorkerMessage {
    Completed {
        worker_id: WorkerId,
        task_id: TaskId,
        attempt: u32,
        output: TaskOutput,
        elapsed: Duration,
    },
    Failed {
        worker_id: WorkerId,
        task_id: TaskId,
        attempt: u32,
        error: TaskError,
        elapsed: Duration,
    },
    /// The handler panicked. The worker has exited.
    Fault {
        worker_id: WorkerId,
        task_id: TaskId,
        message: String,
    },
}

struct WorkerSlot {
    id: WorkerId,
    status: WorkerStatus,
    current_task: Option<TaskId>,
    tasks_completed: u64,
    requests: mpsc::UnboundedSender<TaskRequest>,
    handle: JoinHandle<()>,
}

impl WorkerSlot {
    fn info(&self) -> WorkerInfo {
        WorkerInfo {
            id: self.id,
            status: self.status,
            tasks_completed: self.tasks_completed,
            current_task: self.current_task,
        }
    }
}

pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    registry: Arc<HandlerRegistry>,
    results: mpsc::UnboundedSender<WorkerMessage>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one).
    pub fn new(
        size: usize,
        registry: Arc<HandlerRegistry>,
        results: mpsc::UnboundedSender<WorkerMessage>,
    ) -> Self {
        let mut pool = Self {
            slots: Vec::with_capacity(size.max(1)),
            registry,
            results,
        };
        for _ in 0..size.max(1) {
            let slot = pool.spawn_slot();
            pool.slots.push(slot);
        }
        pool
    }

    fn spawn_slot(&self) -> WorkerSlot {
        let id = WorkerId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_worker(
            id,
            rx,
            Arc::clone(&self.registry),
            self.results.clone(),
        ));
        debug!(worker = %id.short(), "Worker spawned");
        WorkerSlot {
            id,
            status: WorkerStatus::Idle,
            current_task: None,
            tasks_completed: 0,
            requests: tx,
            handle,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn ids(&self) -> Vec<WorkerId> {
        self.slots.iter().map(|slot| slot.id).collect()
    }

    /// Idle workers in slot order.
    pub fn idle_workers(&self) -> Vec<WorkerId> {
        self.slots
            .iter()
            .filter(|slot| slot.status == WorkerStatus::Idle)
            .map(|slot| slot.id)
            .collect()
    }

    pub fn busy_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.status == WorkerStatus::Busy)
            .count()
    }

    pub fn current_task(&self, worker_id: WorkerId) -> Option<TaskId> {
        self.slot(worker_id)?.current_task
    }

    fn slot(&self, worker_id: WorkerId) -> Option<&WorkerSlot> {
        self.slots.iter().find(|slot| slot.id == worker_id)
    }

    fn slot_mut(&mut self, worker_id: WorkerId) -> Option<&mut WorkerSlot> {
        self.slots.iter_mut().find(|slot| slot.id == worker_id)
    }

    /// Hand `request` to an idle worker and mark it busy.
    ///
    /// Returns `false` if the worker is unknown, busy or no longer running.
    pub fn assign(&mut self, worker_id: WorkerId, request: TaskRequest) -> bool {
        let Some(slot) = self.slot_mut(worker_id) else {
            return false;
        };
        if slot.status != WorkerStatus::Idle {
            return false;
        }
        let task_id = request.task_id;
        if slot.requests.send(request).is_err() {
            return false;
        }
        slot.status = WorkerStatus::Busy;
        slot.current_task = Some(task_id);
        true
    }

    /// Mark a worker idle after it reported on `task_id`.
    ///
    /// Ignored unless the worker is still assigned to that task.
    pub fn release(&mut self, worker_id: WorkerId, task_id: TaskId, completed: bool) {
        if let Some(slot) = self.slot_mut(worker_id) {
            if slot.current_task == Some(task_id) {
                slot.status = WorkerStatus::Idle;
                slot.current_task = None;
                if completed {
                    slot.tasks_completed += 1;
                }
            }
        }
    }

    /// Discard a worker and put a fresh one in its slot.
    pub fn replace(&mut self, worker_id: WorkerId) -> Option<WorkerId> {
        let index = self.slots.iter().position(|slot| slot.id == worker_id)?;
        let fresh = self.spawn_slot();
        let new_id = fresh.id;
        let old = std::mem::replace(&mut self.slots[index], fresh);
        old.handle.abort();
        debug!(old = %worker_id.short(), new = %new_id.short(), "Worker replaced");
        Some(new_id)
    }

    /// Retire one idle worker, never going below a single worker.
    pub fn retire_idle(&mut self) -> Option<WorkerId> {
        if self.slots.len() <= 1 {
            return None;
        }
        let index = self
            .slots
            .iter()
            .rposition(|slot| slot.status == WorkerStatus::Idle)?;
        let slot = self.slots.remove(index);
        slot.handle.abort();
        Some(slot.id)
    }

    pub fn infos(&self) -> Vec<WorkerInfo> {
        self.slots.iter().map(WorkerSlot::info).collect()
    }

    /// Abort every worker.
    pub fn shutdown(&mut self) {
        for slot in self.slots.drain(..) {
            slot.handle.abort();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_worker(
    id: WorkerId,
    mut requests: mpsc::UnboundedReceiver<TaskRequest>,
    registry: Arc<HandlerRegistry>,
    results: mpsc::UnboundedSender<WorkerMessage>,
) {
    while let Some(request) = requests.recv().await {
        let task_id = request.task_id;
        let attempt = request.attempt;
        let started = Instant::now();

        let outcome = AssertUnwindSafe(async { registry.dispatch(request).await })
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        let message = match outcome {
            Ok(Ok(mut output)) => {
                output.execution_time_ms = elapsed.as_millis() as u64;
                WorkerMessage::Completed {
                    worker_id: id,
                    task_id,
                    attempt,
                    output,
                    elapsed,
                }
            }
            Ok(Err(error)) => WorkerMessage::Failed {
                worker_id: id,
                task_id,
                attempt,
                error,
                elapsed,
            },
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(worker = %id.short(), task = %task_id.short(), %message, "Handler panicked");
                let _ = results.send(WorkerMessage::Fault {
                    worker_id: id,
                    task_id,
                    message,
                });
                return;
            }
        };

        if results.send(message).is_err() {
            break;
        }
    }
    debug!(worker = %id.short(), "Worker exiting");
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
