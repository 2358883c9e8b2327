//! Task coordinator.
//!
//! The coordinator owns every submitted task, the dependency graph and the
//! worker pool. After [`TaskCoordinator::start`] a single driver task runs
//! the scheduling loop. It wakes on worker messages, on control messages
//! (submissions and dispatch deadlines) and on a fixed tick, and after each
//! wakeup it runs one scheduling pass.
//!
//! ```text
//! pending → ready → running → completed
//!                     │
//!                     ├→ pending            (retry budget left)
//!                     └→ failed | timeout   (terminal)
//! ```
//!
//! A worker whose handler panics is replaced in place. The task it was
//! running is not requeued by that path; it stays `running` until its
//! dispatch deadline fires and then goes through the timeout path.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::CoordinatorConfig;
use crate::core::dag::DependencyGraph;
use crate::core::task::{
    BatchDescriptor, Task, TaskDescriptor, TaskError, TaskId, TaskStatus,
};
use crate::handlers::HandlerRegistry;
use crate::orchestration::events::{CoordinatorEvent, EVENT_CAPACITY};
use crate::orchestration::monitor::{
    adaptive_batch_size, ResourceMetrics, ResourceMonitor, ResourceProbe, ResourceSample,
    SystemProbe,
};
use crate::orchestration::pool::{WorkerMessage, WorkerPool};
use crate::worker::{TaskRequest, WorkerId, WorkerInfo};
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    /// Tasks not yet terminal, including running ones.
    pub pending: usize,
    pub execution_time_ms: u64,
    /// Completed tasks per second of execution time.
    pub throughput: f64,
    pub worker_count: usize,
    pub resource_metrics: ResourceMetrics,
}

/// Snapshot of every task, each list in submission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResults {
    pub completed: Vec<Task>,
    pub failed: Vec<Task>,
    pub pending: Vec<Task>,
}

/// Resolves when a run drains or is stopped.
#[derive(Debug)]
pub struct Completion {
    handle: JoinHandle<ExecutionSummary>,
}

impl Completion {
    pub async fn wait(self) -> Result<ExecutionSummary> {
        self.handle
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[derive(Debug)]
enum Control {
    Wake,
    Deadline {
        task_id: TaskId,
        attempt: u32,
        worker_id: WorkerId,
    },
}

enum Wakeup {
    Worker(WorkerMessage),
    Control(Control),
    Sample(ResourceSample),
    Tick,
}

struct Run {
    cancel: CancellationToken,
    control: mpsc::UnboundedSender<Control>,
}

#[derive(Default)]
struct State {
    /// Non-terminal tasks: pending, ready or running.
    tasks: HashMap<TaskId, Task>,
    completed: HashMap<TaskId, Task>,
    completed_ids: HashSet<TaskId>,
    failed: HashMap<TaskId, Task>,
    graph: DependencyGraph,
    pool: Option<WorkerPool>,
    deadlines: HashMap<TaskId, AbortHandle>,
    monitor: ResourceMonitor,
    next_sequence: u64,
    run: Option<Run>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

impl State {
    fn is_running(&self) -> bool {
        self.run.is_some()
    }

    fn wake(&self) {
        if let Some(run) = &self.run {
            let _ = run.control.send(Control::Wake);
        }
    }

    /// A worker message or deadline is current only while the task is
    /// still on the attempt it refers to.
    fn is_current(&self, task_id: TaskId, attempt: u32) -> bool {
        self.tasks
            .get(&task_id)
            .map(|task| task.status == TaskStatus::Running && task.attempts == attempt)
            .unwrap_or(false)
    }

    fn disarm(&mut self, task_id: TaskId) {
        if let Some(deadline) = self.deadlines.remove(&task_id) {
            deadline.abort();
        }
    }

    fn is_drained(&self) -> bool {
        self.tasks.is_empty()
            && self
                .pool
                .as_ref()
                .map(|pool| pool.busy_count() == 0)
                .unwrap_or(true)
    }
}

struct Inner {
    config: CoordinatorConfig,
    state: Mutex<State>,
    events: broadcast::Sender<CoordinatorEvent>,
    registry: Arc<HandlerRegistry>,
    probe: Arc<dyn ResourceProbe>,
}

/// Handle to a coordinator. Clones share the same state.
#[derive(Clone)]
pub struct TaskCoordinator {
    inner: Arc<Inner>,
}

impl TaskCoordinator {
    pub fn new(config: CoordinatorConfig, registry: HandlerRegistry) -> Self {
        Self::with_probe(config, registry, Arc::new(SystemProbe))
    }

    pub fn with_probe(
        config: CoordinatorConfig,
        registry: HandlerRegistry,
        probe: Arc<dyn ResourceProbe>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                events,
                registry: Arc::new(registry),
                probe,
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    /// Submit one task. Its dependencies must already be known.
    pub async fn add_task(&self, descriptor: TaskDescriptor) -> Result<TaskId> {
        let mut state = self.inner.state.lock().await;
        let id = TaskId::new();
        state.graph.add_task(id, &descriptor.dependencies)?;
        self.inner.enqueue(&mut state, id, descriptor);
        state.wake();
        Ok(id)
    }

    /// Submit a batch whose dependencies are positions within the batch.
    ///
    /// The batch is rejected as a whole if a position is out of range or the
    /// batch contains a cycle.
    pub async fn add_tasks(&self, descriptors: Vec<BatchDescriptor>) -> Result<Vec<TaskId>> {
        let mut state = self.inner.state.lock().await;
        let ids: Vec<TaskId> = descriptors.iter().map(|_| TaskId::new()).collect();
        let positions: Vec<Vec<usize>> = descriptors
            .iter()
            .map(|d| d.dependencies.clone())
            .collect();
        state.graph.add_batch(&ids, &positions)?;

        for (id, descriptor) in ids.iter().zip(descriptors) {
            let resolved = TaskDescriptor {
                kind: descriptor.kind,
                payload: descriptor.payload,
                priority: descriptor.priority,
                dependencies: descriptor.dependencies.iter().map(|&p| ids[p]).collect(),
                max_retries: descriptor.max_retries,
            };
            self.inner.enqueue(&mut state, *id, resolved);
        }
        debug!(count = ids.len(), "Batch submitted");
        state.wake();
        Ok(ids)
    }

    /// Spawn the worker pool and the driver loop.
    ///
    /// # Errors
    /// [`Error::AlreadyRunning`] if a run is in progress.
    pub async fn start(&self) -> Result<Completion> {
        let mut state = self.inner.state.lock().await;
        if state.is_running() {
            return Err(Error::AlreadyRunning);
        }

        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let pool = WorkerPool::new(
            self.inner.config.max_workers,
            Arc::clone(&self.inner.registry),
            worker_tx,
        );
        for worker_id in pool.ids() {
            self.inner.emit(CoordinatorEvent::WorkerCreated { worker_id });
        }
        let workers = pool.len();

        state.pool = Some(pool);
        state.run = Some(Run {
            cancel: cancel.clone(),
            control: control_tx,
        });
        state.started_at = Some(Instant::now());
        state.finished_at = None;
        let sample = self.inner.probe.sample();
        state.monitor.record(sample);
        drop(state);

        info!(workers, "Coordinator started");
        self.inner.emit(CoordinatorEvent::Started { workers });

        let handle = tokio::spawn(drive(
            Arc::clone(&self.inner),
            cancel,
            worker_rx,
            control_rx,
        ));
        Ok(Completion { handle })
    }

    /// Halt scheduling and terminate every worker.
    ///
    /// Running tasks are abandoned without consuming a retry and go back to
    /// pending.
    pub async fn stop(&self) {
        let mut state = self.inner.state.lock().await;
        let Some(run) = state.run.take() else {
            return;
        };
        run.cancel.cancel();

        if let Some(mut pool) = state.pool.take() {
            pool.shutdown();
        }
        for (_, deadline) in state.deadlines.drain() {
            deadline.abort();
        }
        for task in state.tasks.values_mut() {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
            }
        }
        state.finished_at = Some(Instant::now());
        drop(state);

        info!("Coordinator stopped");
        self.inner.emit(CoordinatorEvent::Stopped);
    }

    pub async fn is_running(&self) -> bool {
        self.inner.state.lock().await.is_running()
    }

    pub async fn execution_summary(&self) -> ExecutionSummary {
        let state = self.inner.state.lock().await;
        summarize(&state)
    }

    pub async fn task_results(&self) -> TaskResults {
        let state = self.inner.state.lock().await;
        let sorted = |tasks: &HashMap<TaskId, Task>| {
            let mut list: Vec<Task> = tasks.values().cloned().collect();
            list.sort_by_key(|task| task.sequence);
            list
        };
        TaskResults {
            completed: sorted(&state.completed),
            failed: sorted(&state.failed),
            pending: sorted(&state.tasks),
        }
    }

    /// Look up a task wherever it currently lives.
    pub async fn task(&self, id: TaskId) -> Option<Task> {
        let state = self.inner.state.lock().await;
        state
            .tasks
            .get(&id)
            .or_else(|| state.completed.get(&id))
            .or_else(|| state.failed.get(&id))
            .cloned()
    }

    pub async fn worker_status(&self) -> Vec<WorkerInfo> {
        let state = self.inner.state.lock().await;
        state
            .pool
            .as_ref()
            .map(WorkerPool::infos)
            .unwrap_or_default()
    }
}

fn summarize(state: &State) -> ExecutionSummary {
    let elapsed = match (state.started_at, state.finished_at) {
        (Some(start), Some(end)) => end.saturating_duration_since(start),
        (Some(start), None) => start.elapsed(),
        _ => Duration::ZERO,
    };
    let completed = state.completed.len();
    let secs = elapsed.as_secs_f64();

    ExecutionSummary {
        total_tasks: state.tasks.len() + completed + state.failed.len(),
        completed,
        failed: state.failed.len(),
        pending: state.tasks.len(),
        execution_time_ms: elapsed.as_millis() as u64,
        throughput: if secs > 0.0 {
            completed as f64 / secs
        } else {
            0.0
        },
        worker_count: state.pool.as_ref().map(WorkerPool::len).unwrap_or(0),
        resource_metrics: state.monitor.metrics(),
    }
}

impl Inner {
    fn emit(&self, event: CoordinatorEvent) {
        trace!(?event, "Event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn enqueue(&self, state: &mut State, id: TaskId, descriptor: TaskDescriptor) {
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let mut task = Task::new(id, descriptor, sequence);
        debug!(task = %id.short(), kind = %task.kind, priority = task.priority, "Task added");
        self.emit(CoordinatorEvent::TaskAdded { task_id: id });

        let failed_dependency = task
            .dependencies
            .iter()
            .find(|dep| state.failed.contains_key(dep))
            .copied();
        match failed_dependency {
            Some(dependency) => {
                let error = TaskError::DependencyFailed { dependency };
                task.abandon(error.clone());
                self.emit(CoordinatorEvent::TaskFailed { task_id: id, error });
                state.failed.insert(id, task);
            }
            None => {
                state.tasks.insert(id, task);
            }
        }
    }

    fn on_worker_message(&self, state: &mut State, message: WorkerMessage) {
        match message {
            WorkerMessage::Completed {
                worker_id,
                task_id,
                attempt,
                output,
                elapsed,
            } => {
                if let Some(pool) = state.pool.as_mut() {
                    pool.release(worker_id, task_id, true);
                }
                if !state.is_current(task_id, attempt) {
                    debug!(task = %task_id.short(), attempt, "Ignoring stale result");
                    return;
                }
                state.disarm(task_id);

                let Some(mut task) = state.tasks.remove(&task_id) else {
                    return;
                };
                let success = output.success;
                task.complete(output);
                debug!(
                    task = %task_id.short(),
                    success,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Task completed"
                );
                state.completed_ids.insert(task_id);
                state.completed.insert(task_id, task);
                self.emit(CoordinatorEvent::TaskCompleted {
                    task_id,
                    worker_id,
                    success,
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
            WorkerMessage::Failed {
                worker_id,
                task_id,
                attempt,
                error,
                ..
            } => {
                if let Some(pool) = state.pool.as_mut() {
                    pool.release(worker_id, task_id, false);
                }
                if !state.is_current(task_id, attempt) {
                    debug!(task = %task_id.short(), attempt, "Ignoring stale failure");
                    return;
                }
                state.disarm(task_id);
                self.fail_attempt(state, task_id, error);
            }
            WorkerMessage::Fault {
                worker_id,
                task_id,
                message,
            } => {
                warn!(
                    worker = %worker_id.short(),
                    task = %task_id.short(),
                    %message,
                    "Worker crashed"
                );
                // Kept until the dispatch deadline retries or fails the task.
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    if task.status == TaskStatus::Running {
                        task.error = Some(TaskError::WorkerCrash {
                            message: message.clone(),
                        });
                    }
                }
                self.emit(CoordinatorEvent::WorkerError {
                    worker_id,
                    task_id: Some(task_id),
                    message,
                });
                self.emit(CoordinatorEvent::WorkerExited { worker_id });

                let replacement = state.pool.as_mut().and_then(|pool| pool.replace(worker_id));
                if let Some(new_worker) = replacement {
                    self.emit(CoordinatorEvent::WorkerCreated {
                        worker_id: new_worker,
                    });
                }
            }
        }
    }

    fn on_deadline(&self, state: &mut State, task_id: TaskId, attempt: u32, worker_id: WorkerId) {
        if !state.is_current(task_id, attempt) {
            return;
        }
        state.deadlines.remove(&task_id);

        let after_ms = self.config.worker_timeout_ms;
        warn!(task = %task_id.short(), worker = %worker_id.short(), after_ms, "Task timed out");
        self.emit(CoordinatorEvent::TaskTimedOut { task_id, worker_id });

        // The worker may still be running the handler; recycle it.
        let still_assigned = state
            .pool
            .as_ref()
            .map(|pool| pool.current_task(worker_id) == Some(task_id))
            .unwrap_or(false);
        if still_assigned {
            let replacement = state.pool.as_mut().and_then(|pool| pool.replace(worker_id));
            if let Some(new_worker) = replacement {
                self.emit(CoordinatorEvent::WorkerRemoved { worker_id });
                self.emit(CoordinatorEvent::WorkerCreated {
                    worker_id: new_worker,
                });
            }
        }

        self.fail_attempt(state, task_id, TaskError::Timeout { after_ms });
    }

    fn fail_attempt(&self, state: &mut State, task_id: TaskId, error: TaskError) {
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return;
        };

        if task.record_failure(error.clone()) {
            let retry_count = task.retry_count;
            debug!(task = %task_id.short(), retry_count, %error, "Retrying task");
            self.emit(CoordinatorEvent::TaskRetried {
                task_id,
                retry_count,
                error,
            });
            return;
        }

        if let Some(task) = state.tasks.remove(&task_id) {
            warn!(task = %task_id.short(), retries = task.retry_count, %error, "Task failed");
            state.failed.insert(task_id, task);
        }
        self.emit(CoordinatorEvent::TaskFailed {
            task_id,
            error,
        });
        self.abandon_dependents(state, task_id);
    }

    /// Dependents of a failed task can never become ready.
    fn abandon_dependents(&self, state: &mut State, failed: TaskId) {
        for dependent in state.graph.transitive_dependents(&failed) {
            let Some(mut task) = state.tasks.remove(&dependent) else {
                continue;
            };
            state.disarm(dependent);
            let error = TaskError::DependencyFailed { dependency: failed };
            task.abandon(error.clone());
            debug!(task = %dependent.short(), dependency = %failed.short(), "Dependency failed");
            state.failed.insert(dependent, task);
            self.emit(CoordinatorEvent::TaskFailed {
                task_id: dependent,
                error,
            });
        }
    }

    /// One scheduling pass.
    fn schedule(&self, state: &mut State) {
        let State {
            tasks,
            completed_ids,
            pool,
            deadlines,
            monitor,
            run,
            ..
        } = state;
        let (Some(pool), Some(run)) = (pool.as_mut(), run.as_ref()) else {
            return;
        };

        for task in tasks.values_mut() {
            if task.status == TaskStatus::Pending && task.dependencies_met(completed_ids) {
                task.mark_ready();
            }
        }

        let idle = pool.idle_workers();
        if idle.is_empty() {
            return;
        }

        let memory = match monitor.fresh(self.config.sample_interval()) {
            Some(sample) => sample.memory,
            None => {
                let sample = self.probe.sample();
                let memory = sample.memory;
                monitor.record(sample);
                memory
            }
        };

        if self.config.adaptive_scaling && memory > self.config.memory_threshold {
            if let Some(worker_id) = pool.retire_idle() {
                warn!(
                    memory,
                    worker = %worker_id.short(),
                    workers = pool.len(),
                    "Memory pressure, retiring worker"
                );
                self.emit(CoordinatorEvent::WorkerRemoved { worker_id });
            } else {
                trace!(memory, "Memory pressure, holding dispatch");
            }
            return;
        }

        let mut ready: Vec<&Task> = tasks
            .values()
            .filter(|task| task.status == TaskStatus::Ready)
            .collect();
        if ready.is_empty() {
            return;
        }
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.sequence.cmp(&b.sequence))
        });

        let batch = if self.config.adaptive_scaling {
            adaptive_batch_size(self.config.batch_size, memory)
        } else {
            self.config.batch_size.max(1)
        };
        let count = idle.len().min(ready.len()).min(batch);
        let chosen: Vec<TaskId> = ready.iter().take(count).map(|task| task.id).collect();
        trace!(idle = idle.len(), ready = ready.len(), batch, count, "Dispatching");

        let timeout = self.config.worker_timeout();
        for (worker_id, task_id) in idle.into_iter().zip(chosen) {
            let Some(task) = tasks.get_mut(&task_id) else {
                continue;
            };
            let attempt = task.attempts + 1;
            let request = TaskRequest {
                task_id,
                kind: task.kind,
                payload: task.payload.clone(),
                attempt,
            };
            if !pool.assign(worker_id, request) {
                warn!(worker = %worker_id.short(), "Worker unavailable, task stays ready");
                continue;
            }
            task.start();

            let control = run.control.clone();
            let deadline = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = control.send(Control::Deadline {
                    task_id,
                    attempt,
                    worker_id,
                });
            });
            if let Some(previous) = deadlines.insert(task_id, deadline.abort_handle()) {
                previous.abort();
            }

            debug!(task = %task_id.short(), worker = %worker_id.short(), attempt, "Task assigned");
            self.emit(CoordinatorEvent::TaskAssigned {
                task_id,
                worker_id,
                attempt,
            });
        }
    }
}

async fn drive(
    inner: Arc<Inner>,
    cancel: CancellationToken,
    mut worker_rx: mpsc::UnboundedReceiver<WorkerMessage>,
    mut control_rx: mpsc::UnboundedReceiver<Control>,
) -> ExecutionSummary {
    let mut schedule_tick = interval(inner.config.tick_interval());
    schedule_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sample_tick = interval(inner.config.sample_interval());
    sample_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let wakeup = tokio::select! {
            _ = cancel.cancelled() => break,
            Some(message) = worker_rx.recv() => Wakeup::Worker(message),
            Some(control) = control_rx.recv() => Wakeup::Control(control),
            _ = sample_tick.tick() => Wakeup::Sample(inner.probe.sample()),
            _ = schedule_tick.tick() => Wakeup::Tick,
        };

        let mut state = inner.state.lock().await;
        if cancel.is_cancelled() {
            break;
        }

        match wakeup {
            Wakeup::Worker(message) => inner.on_worker_message(&mut state, message),
            Wakeup::Control(Control::Deadline {
                task_id,
                attempt,
                worker_id,
            }) => inner.on_deadline(&mut state, task_id, attempt, worker_id),
            Wakeup::Control(Control::Wake) | Wakeup::Tick => {}
            Wakeup::Sample(sample) => state.monitor.record(sample),
        }

        inner.schedule(&mut state);

        if state.is_drained() {
            state.run = None;
            state.finished_at = Some(Instant::now());
            for (_, deadline) in state.deadlines.drain() {
                deadline.abort();
            }
            let summary = summarize(&state);
            drop(state);

            info!(
                completed = summary.completed,
                failed = summary.failed,
                execution_time_ms = summary.execution_time_ms,
                "Coordinator drained"
            );
            inner.emit(CoordinatorEvent::Completed {
                completed: summary.completed,
                failed: summary.failed,
            });
            return summary;
        }
    }

    let state = inner.state.lock().await;
    summarize(&state)
}
