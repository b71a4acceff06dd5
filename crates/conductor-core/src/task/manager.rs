//! TaskManager - admission control over running agents.
//!
//! At most `max_concurrent_tasks` adapters run at once. Further submissions
//! wait in a FIFO queue of the same size and are admitted, in order, as
//! running tasks finish. Each admitted task gets two threads: one starting
//! the adapter, one routing its events to the task's callbacks.

use super::callbacks::{dispatch, TaskCallbacks};
use super::types::{Task, TaskStatus};
use crate::adapter::{AdapterError, AdapterEvent, AdapterServices, ProcessAdapter, TaskConfig};
use crate::bridge::ActiveTaskSource;
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use thiserror::Error;

pub const DEFAULT_MAX_CONCURRENT_TASKS: usize = 10;

#[derive(Debug, Clone)]
pub struct TaskManagerConfig {
    /// Ceiling on running tasks; also the length of the wait queue.
    pub max_concurrent_tasks: usize,
}

impl Default for TaskManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: DEFAULT_MAX_CONCURRENT_TASKS,
        }
    }
}

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Task already exists: {0}")]
    Duplicate(String),

    #[error("Task queue is full ({limit} waiting)")]
    QueueFull { limit: usize },

    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Task is not running: {0}")]
    NotActive(String),

    #[error("Task is still queued or running: {0}")]
    Unfinished(String),

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

struct ActiveEntry {
    adapter: ProcessAdapter,
    callbacks: Arc<dyn TaskCallbacks>,
    /// Admission order, used to pick the most recent task.
    seq: u64,
    /// The task as it was when admitted.
    admitted: Task,
}

struct QueuedEntry {
    task: Task,
    config: TaskConfig,
    callbacks: Arc<dyn TaskCallbacks>,
}

/// An admitted task whose threads have not been started yet.
struct Launch {
    entry: Arc<ActiveEntry>,
    config: TaskConfig,
    events_tx: Sender<AdapterEvent>,
    events_rx: Receiver<AdapterEvent>,
}

#[derive(Default)]
struct ManagerState {
    active: HashMap<String, Arc<ActiveEntry>>,
    queue: VecDeque<QueuedEntry>,
    /// Last known state of tasks that are no longer active or queued.
    finished: HashMap<String, Task>,
    next_seq: u64,
}

struct ManagerInner {
    config: TaskManagerConfig,
    services: AdapterServices,
    state: Mutex<ManagerState>,
}

/// Schedules tasks onto process adapters.
///
/// Cheap to clone; clones share the same tasks.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<ManagerInner>,
}

impl TaskManager {
    pub fn new(config: TaskManagerConfig, services: AdapterServices) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                services,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    pub fn max_concurrent_tasks(&self) -> usize {
        self.inner.config.max_concurrent_tasks
    }

    /// Run `config` as task `task_id`, or queue it when at capacity.
    ///
    /// Returns the task as `running` or `queued`. Startup happens in the
    /// background; a failed start reaches the callbacks as `on_error`.
    pub fn submit(
        &self,
        task_id: impl Into<String>,
        config: TaskConfig,
        callbacks: Arc<dyn TaskCallbacks>,
    ) -> Result<Task, TaskError> {
        let task_id = task_id.into();
        let limit = self.max_concurrent_tasks();

        let (task, launch) = {
            let mut state = self.inner.state();
            if state.active.contains_key(&task_id) || state.queue.iter().any(|q| q.task.id == task_id) {
                return Err(TaskError::Duplicate(task_id));
            }
            state.finished.remove(&task_id);

            if state.active.len() < limit {
                let task = Task::new(task_id, config.prompt.clone(), TaskStatus::Queued);
                let launch = self.inner.admit(&mut state, task, config, callbacks);
                (launch.entry.admitted.clone(), Some(launch))
            } else if state.queue.len() >= limit {
                log::warn!("rejecting task {}: queue full", task_id);
                return Err(TaskError::QueueFull { limit });
            } else {
                let task = Task::new(task_id, config.prompt.clone(), TaskStatus::Queued);
                log::info!("task {} queued (position {})", task.id, state.queue.len() + 1);
                state.queue.push_back(QueuedEntry {
                    task: task.clone(),
                    config,
                    callbacks,
                });
                (task, None)
            }
        };

        if let Some(launch) = launch {
            self.inner.launch(launch);
        }
        Ok(task)
    }

    /// Cancel a task.
    ///
    /// A queued task is dropped silently. A running one is killed, with no
    /// further events, and its slot goes to the next queued task.
    pub fn cancel(&self, task_id: &str) -> Result<(), TaskError> {
        let entry = {
            let mut state = self.inner.state();
            if let Some(pos) = state.queue.iter().position(|q| q.task.id == task_id) {
                if let Some(mut queued) = state.queue.remove(pos) {
                    queued.task.set_status(TaskStatus::Cancelled);
                    state.finished.insert(queued.task.id.clone(), queued.task);
                }
                log::info!("queued task {} cancelled", task_id);
                return Ok(());
            }
            state
                .active
                .get(task_id)
                .cloned()
                .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?
        };

        entry.adapter.cancel();
        self.inner.finish(&entry);
        Ok(())
    }

    /// Ask a running task's agent to stop.
    pub fn interrupt(&self, task_id: &str) -> Result<(), TaskError> {
        self.inner.active_entry(task_id)?.adapter.interrupt()?;
        Ok(())
    }

    /// Send a line of input to a running task's agent.
    pub fn send_response(&self, task_id: &str, text: &str) -> Result<(), TaskError> {
        self.inner.active_entry(task_id)?.adapter.send_response(text)?;
        Ok(())
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        let state = self.inner.state();
        if let Some(entry) = state.active.get(task_id) {
            let task = entry.adapter.snapshot();
            // The adapter only knows the task once its start has begun.
            return Some(if task.status == TaskStatus::Queued {
                entry.admitted.clone()
            } else {
                task
            });
        }
        if let Some(queued) = state.queue.iter().find(|q| q.task.id == task_id) {
            return Some(queued.task.clone());
        }
        state.finished.get(task_id).cloned()
    }

    /// Forget a finished task. Queued and running tasks must be cancelled
    /// first.
    pub fn remove_task(&self, task_id: &str) -> Result<Task, TaskError> {
        let mut state = self.inner.state();
        if let Some(task) = state.finished.remove(task_id) {
            return Ok(task);
        }
        if state.active.contains_key(task_id) || state.queue.iter().any(|q| q.task.id == task_id) {
            return Err(TaskError::Unfinished(task_id.to_string()));
        }
        Err(TaskError::NotFound(task_id.to_string()))
    }

    /// Tasks kept for lookup after finishing.
    pub fn finished_count(&self) -> usize {
        self.inner.state().finished.len()
    }

    pub fn active_count(&self) -> usize {
        self.inner.state().active.len()
    }

    pub fn queued_count(&self) -> usize {
        self.inner.state().queue.len()
    }

    /// Queued task ids, next to run first.
    pub fn queued_ids(&self) -> Vec<String> {
        self.inner.state().queue.iter().map(|q| q.task.id.clone()).collect()
    }

    /// The most recently admitted running task.
    pub fn active_task_id(&self) -> Option<String> {
        self.inner
            .state()
            .active
            .values()
            .max_by_key(|entry| entry.seq)
            .map(|entry| entry.admitted.id.clone())
    }

    /// Cancel everything, queued and running.
    pub fn shutdown(&self) {
        let (queued, active) = {
            let mut state = self.inner.state();
            let queued: Vec<QueuedEntry> = state.queue.drain(..).collect();
            let active: Vec<Arc<ActiveEntry>> = state.active.drain().map(|(_, e)| e).collect();
            (queued, active)
        };
        log::info!(
            "shutting down: {} running, {} queued",
            active.len(),
            queued.len()
        );

        let mut finished = Vec::with_capacity(queued.len() + active.len());
        for mut entry in queued {
            entry.task.set_status(TaskStatus::Cancelled);
            finished.push(entry.task);
        }
        for entry in active {
            entry.adapter.cancel();
            finished.push(entry.adapter.snapshot());
            entry.adapter.dispose();
        }

        let mut state = self.inner.state();
        for task in finished {
            state.finished.insert(task.id.clone(), task);
        }
    }
}

impl ActiveTaskSource for TaskManager {
    fn active_task_id(&self) -> Option<String> {
        TaskManager::active_task_id(self)
    }
}

impl ManagerInner {
    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn active_entry(&self, task_id: &str) -> Result<Arc<ActiveEntry>, TaskError> {
        let state = self.state();
        if let Some(entry) = state.active.get(task_id) {
            return Ok(Arc::clone(entry));
        }
        if state.queue.iter().any(|q| q.task.id == task_id) {
            return Err(TaskError::NotActive(task_id.to_string()));
        }
        Err(TaskError::NotFound(task_id.to_string()))
    }

    /// Bind an adapter to `task` and record it as active. The caller starts
    /// it with [`Self::launch`] once the lock is released.
    fn admit(
        &self,
        state: &mut ManagerState,
        mut task: Task,
        config: TaskConfig,
        callbacks: Arc<dyn TaskCallbacks>,
    ) -> Launch {
        task.set_status(TaskStatus::Running);
        state.next_seq += 1;

        let (events_tx, events_rx) = mpsc::channel();
        let adapter = ProcessAdapter::new(task.id.clone(), self.services.clone(), events_tx.clone());
        let entry = Arc::new(ActiveEntry {
            adapter,
            callbacks,
            seq: state.next_seq,
            admitted: task,
        });
        state
            .active
            .insert(entry.admitted.id.clone(), Arc::clone(&entry));
        log::info!(
            "task {} admitted ({}/{} running)",
            entry.admitted.id,
            state.active.len(),
            self.config.max_concurrent_tasks
        );

        Launch {
            entry,
            config,
            events_tx,
            events_rx,
        }
    }

    fn launch(self: &Arc<Self>, launch: Launch) {
        let Launch {
            entry,
            config,
            events_tx,
            events_rx,
        } = launch;

        let manager = Arc::clone(self);
        let dispatched = Arc::clone(&entry);
        thread::spawn(move || manager.dispatch_events(dispatched, events_rx));

        thread::spawn(move || {
            if let Err(err) = entry.adapter.start(config) {
                if !matches!(err, AdapterError::Disposed) {
                    let _ = events_tx.send(AdapterEvent::Error {
                        kind: err.failure_kind(),
                        message: err.to_string(),
                    });
                }
            }
        });
    }

    fn dispatch_events(self: Arc<Self>, entry: Arc<ActiveEntry>, events: Receiver<AdapterEvent>) {
        let task_id = entry.admitted.id.as_str();
        for event in events {
            if !self.is_current(&entry) {
                break;
            }
            dispatch(entry.callbacks.as_ref(), task_id, &event);
            if event.is_terminal() {
                self.finish(&entry);
                break;
            }
        }
    }

    fn is_current(&self, entry: &Arc<ActiveEntry>) -> bool {
        self.state()
            .active
            .get(&entry.admitted.id)
            .is_some_and(|current| Arc::ptr_eq(current, entry))
    }

    /// Retire `entry` and admit queued tasks into the freed capacity.
    fn finish(self: &Arc<Self>, entry: &Arc<ActiveEntry>) {
        let task_id = entry.admitted.id.clone();
        let launches = {
            let mut state = self.state();
            let is_current = state
                .active
                .get(&task_id)
                .is_some_and(|current| Arc::ptr_eq(current, entry));
            if !is_current {
                return;
            }
            state.active.remove(&task_id);
            state.finished.insert(task_id.clone(), entry.adapter.snapshot());
            self.drain(&mut state)
        };

        entry.adapter.dispose();
        log::info!("task {} retired", task_id);

        for launch in launches {
            launch
                .entry
                .callbacks
                .on_status_change(&launch.entry.admitted.id, TaskStatus::Running);
            self.launch(launch);
        }
    }

    fn drain(&self, state: &mut ManagerState) -> Vec<Launch> {
        let mut launches = Vec::new();
        while state.active.len() < self.config.max_concurrent_tasks {
            let Some(next) = state.queue.pop_front() else {
                break;
            };
            launches.push(self.admit(state, next.task, next.config, next.callbacks));
        }
        launches
    }
}
