use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::state::valid_state_transition;
use super::types::{RegistryError, Task, TaskAction, TaskState};

/// In-memory store of task records. Lifecycle: created by the API surface,
/// transitioned by the worker executing the task, removed by `sweep` once
/// terminal and older than the retention window. All methods take the
/// interior lock briefly and never await.
pub struct TaskRegistry {
    tasks: Mutex<HashMap<Uuid, Task>>,
    max_live_tasks: usize,
}

impl TaskRegistry {
    pub fn new(max_live_tasks: usize) -> Self {
        TaskRegistry {
            tasks: Mutex::new(HashMap::new()),
            max_live_tasks,
        }
    }

    /// Allocates a new pending task. Only fails when the live-task cap is
    /// reached, which means the sweeper cannot keep up; callers treat that
    /// as fatal.
    pub fn create(
        &self,
        action: TaskAction,
        target: Option<String>,
    ) -> Result<Task, RegistryError> {
        let mut tasks = self.tasks.lock();
        if tasks.len() >= self.max_live_tasks {
            warn!(live = tasks.len(), "task registry is full");
            return Err(RegistryError::Exhausted(tasks.len()));
        }
        let task = Task::new(action, target);
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    /// Snapshot of a task. None for unknown or already swept ids; that is
    /// an expected outcome, not a fault.
    pub fn get(&self, id: Uuid) -> Option<Task> {
        self.tasks.lock().get(&id).cloned()
    }

    /// Moves a task forward and records the terminal payload: `detail`
    /// becomes `message` on Success and `error` on Error. Invalid moves,
    /// including any transition out of a terminal state, leave the task
    /// untouched, so duplicate completion signals are harmless. Returns
    /// the post-call snapshot.
    pub fn transition(&self, id: Uuid, next: TaskState, detail: Option<String>) -> Option<Task> {
        let mut tasks = self.tasks.lock();
        let task = tasks.get_mut(&id)?;

        if !valid_state_transition(&task.state, &next) {
            debug!(task = %id, from = %task.state, to = %next, "ignoring state transition");
            return Some(task.clone());
        }

        task.state = next;
        match next {
            TaskState::Success => task.message = detail,
            TaskState::Error => task.error = detail,
            _ => {}
        }
        Some(task.clone())
    }

    /// Removes terminal tasks at least `max_age` old. Pending and running
    /// tasks survive regardless of age: a slow operation must never be
    /// reaped out from under a poller.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, task| !(task.completed() && task.created_at.elapsed() >= max_age));
        before - tasks.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }
}
