use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Create,
    Start,
    Stop,
    Delete,
    Expose,
    Unexpose,
}

impl TaskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskAction::Create => "create",
            TaskAction::Start => "start",
            TaskAction::Stop => "stop",
            TaskAction::Delete => "delete",
            TaskAction::Expose => "expose",
            TaskAction::Unexpose => "unexpose",
        }
    }
}

impl std::fmt::Display for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Running,
    Success,
    Error,
}

impl TaskState {
    /// Terminal states are immutable; a task never leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success | TaskState::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Success => "success",
            TaskState::Error => "error",
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One tracked asynchronous operation.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub action: TaskAction,
    /// Container the operation applies to. Create sets it to the requested
    /// name so a duplicate create conflicts like any other overlap.
    pub target: Option<String>,
    pub state: TaskState,
    /// Human-readable result, set once at the transition to Success.
    pub message: Option<String>,
    /// Failure detail, set once at the transition to Error.
    pub error: Option<String>,
    pub created_at: Instant,
}

impl Task {
    pub fn new(action: TaskAction, target: Option<String>) -> Self {
        Task {
            id: Uuid::new_v4(),
            action,
            target,
            state: TaskState::Pending,
            message: None,
            error: None,
            created_at: Instant::now(),
        }
    }

    pub fn completed(&self) -> bool {
        self.state.is_terminal()
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("task registry is full ({0} live tasks)")]
    Exhausted(usize),
}
