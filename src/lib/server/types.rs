use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lib::tasks::types::Task;

#[derive(Debug, Deserialize)]
pub struct CreateContainerRequest {
    pub name: String,
    pub user: String,
    pub password: String,
    pub distro: String,
    pub version: String,
}

#[derive(Debug, Deserialize)]
pub struct ExposeRequest {
    pub host_port: u16,
    pub container_port: u16,
}

#[derive(Debug, Serialize)]
pub struct TaskSubmitted {
    pub task_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Poll response for GET /tasks/{id}.
#[derive(Debug, Serialize)]
pub struct TaskStatus {
    pub completed: bool,
    pub status: &'static str,
    pub action: &'static str,
    pub message: Option<String>,
    pub error: Option<String>,
}

impl From<Task> for TaskStatus {
    fn from(task: Task) -> Self {
        TaskStatus {
            completed: task.completed(),
            status: task.state.as_str(),
            action: task.action.as_str(),
            message: task.message,
            error: task.error,
        }
    }
}

/// LXD instance names: start with a letter, then letters, digits and
/// hyphens, at most 63 characters.
pub fn valid_container_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// Device names are container-name-like but may start with a digit
/// (proxy-80 style).
pub fn valid_device_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 63
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// "Debian GNU" -> "debiangnu", matching what the image remotes expect.
pub fn normalize_distro(distro: &str) -> String {
    distro.to_lowercase().replace(' ', "")
}
