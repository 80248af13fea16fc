use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::locks::{LockTable, TargetLock};
use super::types::{Outcome, SubmitError};
use crate::lib::backend::types::BackendError;
use crate::lib::tasks::registry::TaskRegistry;
use crate::lib::tasks::types::{TaskAction, TaskState};

/// Turns a request into a tracked background unit of work with
/// per-container mutual exclusion and a bounded worker pool.
pub struct Executor {
    registry: Arc<TaskRegistry>,
    locks: Arc<LockTable>,
    permits: Arc<Semaphore>,
}

impl Executor {
    pub fn new(registry: Arc<TaskRegistry>, max_workers: usize) -> Self {
        Executor {
            registry,
            locks: Arc::new(LockTable::new()),
            permits: Arc::new(Semaphore::new(max_workers)),
        }
    }

    /// Claims the per-container lock for a non-empty target. Rejecting
    /// instead of queueing is deliberate: the external manager forbids
    /// overlapping lifecycle operations on one instance, and the caller
    /// can correct a conflict by retrying.
    fn claim(&self, target: Option<&str>) -> Result<Option<TargetLock>, SubmitError> {
        match target {
            Some(name) if !name.is_empty() => match self.locks.try_acquire(name) {
                Some(guard) => Ok(Some(guard)),
                None => Err(SubmitError::Conflict(name.to_string())),
            },
            _ => Ok(None),
        }
    }

    /// Creates a pending task, hands `work` to a fresh worker, and returns
    /// the task id without waiting. The caller polls the registry for the
    /// outcome.
    pub fn submit<F>(
        &self,
        action: TaskAction,
        target: Option<&str>,
        work: F,
    ) -> Result<Uuid, SubmitError>
    where
        F: Future<Output = Result<String, BackendError>> + Send + 'static,
    {
        let guard = self.claim(target)?;
        let task = self.registry.create(action, target.map(str::to_string))?;
        let id = task.id;
        info!(task = %id, %action, target = target.unwrap_or("-"), "task submitted");

        let registry = Arc::clone(&self.registry);
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            Self::execute(registry, permits, id, guard, work).await;
        });
        Ok(id)
    }

    /// Same bookkeeping as `submit`, but runs the work inline and hands
    /// back the terminal outcome. Used by operations whose wire contract
    /// answers with the result directly while still requiring the
    /// per-container lock and a pollable task record.
    pub async fn run_tracked<F>(
        &self,
        action: TaskAction,
        target: Option<&str>,
        work: F,
    ) -> Result<Outcome, SubmitError>
    where
        F: Future<Output = Result<String, BackendError>> + Send + 'static,
    {
        let guard = self.claim(target)?;
        let task = self.registry.create(action, target.map(str::to_string))?;
        let registry = Arc::clone(&self.registry);
        let permits = Arc::clone(&self.permits);
        Ok(Self::execute(registry, permits, task.id, guard, work).await)
    }

    /// Worker body. Failures of any kind, including panics inside `work`,
    /// end as the task's terminal error; nothing propagates past this
    /// function. The target lock is released last, when `guard` drops.
    async fn execute<F>(
        registry: Arc<TaskRegistry>,
        permits: Arc<Semaphore>,
        id: Uuid,
        guard: Option<TargetLock>,
        work: F,
    ) -> Outcome
    where
        F: Future<Output = Result<String, BackendError>> + Send + 'static,
    {
        let _permit = match permits.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                let detail = "executor is shutting down".to_string();
                registry.transition(id, TaskState::Running, None);
                registry.transition(id, TaskState::Error, Some(detail.clone()));
                drop(guard);
                return Outcome::Error(detail);
            }
        };

        registry.transition(id, TaskState::Running, None);

        let outcome = match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(message)) => {
                info!(task = %id, %message, "task succeeded");
                registry.transition(id, TaskState::Success, Some(message.clone()));
                Outcome::Success(message)
            }
            Ok(Err(err)) => {
                let detail = err.to_string();
                warn!(task = %id, error = %detail, "task failed");
                registry.transition(id, TaskState::Error, Some(detail.clone()));
                Outcome::Error(detail)
            }
            Err(payload) => {
                let detail = panic_detail(payload);
                error!(task = %id, error = %detail, "worker panicked");
                registry.transition(id, TaskState::Error, Some(detail.clone()));
                Outcome::Error(detail)
            }
        };

        drop(guard);
        outcome
    }
}

fn panic_detail(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("worker panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("worker panicked: {msg}")
    } else {
        "worker panicked".to_string()
    }
}
