//! Task and result wire types.
//!
//! This module defines the two envelopes that cross the broker:
//!
//! - `Task`: a unit of work to be processed by a worker
//! - `TaskOutcome`: the result a worker publishes for one task
//!
//! Both are JSON-encoded on the wire; payloads and return values are
//! opaque `serde_json::Value`s so the engine imposes no schema of its own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work: a unique id plus an opaque payload.
///
/// Tasks are created by the dispatcher at submission time, serialized onto
/// the task queue, and decoded by a worker loop. They are immutable after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Globally unique identifier for this task. The result channel name
    /// is derived from it, so it must never be reused while a result may
    /// still be outstanding.
    pub id: Uuid,
    /// The value to process, serialized by the caller.
    pub payload: serde_json::Value,
    /// When this task was submitted.
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Creates a new task with a fresh UUID and the current timestamp.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Returns how long ago the task was submitted.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// The outcome of processing one task: either the handler's return value
/// or a description of why it failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    /// The handler returned a value.
    Success(serde_json::Value),
    /// The handler returned an error. The task is resolved; its failure
    /// is its result and it is not redelivered.
    Failure(String),
}

impl Outcome {
    /// Returns whether this outcome is a success.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

/// The result envelope a worker publishes on a task's result channel.
///
/// Exactly one `TaskOutcome` is ever produced per task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Id of the task this outcome resolves.
    pub task_id: Uuid,
    /// Success or failure of the processing function.
    pub outcome: Outcome,
    /// Id of the worker that processed the task.
    pub worker_id: String,
    /// Processing duration in milliseconds.
    pub duration_ms: u64,
    /// When processing finished.
    pub completed_at: DateTime<Utc>,
}

impl TaskOutcome {
    /// Creates a successful outcome.
    pub fn success(
        task_id: Uuid,
        worker_id: impl Into<String>,
        value: serde_json::Value,
        duration_ms: u64,
    ) -> Self {
        Self {
            task_id,
            outcome: Outcome::Success(value),
            worker_id: worker_id.into(),
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    /// Creates a failed outcome carrying the handler's error description.
    pub fn failure(
        task_id: Uuid,
        worker_id: impl Into<String>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            task_id,
            outcome: Outcome::Failure(error.into()),
            worker_id: worker_id.into(),
            duration_ms,
            completed_at: Utc::now(),
        }
    }

    /// Returns whether the task was processed successfully.
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_new_assigns_unique_ids() {
        let a = Task::new(serde_json::json!(1));
        let b = Task::new(serde_json::json!(1));

        assert!(!a.id.is_nil());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_task_serialization_roundtrip() {
        let task = Task::new(serde_json::json!({"n": 42}));

        let encoded = serde_json::to_string(&task).expect("task should serialize");
        let decoded: Task = serde_json::from_str(&encoded).expect("task should deserialize");

        assert_eq!(decoded.id, task.id);
        assert_eq!(decoded.payload, task.payload);
    }

    #[test]
    fn test_outcome_success() {
        let task_id = Uuid::new_v4();
        let outcome = TaskOutcome::success(task_id, "worker-0", serde_json::json!(9), 120);

        assert_eq!(outcome.task_id, task_id);
        assert!(outcome.is_success());
        assert_eq!(outcome.outcome, Outcome::Success(serde_json::json!(9)));
    }

    #[test]
    fn test_outcome_failure() {
        let task_id = Uuid::new_v4();
        let outcome = TaskOutcome::failure(task_id, "worker-1", "division by zero", 5);

        assert!(!outcome.is_success());
        assert_eq!(
            outcome.outcome,
            Outcome::Failure("division by zero".to_string())
        );
    }

    #[test]
    fn test_outcome_wire_format() {
        let task_id = Uuid::new_v4();
        let outcome = TaskOutcome::success(task_id, "worker-0", serde_json::json!([1, 2]), 10);

        let encoded = serde_json::to_string(&outcome).expect("outcome should serialize");
        let parsed: serde_json::Value =
            serde_json::from_str(&encoded).expect("should parse back");

        assert_eq!(parsed["outcome"]["status"], "success");
        assert_eq!(parsed["outcome"]["value"], serde_json::json!([1, 2]));

        let decoded: TaskOutcome =
            serde_json::from_str(&encoded).expect("outcome should deserialize");
        assert_eq!(decoded.task_id, task_id);
        assert!(decoded.is_success());
    }
}
