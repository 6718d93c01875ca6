//! Task progress tracking for collection runs.
//!
//! Each run is tracked by a small state machine: created `Pending` at
//! submission, any number of `Progress` transitions (each fully replacing
//! the previous payload), then exactly one terminal transition into
//! `Success` or `Failure`. Terminal states are final and retained, so a
//! caller can poll a finished run indefinitely.
//!
//! Transitions are kept as an append-only log per task and mirrored into a
//! `tokio::sync::watch` channel: polling borrows the latest status
//! (side-effect free), streaming readers await changes and never see the
//! same payload twice back-to-back.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// State of a tracked run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Progress {
        stage: String,
        progress: u8,
        message: String,
    },
    Success {
        result: Value,
    },
    Failure {
        error: String,
    },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Success { .. } | TaskState::Failure { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Progress { .. } => "PROGRESS",
            TaskState::Success { .. } => "SUCCESS",
            TaskState::Failure { .. } => "FAILURE",
        }
    }
}

/// The full status payload readers observe.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatus {
    pub task_id: String,
    #[serde(flatten)]
    pub state: TaskState,
}

struct TaskInner {
    id: String,
    /// Append-only transition log. The last entry is the current state.
    log: Mutex<Vec<TaskState>>,
    tx: watch::Sender<TaskStatus>,
    /// Held so the channel stays open even with no subscribers.
    _rx: watch::Receiver<TaskStatus>,
}

/// Handle to one tracked task. Cloneable; the tracker owns all transitions
/// for its task id.
#[derive(Clone)]
pub struct TaskHandle {
    inner: Arc<TaskInner>,
}

impl TaskHandle {
    fn new() -> Self {
        let id = Uuid::new_v4().to_string();
        let initial = TaskStatus {
            task_id: id.clone(),
            state: TaskState::Pending,
        };
        let (tx, rx) = watch::channel(initial);
        Self {
            inner: Arc::new(TaskInner {
                id,
                log: Mutex::new(vec![TaskState::Pending]),
                tx,
                _rx: rx,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current status. Idempotent: two polls with no intervening transition
    /// observe identical payloads.
    pub fn status(&self) -> TaskStatus {
        self.inner.tx.borrow().clone()
    }

    /// Subscribe to state changes. The receiver sees the current status
    /// immediately and is woken only on actual transitions.
    pub fn subscribe(&self) -> watch::Receiver<TaskStatus> {
        self.inner.tx.subscribe()
    }

    /// Copy of the transition log, oldest first.
    pub fn transitions(&self) -> Vec<TaskState> {
        self.inner.log.lock().unwrap().clone()
    }

    pub fn progress(&self, stage: &str, progress: u8, message: impl Into<String>) {
        self.transition(TaskState::Progress {
            stage: stage.to_string(),
            progress: progress.min(100),
            message: message.into(),
        });
    }

    pub fn succeed(&self, result: Value) {
        self.transition(TaskState::Success { result });
    }

    pub fn fail(&self, error: impl Into<String>) {
        self.transition(TaskState::Failure {
            error: error.into(),
        });
    }

    fn transition(&self, next: TaskState) {
        let mut log = self.inner.log.lock().unwrap();
        let current = log.last().expect("log is never empty");
        if current.is_terminal() {
            debug!(task_id = %self.inner.id, "ignoring transition on terminal task");
            return;
        }
        // Identical consecutive payloads are not re-emitted.
        if *current == next {
            return;
        }
        log.push(next.clone());
        let _ = self.inner.tx.send(TaskStatus {
            task_id: self.inner.id.clone(),
            state: next,
        });
    }
}

/// In-process registry of tracked tasks. Terminal tasks are retained for
/// later polling; the registry lives as long as the process.
pub struct TaskRegistry {
    tasks: RwLock<HashMap<String, TaskHandle>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Create a new Pending task and register it.
    pub fn create(&self) -> TaskHandle {
        let handle = TaskHandle::new();
        self.tasks
            .write()
            .unwrap()
            .insert(handle.id().to_string(), handle.clone());
        handle
    }

    pub fn get(&self, id: &str) -> Option<TaskHandle> {
        self.tasks.read().unwrap().get(id).cloned()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn starts_pending() {
        let registry = TaskRegistry::new();
        let task = registry.create();
        assert_eq!(task.status().state, TaskState::Pending);
        assert_eq!(registry.get(task.id()).unwrap().status().state, TaskState::Pending);
    }

    #[test]
    fn progress_replaces_payload() {
        let task = TaskRegistry::new().create();
        task.progress("authenticating", 10, "acquiring token");
        task.progress("collecting", 40, "user 2 of 5");
        match task.status().state {
            TaskState::Progress {
                stage, progress, ..
            } => {
                assert_eq!(stage, "collecting");
                assert_eq!(progress, 40);
            }
            other => panic!("unexpected state: {:?}", other),
        }
        assert_eq!(task.transitions().len(), 3);
    }

    #[test]
    fn terminal_state_is_final() {
        let task = TaskRegistry::new().create();
        task.succeed(json!({"snapshot_id": 1}));
        task.progress("collecting", 50, "late report");
        task.fail("late failure");
        match task.status().state {
            TaskState::Success { result } => assert_eq!(result["snapshot_id"], 1),
            other => panic!("terminal state regressed: {:?}", other),
        }
        // The log records no transitions after the terminal one.
        assert_eq!(task.transitions().len(), 2);
    }

    #[test]
    fn polling_is_idempotent() {
        let task = TaskRegistry::new().create();
        task.progress("storing", 85, "writing snapshot");
        assert_eq!(task.status(), task.status());
    }

    #[test]
    fn identical_consecutive_updates_are_suppressed() {
        let task = TaskRegistry::new().create();
        task.progress("collecting", 40, "user 2 of 5");
        task.progress("collecting", 40, "user 2 of 5");
        assert_eq!(task.transitions().len(), 2);
    }

    #[tokio::test]
    async fn subscriber_sees_each_transition_once() {
        let task = TaskRegistry::new().create();
        let mut rx = task.subscribe();
        assert_eq!(rx.borrow_and_update().state, TaskState::Pending);

        task.progress("collecting", 30, "working");
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().state.label(), "PROGRESS");

        task.succeed(json!({"inserted": 0}));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().state.label(), "SUCCESS");

        // No further wakeups after terminal: attempted transitions are
        // dropped before reaching the channel.
        task.fail("ignored");
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn progress_is_capped_at_100() {
        let task = TaskRegistry::new().create();
        task.progress("storing", 250, "overflow");
        match task.status().state {
            TaskState::Progress { progress, .. } => assert_eq!(progress, 100),
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[test]
    fn status_serializes_like_the_wire_contract() {
        let task = TaskRegistry::new().create();
        task.progress("storing", 85, "writing snapshot");
        let json = serde_json::to_value(task.status()).unwrap();
        assert_eq!(json["state"], "PROGRESS");
        assert_eq!(json["stage"], "storing");
        assert_eq!(json["progress"], 85);
        assert!(json["task_id"].is_string());
    }
}
