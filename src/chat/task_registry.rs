//! Chat task registry - tracks the active completion so it can be stopped

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Active chat completion task
pub struct ChatTask {
    pub task_id: Uuid,
    pub cancel_token: CancellationToken,
}

/// Registry of active completion tasks (keyed by task id)
#[derive(Default)]
pub struct TaskRegistry {
    tasks: DashMap<Uuid, ChatTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new task and return its id
    pub fn register(&self, cancel_token: CancellationToken) -> Uuid {
        let task_id = Uuid::new_v4();
        self.tasks.insert(
            task_id,
            ChatTask {
                task_id,
                cancel_token,
            },
        );
        task_id
    }

    /// Remove a task from the registry
    pub fn remove(&self, task_id: &Uuid) {
        self.tasks.remove(task_id);
    }

    /// Check if any completion is running
    pub fn is_processing(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Cancel every running task. Returns how many were newly cancelled;
    /// tasks that were already cancelled are left alone.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        for entry in self.tasks.iter() {
            if !entry.cancel_token.is_cancelled() {
                log::info!("Cancelling chat task {}", entry.task_id);
                entry.cancel_token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }
}
