use std::time::Duration;

use tokio::task::JoinHandle;

/// Named handle for a background loop so shutdown can report stragglers.
pub(crate) struct TaskHandle {
    pub name: &'static str,
    pub handle: JoinHandle<()>,
}

impl TaskHandle {
    pub fn new(name: &'static str, handle: JoinHandle<()>) -> Self {
        Self { name, handle }
    }
}

#[derive(Default)]
pub(crate) struct TaskManager {
    tasks: Vec<TaskHandle>,
}

impl TaskManager {
    pub fn push(&mut self, task: TaskHandle) {
        self.tasks.push(task);
    }

    /// Abort every background task, then give each a grace window to unwind.
    pub async fn shutdown_with_grace(self, grace: Duration) {
        for t in &self.tasks {
            t.handle.abort();
        }
        for t in self.tasks {
            match tokio::time::timeout(grace, t.handle).await {
                Ok(_) => {}
                Err(_) => tracing::warn!(task = t.name, "background task did not stop in time"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_aborts_a_pending_loop() {
        let mut mgr = TaskManager::default();
        mgr.push(TaskHandle::new(
            "spin",
            tokio::spawn(async {
                loop {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
            }),
        ));
        mgr.shutdown_with_grace(Duration::from_millis(100)).await;
    }
}
