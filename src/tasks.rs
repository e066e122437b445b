//! Explicit owner for long-lived background tasks.

use parking_lot::Mutex;
use std::future::Future;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct NamedTask {
    name: String,
    handle: JoinHandle<()>,
}

/// Owns every background task the process runs (signal bridge, token
/// replenishment). Created at startup, torn down with a cancel-and-await-all
/// at shutdown; nothing registers tasks ambiently.
pub struct TaskSupervisor {
    tasks: Mutex<Vec<NamedTask>>,
}

impl TaskSupervisor {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        self.tasks.lock().push(NamedTask {
            name: name.to_string(),
            handle,
        });
        debug!("Background task '{}' started", name);
    }

    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Abort every task and wait for each to finish unwinding.
    pub async fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.handle.abort();
            let _ = task.handle.await;
            info!("Background task '{}' stopped", task.name);
        }
    }
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_cancels_running_tasks() {
        let supervisor = TaskSupervisor::new();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        supervisor.spawn("spinner", async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                flag.store(true, Ordering::Relaxed);
            }
        });

        assert_eq!(supervisor.task_count(), 1);
        supervisor.shutdown().await;
        assert_eq!(supervisor.task_count(), 0);
        assert!(!finished.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn test_shutdown_with_no_tasks_is_noop() {
        let supervisor = TaskSupervisor::new();
        supervisor.shutdown().await;
    }
}
