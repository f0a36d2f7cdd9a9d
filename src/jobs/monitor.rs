//! Task monitor and scheduler shared by the master's macro-tasks.
//!
//! Task names are stable: they appear in observability surfaces.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub const TASK_LOAD_DATASET: &str = "Load dataset";
pub const TASK_FIND_ITEM_NEIGHBORS: &str = "Find neighbors of items";
pub const TASK_FIND_USER_NEIGHBORS: &str = "Find neighbors of users";
pub const TASK_ANALYZE: &str = "Analyze click-through rate";
pub const TASK_FIT_RANKING_MODEL: &str = "Fit collaborative filtering model";
pub const TASK_FIT_CLICK_MODEL: &str = "Fit click-through rate prediction model";
pub const TASK_SEARCH_RANKING_MODEL: &str = "Search collaborative filtering model";
pub const TASK_SEARCH_CLICK_MODEL: &str = "Search click-through rate prediction model";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Finished,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub name: String,
    pub current: usize,
    pub total: usize,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Registry of named task progress and failure state.
#[derive(Default)]
pub struct TaskMonitor {
    tasks: Mutex<HashMap<String, TaskInfo>>,
}

impl TaskMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self, name: &str, total: usize) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.insert(
            name.to_string(),
            TaskInfo {
                name: name.to_string(),
                current: 0,
                total,
                status: TaskStatus::Running,
                started_at: Utc::now(),
                finished_at: None,
            },
        );
    }

    pub fn update(&self, name: &str, current: usize) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(name) {
            task.current = current;
        }
    }

    /// Mark a task failed, registering it first if it never started.
    pub fn fail(&self, name: &str, message: &str) {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.entry(name.to_string()).or_insert_with(|| TaskInfo {
            name: name.to_string(),
            current: 0,
            total: 0,
            status: TaskStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
        });
        task.status = TaskStatus::Failed(message.to_string());
        task.finished_at = Some(Utc::now());
    }

    pub fn finish(&self, name: &str) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(task) = tasks.get_mut(name) {
            task.current = task.total;
            task.status = TaskStatus::Finished;
            task.finished_at = Some(Utc::now());
        }
    }

    pub fn get(&self, name: &str) -> Option<TaskInfo> {
        self.tasks.lock().unwrap().get(name).cloned()
    }

    pub fn list(&self) -> Vec<TaskInfo> {
        self.tasks.lock().unwrap().values().cloned().collect()
    }

    /// Progress handle bound to one task name, consumed by the model fitters.
    pub fn tracker(self: &Arc<Self>, name: &str) -> TaskTracker {
        TaskTracker {
            monitor: self.clone(),
            name: name.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct TaskTracker {
    monitor: Arc<TaskMonitor>,
    name: String,
}

impl TaskTracker {
    pub fn start(&self, total: usize) {
        self.monitor.start(&self.name, total);
    }

    pub fn update(&self, current: usize) {
        self.monitor.update(&self.name, current);
    }

    pub fn fail(&self, message: &str) {
        self.monitor.fail(&self.name, message);
    }

    pub fn finish(&self) {
        self.monitor.finish(&self.name);
    }
}

/// Named exclusion locks serializing heavy tasks.
#[derive(Default)]
pub struct TaskScheduler {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the named lock; the guard releases it on drop.
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap();
            locks.entry(name.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Lock handle bound to one task name, passed into searchers.
    pub fn runner(self: &Arc<Self>, name: &str) -> TaskRunner {
        TaskRunner {
            scheduler: self.clone(),
            name: name.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct TaskRunner {
    scheduler: Arc<TaskScheduler>,
    name: String,
}

impl TaskRunner {
    pub async fn lock(&self) -> OwnedMutexGuard<()> {
        self.scheduler.lock(&self.name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_task_lifecycle() {
        let monitor = TaskMonitor::new();
        monitor.start("demo", 10);
        monitor.update("demo", 4);
        let task = monitor.get("demo").unwrap();
        assert_eq!(task.current, 4);
        assert_eq!(task.status, TaskStatus::Running);

        monitor.finish("demo");
        let task = monitor.get("demo").unwrap();
        assert_eq!(task.current, 10);
        assert_eq!(task.status, TaskStatus::Finished);
        assert!(task.finished_at.is_some());
    }

    #[test]
    fn test_task_failure() {
        let monitor = TaskMonitor::new();
        monitor.start("demo", 10);
        monitor.fail("demo", "No feedback found.");
        let task = monitor.get("demo").unwrap();
        assert_eq!(task.status, TaskStatus::Failed("No feedback found.".into()));
    }

    #[test]
    fn test_tracker_updates_monitor() {
        let monitor = Arc::new(TaskMonitor::new());
        let tracker = monitor.tracker("tracked");
        tracker.start(5);
        tracker.update(2);
        assert_eq!(monitor.get("tracked").unwrap().current, 2);
        tracker.finish();
        assert_eq!(monitor.get("tracked").unwrap().status, TaskStatus::Finished);
    }

    #[tokio::test]
    async fn test_scheduler_mutual_exclusion() {
        let scheduler = Arc::new(TaskScheduler::new());
        let guard = scheduler.lock("heavy").await;
        let contender = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                let _guard = scheduler.lock("heavy").await;
            })
        };
        // The second acquisition must block while the guard is held.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_independent_names() {
        let scheduler = Arc::new(TaskScheduler::new());
        let _a = scheduler.lock("a").await;
        // A different name must not block.
        let _b = scheduler.lock("b").await;
    }
}
