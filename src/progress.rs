//! Progress reporting capability.
//!
//! Long-running steps (downloads, image write-out) accept an
//! `Option<&dyn Progress>`; passing `None` disables reporting entirely.

use std::sync::Mutex;

/// Identifier handed out by [`Progress::add_task`].
pub type TaskId = usize;

/// A partial update to a task's counters. Unset fields are left untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Update {
    pub total: Option<u64>,
    pub completed: Option<u64>,
    pub advance: Option<u64>,
}

impl Update {
    #[must_use]
    pub const fn total(total: u64) -> Self {
        Self {
            total: Some(total),
            completed: None,
            advance: None,
        }
    }

    #[must_use]
    pub const fn advance(bytes: u64) -> Self {
        Self {
            total: None,
            completed: None,
            advance: Some(bytes),
        }
    }

    #[must_use]
    pub const fn completed(completed: u64, total: u64) -> Self {
        Self {
            total: Some(total),
            completed: Some(completed),
            advance: None,
        }
    }
}

pub trait Progress: Sync {
    /// Registers a new task. Tasks added with `start = false` stay idle
    /// until [`Progress::start_task`] is called.
    fn add_task(&self, description: &str, start: bool, total: Option<u64>) -> TaskId;

    fn start_task(&self, task: TaskId);

    fn stop_task(&self, task: TaskId);

    fn update(&self, task: TaskId, update: Update);
}

#[derive(Debug)]
struct TaskState {
    description: String,
    total: Option<u64>,
    completed: u64,
    /// Last reported tenth of completion, to avoid flooding the log.
    reported_decile: u64,
    running: bool,
}

/// Reports progress as `tracing` events, one per 10% of completion.
#[derive(Debug, Default)]
pub struct LogProgress {
    tasks: Mutex<Vec<TaskState>>,
}

impl LogProgress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_task(&self, task: TaskId, f: impl FnOnce(&mut TaskState)) {
        let Ok(mut tasks) = self.tasks.lock() else {
            return;
        };
        if let Some(state) = tasks.get_mut(task) {
            f(state);
        }
    }
}

impl Progress for LogProgress {
    fn add_task(&self, description: &str, start: bool, total: Option<u64>) -> TaskId {
        let Ok(mut tasks) = self.tasks.lock() else {
            return usize::MAX;
        };
        tasks.push(TaskState {
            description: description.to_owned(),
            total,
            completed: 0,
            reported_decile: 0,
            running: start,
        });
        if start {
            tracing::info!(task = description, "Started");
        }
        tasks.len() - 1
    }

    fn start_task(&self, task: TaskId) {
        self.with_task(task, |state| {
            if !state.running {
                state.running = true;
                tracing::info!(task = %state.description, total = ?state.total, "Started");
            }
        });
    }

    fn stop_task(&self, task: TaskId) {
        self.with_task(task, |state| {
            if state.running {
                state.running = false;
                tracing::info!(
                    task = %state.description,
                    completed = state.completed,
                    "Stopped"
                );
            }
        });
    }

    fn update(&self, task: TaskId, update: Update) {
        self.with_task(task, |state| {
            if let Some(total) = update.total {
                state.total = Some(total);
            }
            if let Some(completed) = update.completed {
                state.completed = completed;
            }
            if let Some(advance) = update.advance {
                state.completed = state.completed.saturating_add(advance);
            }

            let Some(total) = state.total.filter(|total| *total > 0) else {
                return;
            };
            let decile = (state.completed.min(total) * 10) / total;
            if decile > state.reported_decile {
                state.reported_decile = decile;
                tracing::info!(
                    task = %state.description,
                    completed = state.completed,
                    total,
                    "{}% done",
                    decile * 10
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_accumulates_advance() {
        let progress = LogProgress::new();
        let task = progress.add_task("download", false, None);
        progress.update(task, Update::total(100));
        progress.update(task, Update::advance(30));
        progress.update(task, Update::advance(25));

        let tasks = progress.tasks.lock().unwrap();
        assert_eq!(tasks[task].completed, 55);
        assert_eq!(tasks[task].reported_decile, 5);
        assert!(!tasks[task].running);
    }

    #[test]
    fn test_completed_overrides_advance_total() {
        let progress = LogProgress::new();
        let task = progress.add_task("write", true, Some(10));
        progress.update(task, Update::advance(4));
        progress.update(task, Update::completed(10, 20));

        let tasks = progress.tasks.lock().unwrap();
        assert_eq!(tasks[task].completed, 10);
        assert_eq!(tasks[task].total, Some(20));
        assert_eq!(tasks[task].reported_decile, 5);
    }

    #[test]
    fn test_unknown_task_is_ignored() {
        let progress = LogProgress::new();
        progress.update(7, Update::advance(1));
        progress.start_task(7);
        progress.stop_task(7);
        assert!(progress.tasks.lock().unwrap().is_empty());
    }
}
