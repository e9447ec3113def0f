//! Periodic background tasks that run against the public [`Database`] API.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::Database;
use crate::types::{EngineError, Result};

/// A job run on a fixed interval by the [`Scheduler`].
pub trait ScheduledTask: Send + 'static {
    /// Name used for the thread and in logs.
    fn name(&self) -> &str;
    /// Delay between runs.
    fn interval(&self) -> Duration;
    /// One run. Errors are logged and the task keeps its schedule.
    fn run(&mut self, db: &Database) -> Result<()>;
}

enum TaskMessage {
    Trigger,
    Shutdown,
}

struct TaskHandle {
    name: String,
    sender: Sender<TaskMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

/// Runs each registered task on its own thread.
pub struct Scheduler {
    db: Database,
    tasks: Vec<TaskHandle>,
}

impl Scheduler {
    /// Scheduler with no tasks.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            tasks: Vec::new(),
        }
    }

    /// Scheduler running the periodic checkpoint and vacuum tasks.
    pub fn with_maintenance(db: Database, every: Duration) -> Result<Self> {
        let mut scheduler = Self::new(db);
        scheduler.spawn(CheckpointTask::new(every))?;
        scheduler.spawn(VacuumTask::new(every))?;
        Ok(scheduler)
    }

    /// Starts `task` on a dedicated thread.
    pub fn spawn(&mut self, task: impl ScheduledTask) -> Result<()> {
        let (sender, receiver) = mpsc::channel();
        let name = task.name().to_owned();
        let db = self.db.clone();
        let thread = thread::Builder::new()
            .name(format!("engramdb-{name}"))
            .spawn(move || task_loop(task, db, receiver))?;
        debug!(task = %name, "scheduler.spawn");
        self.tasks.push(TaskHandle {
            name,
            sender,
            thread: Some(thread),
        });
        Ok(())
    }

    /// Runs the named task now, outside its schedule.
    pub fn trigger(&self, name: &str) -> Result<()> {
        let task = self
            .tasks
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| EngineError::InvalidOwned(format!("no scheduled task named `{name}`")))?;
        task.sender
            .send(TaskMessage::Trigger)
            .map_err(|_| EngineError::Invalid("scheduled task has stopped"))
    }

    /// Names of the registered tasks.
    pub fn task_names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }

    /// Stops every task and waits for the threads to exit.
    pub fn shutdown(&mut self) {
        for task in &self.tasks {
            let _ = task.sender.send(TaskMessage::Shutdown);
        }
        for task in &mut self.tasks {
            if let Some(handle) = task.thread.take() {
                if handle.join().is_err() {
                    warn!(task = %task.name, "scheduler.task_panicked");
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn task_loop(mut task: impl ScheduledTask, db: Database, receiver: Receiver<TaskMessage>) {
    loop {
        match receiver.recv_timeout(task.interval()) {
            Ok(TaskMessage::Trigger) | Err(RecvTimeoutError::Timeout) => {
                if db.is_closed() {
                    break;
                }
                if let Err(err) = task.run(&db) {
                    warn!(task = task.name(), %err, "scheduler.task_failed");
                }
            }
            Ok(TaskMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(task = task.name(), "scheduler.task_exit");
}

/// Writes a checkpoint when commits happened since the last run.
pub struct CheckpointTask {
    every: Duration,
    last_commit: u64,
}

impl CheckpointTask {
    /// Task running every `every`.
    pub fn new(every: Duration) -> Self {
        Self {
            every,
            last_commit: 0,
        }
    }
}

impl ScheduledTask for CheckpointTask {
    fn name(&self) -> &str {
        "checkpoint"
    }

    fn interval(&self) -> Duration {
        self.every
    }

    fn run(&mut self, db: &Database) -> Result<()> {
        let visible = db.visible_commit();
        if visible == self.last_commit {
            return Ok(());
        }
        db.checkpoint()?;
        self.last_commit = visible;
        Ok(())
    }
}

/// Prunes MVCC versions no open snapshot can read.
pub struct VacuumTask {
    every: Duration,
}

impl VacuumTask {
    /// Task running every `every`.
    pub fn new(every: Duration) -> Self {
        Self { every }
    }
}

impl ScheduledTask for VacuumTask {
    fn name(&self) -> &str {
        "vacuum"
    }

    fn interval(&self) -> Duration {
        self.every
    }

    fn run(&mut self, db: &Database) -> Result<()> {
        let stats = db.vacuum();
        if stats.versions_removed > 0 {
            debug!(removed = stats.versions_removed, "scheduler.vacuum");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::config::Config;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Counting(Arc<AtomicUsize>);

    impl ScheduledTask for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_secs(3600)
        }

        fn run(&mut self, _db: &Database) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn trigger_runs_task_and_shutdown_joins() {
        let db = Database::open_in_memory(Config::default()).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let mut scheduler = Scheduler::new(db);
        scheduler.spawn(Counting(Arc::clone(&runs))).unwrap();
        scheduler.trigger("counting").unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while runs.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(scheduler.trigger("missing").is_err());
        scheduler.shutdown();
        assert!(scheduler.trigger("counting").is_err());
    }
}
