use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config_manager::{BackupTask, ServerTarget};
use crate::error::{AttemptError, ExecutionError};
use crate::ssh_client::{Connector, TransferClient};
use crate::sync_engine::{self, RunStats};
use crate::AppState;

/// Waits between retries.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Outcome of one `execute` call.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub task_name: String,
    pub success: bool,
    pub attempts: u32,
    pub stats: RunStats,
    pub error: Option<String>,
}

impl ExecutionReport {
    /// Text stored in the history record.
    pub fn details(&self) -> String {
        let mut details = format!("{}; {} attempt(s)", self.stats.describe(), self.attempts);
        if let Some(error) = &self.error {
            details.push_str("; ");
            details.push_str(error);
        }
        details
    }
}

/// Runs one task with its retry policy and records the result.
pub struct BackupExecutor {
    state: Arc<AppState>,
    connector: Arc<dyn Connector>,
    sleeper: Arc<dyn Sleeper>,
}

impl BackupExecutor {
    pub fn new(state: Arc<AppState>, connector: Arc<dyn Connector>) -> Self {
        Self {
            state,
            connector,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn execute_backup(&self, task_name: &str) -> bool {
        self.execute(task_name).success
    }

    /// Manual entry point. Shares the scheduler's overlap guard, so a manual
    /// run and a scheduled run of the same task never overlap.
    pub fn run_now(&self, task_name: &str) -> Result<ExecutionReport, ExecutionError> {
        let _guard = self
            .state
            .running
            .try_acquire(task_name)
            .ok_or_else(|| ExecutionError::AlreadyRunning(task_name.to_string()))?;
        info!(task = %task_name, "manual backup started");
        Ok(self.execute(task_name))
    }

    pub fn execute(&self, task_name: &str) -> ExecutionReport {
        let mut stats = RunStats::start();
        debug!(task = %task_name, "executing backup task");

        let (success, attempts, error) = match self.state.resolve(task_name) {
            Ok((task, server)) => self.run_attempts(&task, &server, &mut stats),
            Err(e) => {
                error!(task = %task_name, error = %e, "configuration error");
                (false, 0, Some(e.to_string()))
            }
        };

        stats.finish();
        for line in stats.summary_lines(task_name) {
            info!("{}", line);
        }

        let report = ExecutionReport {
            task_name: task_name.to_string(),
            success,
            attempts,
            stats,
            error,
        };
        self.state
            .history
            .record_run(task_name, report.success, &report.details());
        report
    }

    fn run_attempts(
        &self,
        task: &BackupTask,
        server: &ServerTarget,
        stats: &mut RunStats,
    ) -> (bool, u32, Option<String>) {
        let max_attempts = task.retry_times;
        if max_attempts == 0 {
            let e = ExecutionError::NoAttempts(task.name.clone());
            warn!(task = %task.name, error = %e, "backup not attempted");
            return (false, 0, Some(e.to_string()));
        }
        let mut attempts = 0;
        let mut last_error = None;

        while attempts < max_attempts {
            attempts += 1;
            debug!(task = %task.name, attempt = attempts, max_attempts, "starting attempt");
            stats.reset_counters();

            match self.attempt(task, server, stats) {
                Ok(()) => {
                    info!(task = %task.name, attempt = attempts, "backup succeeded");
                    return (true, attempts, None);
                }
                Err(e) => {
                    warn!(task = %task.name, host = %server.host, attempt = attempts, error = %e, "attempt failed");
                    let retryable = e.is_retryable();
                    last_error = Some(e.to_string());
                    if !retryable {
                        break;
                    }
                }
            }

            if attempts < max_attempts {
                info!(task = %task.name, "retrying in {} seconds", task.retry_interval);
                self.sleeper.sleep(task.retry_delay());
            }
        }

        (false, attempts, last_error)
    }

    /// One attempt; panics inside are turned into a failed attempt.
    fn attempt(
        &self,
        task: &BackupTask,
        server: &ServerTarget,
        stats: &mut RunStats,
    ) -> Result<(), AttemptError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.sync_once(task, server, stats)))
            .unwrap_or_else(|payload| {
                let message = panic_message(payload.as_ref());
                error!(task = %task.name, error = %message, "attempt aborted unexpectedly");
                Err(AttemptError::Panicked(message))
            })
    }

    fn sync_once(
        &self,
        task: &BackupTask,
        server: &ServerTarget,
        stats: &mut RunStats,
    ) -> Result<(), AttemptError> {
        if !task.source_path.exists() {
            error!(task = %task.name, source = %task.source_path.display(), "source path does not exist");
            return Err(AttemptError::SourceMissing(task.source_path.clone()));
        }

        // Connects on the first upload, so a run with nothing to send never
        // needs the server.
        let mut client = TransferClient::new(Arc::clone(&self.connector), server.clone());
        let ok = sync_engine::backup_path(&mut client, &task.source_path, &task.target_path, stats);
        let unreachable = client.is_unreachable();
        client.close();

        if ok {
            Ok(())
        } else if unreachable {
            Err(AttemptError::Connect(server.address()))
        } else {
            Err(AttemptError::FilesFailed {
                failed: stats.failed_files,
                total: stats.total_files,
            })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup_history::BackupHistory;
    use crate::config_manager::{AppConfig, ConfigManager};
    use crate::error::TransferError;
    use crate::ssh_client::RemoteFs;
    use crate::testing::{local_mtime_secs, server, MemoryConnector, RecordingSleeper};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn task(name: &str, source: &Path, retry_times: u32, retry_interval: u64) -> BackupTask {
        BackupTask {
            name: name.to_string(),
            source_path: source.to_path_buf(),
            target_server: "backup1".to_string(),
            target_path: "/srv/backup".to_string(),
            schedule: "02:30".to_string(),
            retry_times,
            retry_interval,
        }
    }

    fn state_with(tasks: Vec<BackupTask>) -> Arc<AppState> {
        let mut config = AppConfig::default();
        config.servers.insert("backup1".to_string(), server());
        for task in tasks {
            config.backup_tasks.insert(task.name.clone(), task);
        }
        Arc::new(AppState::new(
            ConfigManager::with_path("config.yaml"),
            config,
            BackupHistory::in_memory(100),
        ))
    }

    fn executor(
        state: &Arc<AppState>,
        connector: &MemoryConnector,
        sleeper: &Arc<RecordingSleeper>,
    ) -> BackupExecutor {
        let sleeper: Arc<dyn Sleeper> = sleeper.clone();
        BackupExecutor::new(Arc::clone(state), Arc::new(connector.clone())).with_sleeper(sleeper)
    }

    fn source_tree(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, contents) in files {
            fs::write(dir.path().join(name), contents).unwrap();
        }
        dir
    }

    #[test]
    fn persistent_failure_uses_every_attempt() {
        let dir = source_tree(&[("a", "1")]);
        let state = state_with(vec![task("t", dir.path(), 3, 7)]);
        let connector = MemoryConnector::new();
        connector.state().always_fail_connect = true;
        let sleeper = Arc::new(RecordingSleeper::default());

        let report = executor(&state, &connector, &sleeper).execute("t");

        assert!(!report.success);
        assert_eq!(report.attempts, 3);
        assert_eq!(connector.state().connects, 3);
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(7); 2]);

        let records = state.history.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
        assert!(records[0].details.contains("could not connect"));
    }

    #[test]
    fn first_success_stops_retrying() {
        let dir = source_tree(&[("a", "1")]);
        let state = state_with(vec![task("t", dir.path(), 3, 7)]);
        let connector = MemoryConnector::new();
        let sleeper = Arc::new(RecordingSleeper::default());

        assert!(executor(&state, &connector, &sleeper).execute_backup("t"));
        assert_eq!(connector.state().connects, 1);
        assert!(sleeper.slept().is_empty());
        assert_eq!(state.history.len(), 1);
    }

    #[test]
    fn transient_failure_then_success() {
        let dir = source_tree(&[("a", "1")]);
        let state = state_with(vec![task("t", dir.path(), 3, 5)]);
        let connector = MemoryConnector::new();
        connector.state().failing_connects = 1;
        let sleeper = Arc::new(RecordingSleeper::default());

        let report = executor(&state, &connector, &sleeper).execute("t");

        assert!(report.success);
        assert_eq!(report.attempts, 2);
        assert_eq!(sleeper.slept(), vec![Duration::from_secs(5)]);
    }

    #[test]
    fn stats_reflect_the_last_attempt_only() {
        let dir = source_tree(&[("a", "1"), ("b", "22"), ("c", "333")]);
        let state = state_with(vec![task("t", dir.path(), 3, 1)]);
        let connector = MemoryConnector::new();
        connector.seed_dir("/srv/backup");
        connector.state().fail_once.insert("/srv/backup/b".to_string());
        let sleeper = Arc::new(RecordingSleeper::default());

        let report = executor(&state, &connector, &sleeper).execute("t");

        assert!(report.success);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.stats.total_files, 3);
        assert_eq!(report.stats.success_files, 1);
        assert_eq!(report.stats.skipped_files, 2);
        assert_eq!(report.stats.failed_files, 0);
        assert!(report.stats.end_time.is_some());
    }

    #[test]
    fn missing_task_or_server_fails_without_attempts() {
        let dir = source_tree(&[("a", "1")]);
        let mut orphan = task("orphan", dir.path(), 3, 1);
        orphan.target_server = "nowhere".to_string();
        let state = state_with(vec![orphan]);
        let connector = MemoryConnector::new();
        let sleeper = Arc::new(RecordingSleeper::default());
        let executor = executor(&state, &connector, &sleeper);

        let missing = executor.execute("ghost");
        assert!(!missing.success);
        assert_eq!(missing.attempts, 0);

        let orphaned = executor.execute("orphan");
        assert!(!orphaned.success);
        assert_eq!(orphaned.attempts, 0);
        assert!(orphaned.error.unwrap().contains("nowhere"));

        assert_eq!(connector.state().connects, 0);
        assert!(sleeper.slept().is_empty());
        assert_eq!(state.history.len(), 2);
    }

    #[test]
    fn missing_source_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let state = state_with(vec![task("t", &dir.path().join("gone"), 3, 1)]);
        let connector = MemoryConnector::new();
        let sleeper = Arc::new(RecordingSleeper::default());

        let report = executor(&state, &connector, &sleeper).execute("t");

        assert!(!report.success);
        assert_eq!(report.attempts, 1);
        assert_eq!(connector.state().connects, 0);
        assert!(sleeper.slept().is_empty());
    }

    #[test]
    fn zero_retry_times_makes_no_attempt() {
        let dir = source_tree(&[("a", "1")]);
        let state = state_with(vec![task("t", dir.path(), 0, 1)]);
        let connector = MemoryConnector::new();
        let sleeper = Arc::new(RecordingSleeper::default());

        let report = executor(&state, &connector, &sleeper).execute("t");
        assert!(!report.success);
        assert_eq!(report.attempts, 0);
        assert_eq!(
            report.error.as_deref(),
            Some("task t allows no attempts (retry_times is 0)")
        );
        assert_eq!(connector.state().connects, 0);

        let records = state.history.records();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
    }

    #[test]
    fn empty_source_needs_no_connection() {
        let dir = TempDir::new().unwrap();
        let state = state_with(vec![task("t", dir.path(), 3, 1)]);
        let connector = MemoryConnector::new();
        connector.state().always_fail_connect = true;
        let sleeper = Arc::new(RecordingSleeper::default());

        let report = executor(&state, &connector, &sleeper).execute("t");
        assert!(report.success);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.stats.total_files, 0);
        assert_eq!(connector.state().connects, 0);
    }

    #[test]
    fn unreachable_server_is_dialed_once_per_attempt() {
        let dir = source_tree(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let state = state_with(vec![task("t", dir.path(), 2, 1)]);
        let connector = MemoryConnector::new();
        connector.state().always_fail_connect = true;
        let sleeper = Arc::new(RecordingSleeper::default());

        let report = executor(&state, &connector, &sleeper).execute("t");
        assert!(!report.success);
        assert_eq!(report.attempts, 2);
        assert_eq!(connector.state().connects, 2);
        assert_eq!(report.stats.failed_files, 3);
        assert_eq!(
            report.error.as_deref(),
            Some("could not connect to backup.local:22")
        );
    }

    #[test]
    fn panicking_transport_counts_as_failed_attempt() {
        struct PanickingConnector;
        impl Connector for PanickingConnector {
            fn connect(&self, _: &ServerTarget) -> Result<Box<dyn RemoteFs>, TransferError> {
                panic!("transport exploded");
            }
        }

        let dir = source_tree(&[("a", "1")]);
        let state = state_with(vec![task("t", dir.path(), 2, 3)]);
        let sleeper = Arc::new(RecordingSleeper::default());
        let sleeper_dyn: Arc<dyn Sleeper> = sleeper.clone();
        let executor = BackupExecutor::new(Arc::clone(&state), Arc::new(PanickingConnector))
            .with_sleeper(sleeper_dyn);

        let report = executor.execute("t");
        assert!(!report.success);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.error.as_deref(), Some("attempt aborted: transport exploded"));
        assert_eq!(sleeper.slept().len(), 1);
    }

    #[test]
    fn run_now_respects_the_overlap_guard() {
        let dir = source_tree(&[("a", "1")]);
        let state = state_with(vec![task("t", dir.path(), 1, 1)]);
        let connector = MemoryConnector::new();
        let sleeper = Arc::new(RecordingSleeper::default());
        let executor = executor(&state, &connector, &sleeper);

        let guard = state.running.try_acquire("t").unwrap();
        assert_eq!(
            executor.run_now("t").unwrap_err(),
            ExecutionError::AlreadyRunning("t".to_string())
        );
        drop(guard);

        assert!(executor.run_now("t").unwrap().success);
        assert!(!state.running.is_running("t"));
    }

    #[test]
    fn nightly_scenario_with_one_identical_file() {
        let dir = source_tree(&[("one.txt", "1"), ("two.txt", "22"), ("three.txt", "333")]);
        let state = state_with(vec![task("nightly", dir.path(), 3, 300)]);
        let connector = MemoryConnector::new();
        connector.seed_file(
            "/srv/backup/two.txt",
            2,
            local_mtime_secs(&dir.path().join("two.txt")),
        );
        let sleeper = Arc::new(RecordingSleeper::default());

        let report = executor(&state, &connector, &sleeper).execute("nightly");

        assert!(report.success);
        assert_eq!(report.stats.total_files, 3);
        assert_eq!(report.stats.skipped_files, 1);
        assert_eq!(report.stats.success_files, 2);
        assert_eq!(report.stats.failed_files, 0);

        let records = state.history.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task_name, "nightly");
        assert!(records[0].success);
    }
}
