use anyhow::Result;
use chrono::{Local, NaiveDateTime};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backup_executor::BackupExecutor;
use crate::config_manager::{BackupTask, SchedulerConfig};
use crate::schedule::Schedule;
use crate::AppState;

/// Source of the current local wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }
}

/// Names of tasks currently executing.
#[derive(Debug, Default)]
pub struct RunningTasks {
    names: Mutex<HashSet<String>>,
}

impl RunningTasks {
    /// Claims `task_name`, or `None` if it is already running. The claim is
    /// released when the guard drops, including during a panic.
    pub fn try_acquire(self: &Arc<Self>, task_name: &str) -> Option<RunGuard> {
        if !self.lock().insert(task_name.to_string()) {
            return None;
        }
        Some(RunGuard {
            tasks: Arc::clone(self),
            task_name: task_name.to_string(),
        })
    }

    pub fn is_running(&self, task_name: &str) -> bool {
        self.lock().contains(task_name)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().iter().cloned().collect();
        names.sort();
        names
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.names.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct RunGuard {
    tasks: Arc<RunningTasks>,
    task_name: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.tasks.lock().remove(&self.task_name);
    }
}

#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub task_name: String,
    pub schedule: Schedule,
    pub next_run: NaiveDateTime,
}

pub struct Scheduler {
    state: Arc<AppState>,
    executor: Arc<BackupExecutor>,
    clock: Arc<dyn Clock>,
    jobs: Vec<ScheduledJob>,
    in_flight: Vec<(String, JoinHandle<bool>)>,
    watch_config: bool,
    config_stamp: Option<SystemTime>,
}

impl Scheduler {
    pub fn new(executor: Arc<BackupExecutor>) -> Self {
        Self {
            state: Arc::clone(executor.state()),
            executor,
            clock: Arc::new(LocalClock),
            jobs: Vec::new(),
            in_flight: Vec::new(),
            watch_config: false,
            config_stamp: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Reload the config file and reschedule whenever it changes on disk.
    pub fn watch_config(mut self, watch: bool) -> Self {
        self.watch_config = watch;
        self
    }

    pub fn jobs(&self) -> &[ScheduledJob] {
        &self.jobs
    }

    /// Replaces all jobs. Tasks with a bad schedule are logged and left out.
    pub fn setup_schedules(&mut self, tasks: &BTreeMap<String, BackupTask>) -> usize {
        self.jobs.clear();
        let now = self.clock.now();

        for (name, task) in tasks {
            if task.schedule.trim().is_empty() {
                warn!(task = %name, "no schedule configured");
                continue;
            }
            match Schedule::parse(&task.schedule) {
                Ok(schedule) => {
                    let next_run = schedule.next_fire(now);
                    info!(task = %name, schedule = %schedule, next_run = %next_run, "task scheduled");
                    self.jobs.push(ScheduledJob {
                        task_name: name.clone(),
                        schedule,
                        next_run,
                    });
                }
                Err(e) => {
                    error!(task = %name, schedule = %task.schedule, error = %e, "invalid schedule, task will not run");
                }
            }
        }
        self.jobs.len()
    }

    pub fn is_backup_running(&self) -> bool {
        !self.state.running.is_empty()
    }

    /// Dispatches every due job and returns how many were started.
    pub fn run_pending(&mut self) -> usize {
        let now = self.clock.now();
        let mut due = Vec::new();
        for job in self.jobs.iter_mut() {
            if job.next_run <= now {
                job.next_run = job.schedule.next_fire(now);
                debug!(task = %job.task_name, next_run = %job.next_run, "job due");
                due.push(job.task_name.clone());
            }
        }

        let mut started = 0;
        for task_name in &due {
            if self.dispatch(task_name) {
                started += 1;
            }
        }
        started
    }

    /// Starts `task_name` on a blocking worker unless it is already running.
    pub fn dispatch(&mut self, task_name: &str) -> bool {
        let Some(guard) = self.state.running.try_acquire(task_name) else {
            warn!(task = %task_name, "task is still running, skipping this trigger");
            return false;
        };

        let executor = Arc::clone(&self.executor);
        let name = task_name.to_string();
        let handle = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            info!(task = %name, "scheduled backup started");
            let success = executor.execute_backup(&name);
            if success {
                info!(task = %name, "scheduled backup succeeded");
            } else {
                error!(task = %name, "scheduled backup failed");
            }
            success
        });
        self.in_flight.push((task_name.to_string(), handle));
        true
    }

    /// Waits for every dispatched run to finish.
    pub async fn wait_for_running(&mut self) {
        for (name, handle) in self.in_flight.drain(..) {
            if let Err(e) = handle.await {
                error!(task = %name, error = %e, "backup worker terminated abnormally");
            }
        }
    }

    async fn reap_finished(&mut self) {
        let (finished, running): (Vec<_>, Vec<_>) = self
            .in_flight
            .drain(..)
            .partition(|(_, handle)| handle.is_finished());
        self.in_flight = running;
        for (name, handle) in finished {
            if let Err(e) = handle.await {
                error!(task = %name, error = %e, "backup worker terminated abnormally");
            }
        }
    }

    fn refresh_config(&mut self) -> Result<()> {
        if !self.watch_config {
            return Ok(());
        }
        let modified = self.state.config_manager().modified()?;
        if self.config_stamp == Some(modified) {
            return Ok(());
        }
        let first_check = self.config_stamp.is_none();
        self.config_stamp = Some(modified);
        if first_check {
            return Ok(());
        }

        info!("configuration changed, reloading schedules");
        let config = self.state.reload_config()?;
        for warning in config.validate() {
            warn!("{}", warning);
        }
        self.setup_schedules(&config.backup_tasks);
        Ok(())
    }

    /// One polling cycle. A failed reload keeps the current jobs, which are
    /// still dispatched before the error is returned.
    pub async fn tick(&mut self) -> Result<usize> {
        let refreshed = self.refresh_config();
        if let Err(e) = &refreshed {
            error!(error = %e, "configuration reload failed, keeping current schedules");
        }
        self.reap_finished().await;
        let started = self.run_pending();
        refreshed.map(|_| started)
    }

    /// Polls forever. Errors in a cycle are logged and followed by a pause.
    pub async fn run(&mut self) {
        info!(jobs = self.jobs.len(), "backup scheduler started");

        loop {
            let (poll, pause) = loop_intervals(&self.state.config().scheduler);

            match self.tick().await {
                Ok(_) => tokio::time::sleep(poll).await,
                Err(e) => {
                    error!(error = %e, "scheduler cycle failed");
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }
}

/// Poll interval and error pause, both at least one second.
fn loop_intervals(config: &SchedulerConfig) -> (Duration, Duration) {
    (
        Duration::from_secs(config.poll_interval_secs.max(1)),
        Duration::from_secs(config.error_pause_secs.max(1)),
    )
}
