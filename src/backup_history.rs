use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HistoryRecord {
    pub task_name: String,
    pub timestamp: DateTime<Local>,
    pub success: bool,
    pub details: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct TaskStatistics {
    pub successful_backups: usize,
    pub failed_backups: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BackupStatistics {
    pub total_backups: usize,
    pub successful_backups: usize,
    pub failed_backups: usize,
    pub success_rate: f64,
    pub last_backup: Option<DateTime<Local>>,
    pub per_task: BTreeMap<String, TaskStatistics>,
    /// Runs per calendar day (`YYYY-MM-DD`).
    pub per_day: BTreeMap<String, usize>,
}

/// Bounded run log, oldest entries evicted first. Optionally mirrored to a
/// JSON file after every append.
pub struct BackupHistory {
    entries: Mutex<VecDeque<HistoryRecord>>,
    max_entries: usize,
    history_path: Option<PathBuf>,
}

impl BackupHistory {
    pub fn in_memory(max_entries: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_entries: max_entries.max(1),
            history_path: None,
        }
    }

    /// Loads an existing history file, keeping only the newest `max_entries`.
    pub fn open(history_path: impl Into<PathBuf>, max_entries: usize) -> Result<Self> {
        let history_path = history_path.into();
        let max_entries = max_entries.max(1);

        let mut entries = VecDeque::new();
        if history_path.exists() {
            let json = fs::read_to_string(&history_path).with_context(|| {
                format!("failed to read history file {}", history_path.display())
            })?;
            let records: Vec<HistoryRecord> = serde_json::from_str(&json)
                .map_err(|e| anyhow!("failed to parse history file: {}", e))?;
            entries.extend(records);
            while entries.len() > max_entries {
                entries.pop_front();
            }
        }
        debug!(path = %history_path.display(), entries = entries.len(), "history loaded");

        Ok(Self {
            entries: Mutex::new(entries),
            max_entries,
            history_path: Some(history_path),
        })
    }

    /// Appends one record. Persistence failures are logged, never returned.
    pub fn record_run(&self, task_name: &str, success: bool, details: &str) -> HistoryRecord {
        let record = HistoryRecord {
            task_name: task_name.to_string(),
            timestamp: Local::now(),
            success,
            details: details.to_string(),
        };

        let mut entries = self.lock();
        entries.push_back(record.clone());
        while entries.len() > self.max_entries {
            entries.pop_front();
        }

        if let Err(e) = self.save(&entries) {
            error!(error = %e, "failed to save backup history");
        }
        record
    }

    /// All records, oldest first.
    pub fn records(&self) -> Vec<HistoryRecord> {
        self.lock().iter().cloned().collect()
    }

    /// Newest first; `limit == 0` returns everything.
    pub fn recent(&self, limit: usize) -> Vec<HistoryRecord> {
        let entries = self.lock();
        let take = if limit == 0 { entries.len() } else { limit };
        entries.iter().rev().take(take).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn statistics(&self) -> BackupStatistics {
        let entries = self.lock();

        let total_backups = entries.len();
        let successful_backups = entries.iter().filter(|r| r.success).count();
        let failed_backups = total_backups - successful_backups;

        let success_rate = if total_backups > 0 {
            (successful_backups as f64 / total_backups as f64) * 100.0
        } else {
            0.0
        };

        let mut per_task: BTreeMap<String, TaskStatistics> = BTreeMap::new();
        let mut per_day: BTreeMap<String, usize> = BTreeMap::new();
        for record in entries.iter() {
            let task = per_task.entry(record.task_name.clone()).or_default();
            if record.success {
                task.successful_backups += 1;
            } else {
                task.failed_backups += 1;
            }
            *per_day
                .entry(record.timestamp.format("%Y-%m-%d").to_string())
                .or_default() += 1;
        }

        BackupStatistics {
            total_backups,
            successful_backups,
            failed_backups,
            success_rate,
            last_backup: entries.iter().map(|r| r.timestamp).max(),
            per_task,
            per_day,
        }
    }

    pub fn clear(&self) -> Result<()> {
        let mut entries = self.lock();
        entries.clear();
        self.save(&entries)
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<HistoryRecord>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self, entries: &VecDeque<HistoryRecord>) -> Result<()> {
        let Some(path) = &self.history_path else {
            return Ok(());
        };

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("failed to create history directory")?;
        }
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| anyhow!("failed to serialize history: {}", e))?;
        fs::write(path, json)
            .with_context(|| format!("failed to write history file {}", path.display()))?;
        Ok(())
    }
}
