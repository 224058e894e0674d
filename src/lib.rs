pub mod backup_executor;
pub mod backup_history;
pub mod config_manager;
pub mod error;
pub mod logging;
pub mod schedule;
pub mod scheduler;
pub mod ssh_client;
pub mod sync_engine;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use std::sync::{Arc, RwLock, RwLockReadGuard, PoisonError};

use backup_history::BackupHistory;
use config_manager::{AppConfig, BackupTask, ConfigManager, ServerTarget};
use error::ExecutionError;
use scheduler::RunningTasks;

/// Shared state handed to the scheduler, the executor and the CLI.
pub struct AppState {
    config_manager: ConfigManager,
    config: RwLock<AppConfig>,
    pub history: BackupHistory,
    pub running: Arc<RunningTasks>,
}

impl AppState {
    pub fn new(config_manager: ConfigManager, config: AppConfig, history: BackupHistory) -> Self {
        Self {
            config_manager,
            config: RwLock::new(config),
            history,
            running: Arc::new(RunningTasks::default()),
        }
    }

    /// Loads the configuration and the history file it points to.
    pub fn load(config_manager: ConfigManager) -> Result<Self> {
        let config = config_manager.load_config()?;
        let history = match &config.history.file {
            Some(path) => BackupHistory::open(path, config.history.max_entries)?,
            None => BackupHistory::in_memory(config.history.max_entries),
        };
        Ok(Self::new(config_manager, config, history))
    }

    pub fn config_manager(&self) -> &ConfigManager {
        &self.config_manager
    }

    pub fn config(&self) -> RwLockReadGuard<'_, AppConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn replace_config(&self, config: AppConfig) {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Re-reads the configuration file and swaps it in.
    pub fn reload_config(&self) -> Result<AppConfig> {
        let config = self.config_manager.load_config()?;
        self.replace_config(config.clone());
        Ok(config)
    }

    /// Task and server for one run, with the server password decrypted.
    pub fn resolve(&self, task_name: &str) -> Result<(BackupTask, ServerTarget), ExecutionError> {
        let config = self.config();
        let task = config
            .backup_tasks
            .get(task_name)
            .cloned()
            .ok_or_else(|| ExecutionError::TaskNotFound(task_name.to_string()))?;
        let server = config.servers.get(&task.target_server).ok_or_else(|| {
            ExecutionError::ServerNotFound {
                task: task_name.to_string(),
                server: task.target_server.clone(),
            }
        })?;
        let server = self
            .config_manager
            .resolve_server(server)
            .map_err(|e| ExecutionError::Credential {
                server: task.target_server.clone(),
                reason: e.to_string(),
            })?;
        Ok((task, server))
    }
}
