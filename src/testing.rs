//! In-memory doubles shared by the unit tests.

use chrono::NaiveDateTime;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, UNIX_EPOCH};

use crate::backup_executor::Sleeper;
use crate::config_manager::ServerTarget;
use crate::error::TransferError;
use crate::scheduler::Clock;
use crate::ssh_client::{remote_parent, Connector, RemoteFs, RemoteStat};

#[derive(Debug, Default)]
pub struct MemoryState {
    pub files: BTreeMap<String, RemoteStat>,
    pub dirs: BTreeSet<String>,
    pub uploads: Vec<String>,
    pub mkdirs: usize,
    /// Uploads to these paths fail once.
    pub fail_once: HashSet<String>,
    pub stat_errors: HashSet<String>,
    pub connects: usize,
    /// The next N connects fail.
    pub failing_connects: usize,
    pub always_fail_connect: bool,
    pub closes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }

    pub fn seed_dir(&self, path: &str) {
        self.state().dirs.insert(path.to_string());
    }

    /// Adds a remote file, creating its parent directories.
    pub fn seed_file(&self, path: &str, size: u64, mtime: u64) {
        let mut state = self.state();
        let mut parent = remote_parent(path);
        while let Some(dir) = parent {
            if dir == "/" {
                break;
            }
            state.dirs.insert(dir.to_string());
            parent = remote_parent(dir);
        }
        state.files.insert(
            path.to_string(),
            RemoteStat {
                size,
                mtime,
                is_dir: false,
            },
        );
    }
}

impl Connector for MemoryConnector {
    fn connect(&self, target: &ServerTarget) -> Result<Box<dyn RemoteFs>, TransferError> {
        let mut state = self.state();
        state.connects += 1;
        if state.always_fail_connect || state.failing_connects > 0 {
            state.failing_connects = state.failing_connects.saturating_sub(1);
            return Err(TransferError::Authentication {
                host: target.host.clone(),
                username: target.username.clone(),
                reason: "rejected by test server".to_string(),
            });
        }
        Ok(Box::new(MemoryRemote {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryRemote {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRemote {
    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap()
    }
}

impl RemoteFs for MemoryRemote {
    fn stat(&self, path: &str) -> Result<Option<RemoteStat>, TransferError> {
        let state = self.state();
        if state.stat_errors.contains(path) {
            return Err(TransferError::Remote(format!("permission denied: {}", path)));
        }
        if let Some(stat) = state.files.get(path) {
            return Ok(Some(*stat));
        }
        if path == "/" || state.dirs.contains(path) {
            return Ok(Some(RemoteStat {
                size: 0,
                mtime: 0,
                is_dir: true,
            }));
        }
        Ok(None)
    }

    fn mkdir(&self, path: &str) -> Result<(), TransferError> {
        let mut state = self.state();
        state.mkdirs += 1;
        state.dirs.insert(path.to_string());
        Ok(())
    }

    fn upload(&self, local: &Path, remote: &str) -> Result<u64, TransferError> {
        let mut state = self.state();
        if let Some(parent) = remote_parent(remote) {
            if parent != "/" && !state.dirs.contains(parent) {
                return Err(TransferError::Remote(format!("no such directory: {}", parent)));
            }
        }
        if state.fail_once.remove(remote) {
            return Err(TransferError::Remote(format!("write failed: {}", remote)));
        }
        let size = fs::metadata(local)?.len();
        state.files.insert(
            remote.to_string(),
            RemoteStat {
                size,
                mtime: 0,
                is_dir: false,
            },
        );
        state.uploads.push(remote.to_string());
        Ok(size)
    }

    fn set_times(&self, remote: &str, _atime: u64, mtime: u64) -> Result<(), TransferError> {
        let mut state = self.state();
        match state.files.get_mut(remote) {
            Some(stat) => {
                stat.mtime = mtime;
                Ok(())
            }
            None => Err(TransferError::Remote(format!("no such file: {}", remote))),
        }
    }

    fn close(&mut self) {
        self.state().closes += 1;
    }
}

#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<NaiveDateTime>,
}

impl ManualClock {
    pub fn new(now: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap()
    }
}

/// Whole-second mtime, as an SFTP server would report it.
pub fn local_mtime_secs(path: &Path) -> u64 {
    fs::metadata(path)
        .unwrap()
        .modified()
        .unwrap()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

pub fn server() -> ServerTarget {
    ServerTarget {
        host: "backup.local".to_string(),
        port: 22,
        username: "bak".to_string(),
        password: Some("pw".to_string()),
        key_file: None,
    }
}
