use chrono::{DateTime, Local};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::ssh_client::{remote_join, TransferClient, UploadOutcome};

/// Counters for one execution. Counters are reset per attempt, so after a
/// run they describe the last attempt only; `start_time` covers the whole run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    pub total_files: usize,
    pub total_bytes: u64,
    pub success_files: usize,
    pub failed_files: usize,
    pub skipped_files: usize,
}

impl RunStats {
    pub fn start() -> Self {
        Self {
            start_time: Local::now(),
            end_time: None,
            total_files: 0,
            total_bytes: 0,
            success_files: 0,
            failed_files: 0,
            skipped_files: 0,
        }
    }

    pub fn reset_counters(&mut self) {
        self.total_files = 0;
        self.total_bytes = 0;
        self.success_files = 0;
        self.failed_files = 0;
        self.skipped_files = 0;
    }

    pub fn finish(&mut self) {
        self.end_time = Some(Local::now());
    }

    fn record(&mut self, size: u64, outcome: &UploadOutcome) {
        self.total_files += 1;
        self.total_bytes += size;
        match outcome {
            UploadOutcome::Uploaded { .. } => self.success_files += 1,
            UploadOutcome::Skipped => self.skipped_files += 1,
            UploadOutcome::Failed(_) => self.failed_files += 1,
        }
    }

    /// Lines logged once at the end of an execution.
    pub fn summary_lines(&self, task_name: &str) -> Vec<String> {
        let end = self
            .end_time
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        vec![
            "-".repeat(50),
            format!("Backup summary - {}", task_name),
            format!("Started:  {}", self.start_time.format("%Y-%m-%d %H:%M:%S")),
            format!("Finished: {}", end),
            format!("Files:    {}", self.total_files),
            format!("Size:     {}", format_size(self.total_bytes)),
            format!("Uploaded: {} file(s)", self.success_files),
            format!("Failed:   {} file(s)", self.failed_files),
            format!("Skipped:  {} file(s) (already up to date)", self.skipped_files),
            "-".repeat(50),
        ]
    }

    pub fn describe(&self) -> String {
        format!(
            "{} file(s), {} uploaded, {} skipped, {} failed, {}",
            self.total_files,
            self.success_files,
            self.skipped_files,
            self.failed_files,
            format_size(self.total_bytes)
        )
    }
}

/// Uploads a file or a whole directory tree to `dest`.
///
/// Returns `true` when every file was uploaded or skipped. A missing source
/// fails without touching the client.
pub fn backup_path(
    client: &mut TransferClient,
    source: &Path,
    dest: &str,
    stats: &mut RunStats,
) -> bool {
    if !source.exists() {
        error!(source = %source.display(), "source path does not exist");
        return false;
    }

    if source.is_dir() {
        backup_directory(client, source, dest, stats)
    } else {
        backup_file(client, source, dest, stats)
    }
}

fn backup_directory(
    client: &mut TransferClient,
    source: &Path,
    dest: &str,
    stats: &mut RunStats,
) -> bool {
    info!(source = %source.display(), destination = %dest, "backing up directory");

    let mut all_ok = true;
    let mut total = 0usize;
    let mut ok = 0usize;

    for entry in WalkDir::new(source) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(source = %source.display(), error = %e, "cannot read directory entry");
                all_ok = false;
                continue;
            }
        };
        // Links are not followed; a link to a directory is skipped like one.
        if entry.file_type().is_dir() || (entry.path_is_symlink() && entry.path().is_dir()) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(source) else {
            continue;
        };

        total += 1;
        let Some(remote) = remote_join(dest, relative) else {
            warn!(source = %entry.path().display(), "file name is not valid UTF-8, not uploaded");
            stats.record(0, &UploadOutcome::Failed("file name is not valid UTF-8".to_string()));
            all_ok = false;
            continue;
        };
        if backup_file(client, entry.path(), &remote, stats) {
            ok += 1;
        } else {
            all_ok = false;
        }
    }

    if all_ok {
        info!(source = %source.display(), "directory backup complete: {}/{} files", ok, total);
    } else {
        warn!(
            source = %source.display(),
            "directory backup incomplete: {}/{} files succeeded",
            ok,
            total
        );
    }
    all_ok
}

fn backup_file(
    client: &mut TransferClient,
    source: &Path,
    dest: &str,
    stats: &mut RunStats,
) -> bool {
    let size = match fs::metadata(source) {
        Ok(metadata) => metadata.len(),
        Err(e) => {
            error!(source = %source.display(), error = %e, "cannot stat source file");
            stats.record(0, &UploadOutcome::Failed(e.to_string()));
            return false;
        }
    };

    debug!(source = %source.display(), size = %format_size(size), "backing up file");
    let outcome = client.upload_file(source, dest);
    stats.record(size, &outcome);

    match &outcome {
        UploadOutcome::Skipped => debug!(source = %source.display(), destination = %dest, "skipped"),
        UploadOutcome::Uploaded { .. } => {}
        UploadOutcome::Failed(reason) => {
            error!(source = %source.display(), destination = %dest, reason = %reason, "file backup failed")
        }
    }
    outcome.succeeded()
}

/// Human-readable byte count, e.g. `1.50 KB`.
pub fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB", "TB"] {
        if size < 1024.0 {
            return format!("{:.2} {}", size, unit);
        }
        size /= 1024.0;
    }
    format!("{:.2} PB", size)
}
