//! Cleanup sweep over the session log directory.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::policy::{RetentionPolicy, Verdict};
use crate::sessions::{ActiveRegistry, SessionId};

/// A per-file failure collected during a sweep.
#[derive(Debug, Clone, Serialize)]
pub struct SweepError {
    pub file_name: String,
    pub message: String,
}

/// Outcome of one cleanup sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub directory: PathBuf,
    /// Directory entries looked at.
    pub scanned: usize,
    /// Files deleted, emergency deletions included.
    pub deleted: usize,
    /// Subset of `deleted` removed for exceeding the emergency age.
    pub deleted_emergency: usize,
    /// Unregistered files still inside the retention window.
    pub retained: usize,
    /// Files skipped because their session is registered.
    pub skipped_active: usize,
    /// Idle sessions force-completed before the scan.
    pub evicted: usize,
    pub unrecognized: Vec<String>,
    pub errors: Vec<SweepError>,
}

impl SweepReport {
    fn new(directory: &Path, now: SystemTime) -> Self {
        Self {
            started_at: now.into(),
            directory: directory.to_path_buf(),
            ..Self::default()
        }
    }

    fn error(&mut self, file_name: impl Into<String>, error: &io::Error) {
        let file_name = file_name.into();
        tracing::warn!(file = %file_name, "streaming log cleanup error: {error}");
        self.errors.push(SweepError {
            file_name,
            message: error.to_string(),
        });
    }

    fn record_deletion(&mut self, file_name: &str, verdict: Verdict) {
        self.deleted += 1;
        if verdict == Verdict::Emergency {
            self.deleted_emergency += 1;
            tracing::warn!(file = file_name, "deleted streaming log past emergency age");
        } else {
            tracing::debug!(file = file_name, "deleted expired streaming log");
        }
    }
}

/// Delete every unregistered log file in the registry's directory whose age
/// exceeds the policy, as seen from `now`.
///
/// Membership and age are first checked without the registry lock; each
/// deletion candidate is then re-checked and unlinked while the lock is held,
/// so a session that registers or completes mid-sweep is left for the next
/// sweep. Per-file failures are collected and never abort the sweep.
pub fn sweep_directory(
    registry: &ActiveRegistry,
    policy: &RetentionPolicy,
    now: SystemTime,
) -> SweepReport {
    let directory = registry.directory();
    let mut report = SweepReport::new(directory, now);

    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(error) => {
            report.error(directory.display().to_string(), &error);
            return report;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                report.error(directory.display().to_string(), &error);
                continue;
            }
        };
        report.scanned += 1;

        let file_name = entry.file_name().to_string_lossy().into_owned();
        let Some(session_id) = SessionId::from_file_name(&file_name) else {
            report.unrecognized.push(file_name);
            continue;
        };

        if registry.contains(&session_id) {
            report.skipped_active += 1;
            continue;
        }

        let path = entry.path();
        let metadata = match std::fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
            Err(error) => {
                report.error(file_name, &error);
                continue;
            }
        };
        if !metadata.is_file() {
            report.unrecognized.push(file_name);
            continue;
        }
        let modified = match metadata.modified() {
            Ok(modified) => modified,
            Err(error) => {
                report.error(file_name, &error);
                continue;
            }
        };
        if policy.classify(RetentionPolicy::age(modified, now)) == Verdict::Retain {
            report.retained += 1;
            continue;
        }

        match registry.with_unregistered(&session_id, || delete_if_expired(&path, policy, now)) {
            None => report.skipped_active += 1,
            Some(Ok(Some(verdict))) => report.record_deletion(&file_name, verdict),
            Some(Ok(None)) => report.retained += 1,
            Some(Err(error)) if error.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(file = %file_name, "streaming log vanished before deletion");
            }
            Some(Err(error)) => report.error(file_name, &error),
        }
    }

    if report.deleted > 0 || !report.errors.is_empty() {
        tracing::info!(
            directory = %report.directory.display(),
            scanned = report.scanned,
            deleted = report.deleted,
            emergency = report.deleted_emergency,
            errors = report.errors.len(),
            "streaming log cleanup finished"
        );
    } else {
        tracing::debug!(
            directory = %report.directory.display(),
            scanned = report.scanned,
            retained = report.retained,
            "streaming log cleanup found nothing to delete"
        );
    }

    report
}

/// Re-read the mtime and unlink if the file is still past its window.
fn delete_if_expired(
    path: &Path,
    policy: &RetentionPolicy,
    now: SystemTime,
) -> io::Result<Option<Verdict>> {
    let modified = std::fs::symlink_metadata(path)?.modified()?;
    match policy.classify(RetentionPolicy::age(modified, now)) {
        Verdict::Retain => Ok(None),
        verdict => {
            std::fs::remove_file(path)?;
            Ok(Some(verdict))
        }
    }
}
