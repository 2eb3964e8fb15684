//! Read-only summary of the session log directory.

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::policy::RetentionPolicy;
use crate::sessions::SessionId;

#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectorySummary {
    pub directory: PathBuf,
    pub exists: bool,
    pub log_files: usize,
    pub total_bytes: u64,
    /// Age in seconds of the least recently modified log file.
    pub oldest_age_secs: Option<u64>,
    pub unrecognized: Vec<String>,
}

/// Count the log files under `directory` without touching them.
/// A missing directory is reported through `exists`, not as an error.
pub fn survey_directory(directory: &Path, now: SystemTime) -> io::Result<DirectorySummary> {
    let mut summary = DirectorySummary {
        directory: directory.to_path_buf(),
        ..DirectorySummary::default()
    };

    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(summary),
        Err(error) => return Err(error),
    };
    summary.exists = true;

    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
            Err(error) => return Err(error),
        };

        if !metadata.is_file() || SessionId::from_file_name(&file_name).is_none() {
            summary.unrecognized.push(file_name);
            continue;
        }

        summary.log_files += 1;
        summary.total_bytes += metadata.len();
        if let Ok(modified) = metadata.modified() {
            let age = RetentionPolicy::age(modified, now).as_secs();
            summary.oldest_age_secs = Some(summary.oldest_age_secs.map_or(age, |v| v.max(age)));
        }
    }

    summary.unrecognized.sort();
    Ok(summary)
}
