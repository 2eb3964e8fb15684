use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::config::StreamingLogsConfig;
use crate::sessions::BufferLimits;

/// Verdict for one unregistered log file, based on its age alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Still inside the retention window.
    Retain,
    /// Older than the retention window.
    Expired,
    /// Older than the emergency maximum age.
    Emergency,
}

/// Immutable timing and buffering policy for one manager.
///
/// Built once from [`StreamingLogsConfig`] and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    directory: PathBuf,
    flush_interval: Duration,
    cleanup_interval: Duration,
    file_retention: Duration,
    max_session_age: Duration,
    cleanup_enabled: bool,
    limits: BufferLimits,
}

impl RetentionPolicy {
    pub fn from_config(config: &StreamingLogsConfig) -> Result<Self> {
        config
            .validate()
            .context("Invalid streaming_logs configuration")?;

        Ok(Self {
            directory: config.resolved_directory(),
            flush_interval: Duration::from_secs(config.flush_interval_seconds),
            cleanup_interval: Duration::from_secs(config.cleanup_interval_seconds),
            file_retention: Duration::from_secs(config.file_retention_minutes.saturating_mul(60)),
            max_session_age: Duration::from_secs(
                config.max_session_age_hours.saturating_mul(3600),
            ),
            cleanup_enabled: config.cleanup_enabled,
            limits: BufferLimits {
                flush_threshold_bytes: config.max_buffer_bytes,
                max_pending_bytes: config.max_pending_bytes,
            },
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }

    pub fn file_retention(&self) -> Duration {
        self.file_retention
    }

    pub fn max_session_age(&self) -> Duration {
        self.max_session_age
    }

    pub fn cleanup_enabled(&self) -> bool {
        self.cleanup_enabled
    }

    pub fn limits(&self) -> BufferLimits {
        self.limits
    }

    /// Age of a file last modified at `modified`, seen from `now`.
    /// Modification times in the future count as age zero.
    pub fn age(modified: SystemTime, now: SystemTime) -> Duration {
        now.duration_since(modified).unwrap_or(Duration::ZERO)
    }

    /// Classify an unregistered file by age. Deletion requires the age to be
    /// strictly greater than the threshold; a file exactly at the cutoff is
    /// retained.
    pub fn classify(&self, age: Duration) -> Verdict {
        if age > self.max_session_age {
            Verdict::Emergency
        } else if age > self.file_retention {
            Verdict::Expired
        } else {
            Verdict::Retain
        }
    }
}
