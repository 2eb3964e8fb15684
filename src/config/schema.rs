use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
#[cfg(unix)]
use tokio::fs::File;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

const CONFIG_FILE_NAME: &str = "config.toml";
const CONFIG_DIR_NAME: &str = ".streamlog";

// ── Top-level config ──────────────────────────────────────────────

/// Top-level streamlog configuration, loaded from `config.toml`.
///
/// Resolution order: `--config` flag → `STREAMLOG_CONFIG` env → `~/.streamlog/config.toml`.
/// A missing file is not an error; defaults apply.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Path the config was loaded from (or would be saved to) - not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Streaming session log settings (`[streaming_logs]`).
    #[serde(default)]
    pub streaming_logs: StreamingLogsConfig,
}

/// Streaming session log configuration (`[streaming_logs]` section).
///
/// Every value is read once when the manager starts; changing the file
/// afterwards has no effect on a running manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingLogsConfig {
    /// Master switch. When false, appends and completions are no-ops and
    /// no background loop runs.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory holding one `<session_id>.log` file per session. `~` is expanded.
    #[serde(default = "default_directory")]
    pub directory: String,

    /// Seconds between periodic flushes of buffered chunks.
    #[serde(default = "default_flush_interval_seconds")]
    pub flush_interval_seconds: u64,

    /// Seconds between cleanup sweeps of the log directory.
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,

    /// Minutes a completed session file stays on disk before it may be deleted.
    #[serde(default = "default_file_retention_minutes")]
    pub file_retention_minutes: u64,

    /// Emergency age in hours: older files are deleted and idle sessions are
    /// force-completed regardless of normal tracking.
    #[serde(default = "default_max_session_age_hours")]
    pub max_session_age_hours: u64,

    /// Run the cleanup sweep at all. When false, completed files stay forever.
    #[serde(default = "default_true")]
    pub cleanup_enabled: bool,

    /// Buffered bytes per session that trigger an immediate flush.
    #[serde(default = "default_max_buffer_bytes")]
    pub max_buffer_bytes: usize,

    /// Hard cap on buffered bytes per session while flushes keep failing.
    #[serde(default = "default_max_pending_bytes")]
    pub max_pending_bytes: usize,
}

fn default_true() -> bool {
    true
}

fn default_directory() -> String {
    "logs/streaming".to_string()
}

fn default_flush_interval_seconds() -> u64 {
    2
}

fn default_cleanup_interval_seconds() -> u64 {
    60
}

fn default_file_retention_minutes() -> u64 {
    10
}

fn default_max_session_age_hours() -> u64 {
    24
}

fn default_max_buffer_bytes() -> usize {
    256 * 1024
}

fn default_max_pending_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for StreamingLogsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            directory: default_directory(),
            flush_interval_seconds: default_flush_interval_seconds(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
            file_retention_minutes: default_file_retention_minutes(),
            max_session_age_hours: default_max_session_age_hours(),
            cleanup_enabled: default_true(),
            max_buffer_bytes: default_max_buffer_bytes(),
            max_pending_bytes: default_max_pending_bytes(),
        }
    }
}

impl StreamingLogsConfig {
    /// The log directory with `~` and `$VAR` expanded.
    pub fn resolved_directory(&self) -> PathBuf {
        let raw = self.directory.trim();
        match shellexpand::full(raw) {
            Ok(expanded) => PathBuf::from(expanded.as_ref()),
            Err(error) => {
                tracing::warn!(
                    directory = raw,
                    "Failed to expand streaming_logs.directory, using it verbatim: {error}"
                );
                PathBuf::from(raw)
            }
        }
    }

    /// Reject values that would leave the flush/cleanup timing undefined.
    pub fn validate(&self) -> Result<()> {
        if self.directory.trim().is_empty() {
            anyhow::bail!("streaming_logs.directory must not be empty");
        }
        if self.flush_interval_seconds == 0 {
            anyhow::bail!("streaming_logs.flush_interval_seconds must be greater than 0");
        }
        if self.cleanup_interval_seconds == 0 {
            anyhow::bail!("streaming_logs.cleanup_interval_seconds must be greater than 0");
        }
        if self.max_session_age_hours == 0 {
            anyhow::bail!("streaming_logs.max_session_age_hours must be greater than 0");
        }
        let retention_secs = self.file_retention_minutes.saturating_mul(60);
        let max_age_secs = self.max_session_age_hours.saturating_mul(3600);
        if retention_secs > max_age_secs {
            anyhow::bail!(
                "streaming_logs.file_retention_minutes ({}) must not exceed max_session_age_hours ({}h)",
                self.file_retention_minutes,
                self.max_session_age_hours
            );
        }
        if self.max_buffer_bytes == 0 {
            anyhow::bail!("streaming_logs.max_buffer_bytes must be greater than 0");
        }
        if self.max_pending_bytes < self.max_buffer_bytes {
            anyhow::bail!(
                "streaming_logs.max_pending_bytes ({}) must be at least max_buffer_bytes ({})",
                self.max_pending_bytes,
                self.max_buffer_bytes
            );
        }
        Ok(())
    }
}

// ── Config impl ──────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum ConfigResolutionSource {
    Flag,
    EnvConfig,
    DefaultConfigDir,
}

impl ConfigResolutionSource {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "--config",
            Self::EnvConfig => "STREAMLOG_CONFIG",
            Self::DefaultConfigDir => "default",
        }
    }
}

fn default_config_path() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn resolve_config_path(explicit: Option<&Path>) -> Result<(PathBuf, ConfigResolutionSource)> {
    if let Some(path) = explicit {
        return Ok((path.to_path_buf(), ConfigResolutionSource::Flag));
    }

    if let Ok(custom) = std::env::var("STREAMLOG_CONFIG") {
        let custom = custom.trim();
        if !custom.is_empty() {
            return Ok((PathBuf::from(custom), ConfigResolutionSource::EnvConfig));
        }
    }

    Ok((
        default_config_path()?,
        ConfigResolutionSource::DefaultConfigDir,
    ))
}

fn parse_bool_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn override_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut u64) {
    if let Some(raw) = lookup(key) {
        match raw.trim().parse::<u64>() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!(key, value = %raw, "Ignoring invalid numeric override"),
        }
    }
}

fn override_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut bool) {
    if let Some(raw) = lookup(key) {
        match parse_bool_flag(&raw) {
            Some(value) => *target = value,
            None => tracing::warn!(key, value = %raw, "Ignoring invalid boolean override"),
        }
    }
}

impl Config {
    /// Path `load` would read, without reading it.
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
        resolve_config_path(explicit).map(|(path, _)| path)
    }

    /// Load configuration from disk, apply env overrides and validate.
    pub async fn load(explicit: Option<&Path>) -> Result<Self> {
        let (config_path, resolution_source) = resolve_config_path(explicit)?;

        let mut config = if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .await
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            Self::from_toml_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", config_path.display()))?
        } else {
            if resolution_source != ConfigResolutionSource::DefaultConfigDir {
                tracing::warn!(
                    path = %config_path.display(),
                    "Config file not found, using defaults"
                );
            }
            Config::default()
        };
        config.config_path = config_path;

        config.apply_env_overrides();
        config.validate()?;
        tracing::info!(
            path = %config.config_path.display(),
            source = resolution_source.as_str(),
            enabled = config.streaming_logs.enabled,
            directory = %config.streaming_logs.directory,
            "Config loaded"
        );
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        Ok(config)
    }

    /// Validate configuration values that would cause runtime failures.
    pub fn validate(&self) -> Result<()> {
        self.streaming_logs.validate()
    }

    /// Apply environment variable overrides to config
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides using `lookup` as the variable source.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let logs = &mut self.streaming_logs;

        override_bool(&lookup, "STREAMLOG_ENABLED", &mut logs.enabled);
        override_bool(&lookup, "STREAMLOG_CLEANUP_ENABLED", &mut logs.cleanup_enabled);

        if let Some(directory) = lookup("STREAMLOG_DIRECTORY") {
            if !directory.trim().is_empty() {
                logs.directory = directory;
            }
        }

        override_u64(
            &lookup,
            "STREAMLOG_FLUSH_INTERVAL_SECONDS",
            &mut logs.flush_interval_seconds,
        );
        override_u64(
            &lookup,
            "STREAMLOG_CLEANUP_INTERVAL_SECONDS",
            &mut logs.cleanup_interval_seconds,
        );
        override_u64(
            &lookup,
            "STREAMLOG_FILE_RETENTION_MINUTES",
            &mut logs.file_retention_minutes,
        );
        override_u64(
            &lookup,
            "STREAMLOG_MAX_SESSION_AGE_HOURS",
            &mut logs.max_session_age_hours,
        );
    }

    /// Serialize to TOML and atomically replace the file at `config_path`.
    pub async fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        fs::create_dir_all(parent_dir).await.with_context(|| {
            format!(
                "Failed to create config directory: {}",
                parent_dir.display()
            )
        })?;

        let file_name = self
            .config_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or(CONFIG_FILE_NAME);
        let temp_path = parent_dir.join(format!(".{file_name}.tmp-{}", uuid::Uuid::new_v4()));

        let mut temp_file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to create temporary config file: {}",
                    temp_path.display()
                )
            })?;
        temp_file
            .write_all(toml_str.as_bytes())
            .await
            .context("Failed to write temporary config contents")?;
        temp_file
            .sync_all()
            .await
            .context("Failed to fsync temporary config file")?;
        drop(temp_file);

        if let Err(e) = fs::rename(&temp_path, &self.config_path).await {
            let _ = fs::remove_file(&temp_path).await;
            anyhow::bail!("Failed to atomically replace config file: {e}");
        }

        sync_directory(parent_dir).await?;
        Ok(())
    }
}

async fn sync_directory(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = File::open(path)
            .await
            .with_context(|| format!("Failed to open directory for fsync: {}", path.display()))?;
        dir.sync_all()
            .await
            .with_context(|| format!("Failed to fsync directory metadata: {}", path.display()))?;
        Ok(())
    }

    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}
