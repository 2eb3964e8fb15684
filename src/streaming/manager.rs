//! Streaming log manager: buffered per-session log files with background
//! flush and retention cleanup.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

use super::tasks::{CleanupTask, FlushTask};
use super::traits::StreamSink;
use crate::config::StreamingLogsConfig;
use crate::infra::{LoopHandle, MaintenanceLoop, PeriodicTask};
use crate::retention::{sweep_directory, RetentionPolicy, SweepReport};
use crate::sessions::{ActiveRegistry, Enqueued, SessionId, SessionSnapshot};

/// Totals for one flush pass over every registered session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    pub sessions_flushed: usize,
    pub chunks_written: usize,
    pub bytes_written: u64,
    pub failures: usize,
}

impl FlushReport {
    pub fn is_empty(&self) -> bool {
        self.sessions_flushed == 0 && self.failures == 0
    }
}

enum SessionFlush {
    Skipped,
    Written { chunks: usize, bytes: u64 },
    Failed,
}

/// State shared by the manager and its periodic tasks.
pub(crate) struct ManagerInner {
    policy: RetentionPolicy,
    registry: Arc<ActiveRegistry>,
    wake: Arc<Notify>,
    accepting: AtomicBool,
}

impl ManagerInner {
    pub(crate) fn policy(&self) -> &RetentionPolicy {
        &self.policy
    }

    fn append(&self, session_id: &str, chunk: &str) {
        if session_id.is_empty() || chunk.is_empty() {
            return;
        }
        if !self.accepting.load(Ordering::Acquire) {
            tracing::debug!(session_id, "streaming log manager shut down, dropping chunk");
            return;
        }

        let id = match SessionId::parse(session_id) {
            Ok(id) => id,
            Err(error) => {
                tracing::warn!(session_id, "dropping chunk for invalid session id: {error}");
                return;
            }
        };

        match self.registry.enqueue(&id, chunk, SystemTime::now()) {
            Enqueued::Queued {
                pending_bytes,
                flush_due,
                created,
            } => {
                if created {
                    tracing::debug!(
                        session_id = %id,
                        path = %self.registry.log_path(&id).display(),
                        "streaming session log opened"
                    );
                }
                if flush_due {
                    tracing::trace!(session_id = %id, pending_bytes, "requesting out-of-cycle flush");
                    self.wake.notify_one();
                }
            }
            Enqueued::Rejected { pending_bytes } => {
                tracing::warn!(
                    session_id = %id,
                    pending_bytes,
                    chunk_bytes = chunk.len(),
                    "streaming session buffer full, dropping chunk"
                );
            }
            Enqueued::Completing => {
                tracing::warn!(session_id = %id, "streaming session is completing, dropping chunk");
            }
            Enqueued::OpenFailed(error) => {
                tracing::warn!(
                    session_id = %id,
                    path = %self.registry.log_path(&id).display(),
                    "failed to open streaming session log, dropping chunk: {error}"
                );
            }
        }
    }

    pub(crate) async fn flush_all(&self) -> FlushReport {
        let ids = self.registry.ids();
        let results = join_all(ids.iter().map(|id| self.flush_session(id))).await;

        let mut report = FlushReport::default();
        for result in results {
            match result {
                SessionFlush::Skipped => {}
                SessionFlush::Written { chunks, bytes } => {
                    report.sessions_flushed += 1;
                    report.chunks_written += chunks;
                    report.bytes_written += bytes;
                }
                SessionFlush::Failed => report.failures += 1,
            }
        }
        report
    }

    async fn flush_session(&self, id: &SessionId) -> SessionFlush {
        let Some(writer) = self.registry.writer(id) else {
            return SessionFlush::Skipped;
        };
        let mut writer = writer.lock().await;
        if writer.is_closed() {
            return SessionFlush::Skipped;
        }

        let chunks = match self.registry.take_buffer(id) {
            Some(chunks) if !chunks.is_empty() => chunks,
            _ => return SessionFlush::Skipped,
        };

        let mut outcome = writer.write_chunks(chunks).await;
        let Some(error) = outcome.error.take() else {
            self.registry.record_flush(id, SystemTime::now());
            return SessionFlush::Written {
                chunks: outcome.written,
                bytes: outcome.bytes,
            };
        };

        let unwritten = outcome.unwritten();
        let requeued = unwritten.len();
        let dropped = self.registry.requeue_front(id, unwritten);
        let consecutive_failures = self.registry.record_failure(id);
        tracing::warn!(
            session_id = %id,
            path = %writer.path().display(),
            consecutive_failures,
            requeued,
            dropped,
            "failed to flush streaming session log: {error}"
        );
        SessionFlush::Failed
    }

    async fn complete(&self, id: &SessionId) {
        let Some(shared) = self.registry.writer(id) else {
            return;
        };
        let mut writer = shared.lock().await;
        let Some(chunks) = self.registry.begin_completion(id, &shared) else {
            return;
        };

        if !chunks.is_empty() {
            let outcome = writer.write_chunks(chunks).await;
            if let Some(error) = &outcome.error {
                tracing::error!(
                    session_id = %id,
                    path = %writer.path().display(),
                    lost_chunks = outcome.unwritten_count(),
                    "final flush of streaming session log failed: {error}"
                );
            }
        }

        if let Err(error) = writer.close(SystemTime::now()) {
            tracing::warn!(
                session_id = %id,
                path = %writer.path().display(),
                "failed to close streaming session log: {error}"
            );
        }
        self.registry.remove(id);

        tracing::info!(
            session_id = %id,
            path = %writer.path().display(),
            bytes_written = writer.bytes_written(),
            "streaming session log completed"
        );
    }

    async fn complete_all(&self) -> usize {
        let ids = self.registry.ids();
        join_all(ids.iter().map(|id| self.complete(id))).await;
        ids.len()
    }

    pub(crate) async fn cleanup_at(&self, now: SystemTime) -> Result<SweepReport> {
        let cutoff = now
            .checked_sub(self.policy.max_session_age())
            .unwrap_or(UNIX_EPOCH);
        let idle = self.registry.idle_since(cutoff);
        for id in &idle {
            tracing::warn!(
                session_id = %id,
                max_session_age_secs = self.policy.max_session_age().as_secs(),
                "evicting idle streaming session"
            );
            self.complete(id).await;
        }

        let registry = Arc::clone(&self.registry);
        let policy = self.policy.clone();
        let mut report =
            tokio::task::spawn_blocking(move || sweep_directory(&registry, &policy, now))
                .await
                .context("Streaming log cleanup task failed")?;
        report.evicted = idle.len();
        Ok(report)
    }
}

/// Owns the active registry and the background maintenance loop.
///
/// A manager built from a disabled configuration is inert: every operation
/// returns immediately and nothing touches the file system. Call
/// [`shutdown`](Self::shutdown) before dropping an enabled manager;
/// dropping it stops the loop but does not flush buffered chunks.
pub struct StreamingLogManager {
    inner: Option<Arc<ManagerInner>>,
    maintenance: Mutex<Option<LoopHandle>>,
}

impl StreamingLogManager {
    /// Build a manager without starting its maintenance loop.
    ///
    /// Validates the configuration and creates the log directory. Either
    /// failing is fatal.
    pub fn new(config: &StreamingLogsConfig) -> Result<Self> {
        if !config.enabled {
            tracing::info!("streaming session logs disabled");
            return Ok(Self::disabled());
        }

        let policy = RetentionPolicy::from_config(config)?;
        ensure_directory(policy.directory())?;
        let registry = Arc::new(ActiveRegistry::new(policy.directory(), policy.limits()));

        tracing::info!(
            directory = %policy.directory().display(),
            flush_interval_secs = policy.flush_interval().as_secs(),
            cleanup_interval_secs = policy.cleanup_interval().as_secs(),
            file_retention_secs = policy.file_retention().as_secs(),
            max_session_age_secs = policy.max_session_age().as_secs(),
            cleanup_enabled = policy.cleanup_enabled(),
            "streaming log manager initialized"
        );

        Ok(Self {
            inner: Some(Arc::new(ManagerInner {
                policy,
                registry,
                wake: Arc::new(Notify::new()),
                accepting: AtomicBool::new(true),
            })),
            maintenance: Mutex::new(None),
        })
    }

    /// Build a manager and spawn its maintenance loop on the current runtime.
    pub fn start(config: &StreamingLogsConfig) -> Result<Self> {
        let manager = Self::new(config)?;
        manager.start_maintenance();
        Ok(manager)
    }

    pub fn disabled() -> Self {
        Self {
            inner: None,
            maintenance: Mutex::new(None),
        }
    }

    /// Spawn the maintenance loop. Returns `false` when the manager is
    /// disabled, shut down, or the loop is already running.
    pub fn start_maintenance(&self) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };
        if !inner.accepting.load(Ordering::Acquire) {
            return false;
        }

        let mut slot = self.maintenance.lock();
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let flush: Arc<dyn PeriodicTask> = Arc::new(FlushTask::new(Arc::clone(inner)));
        let cleanup = inner.policy.cleanup_enabled().then(|| {
            Arc::new(CleanupTask::new(Arc::clone(inner))) as Arc<dyn PeriodicTask>
        });
        *slot = Some(MaintenanceLoop::new(flush, cleanup, Arc::clone(&inner.wake)).spawn());
        true
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    pub fn is_maintenance_running(&self) -> bool {
        self.maintenance
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn directory(&self) -> Option<&Path> {
        self.inner.as_ref().map(|inner| inner.policy.directory())
    }

    pub fn policy(&self) -> Option<&RetentionPolicy> {
        self.inner.as_ref().map(|inner| inner.policy())
    }

    /// Queue `chunk` for `session_id`. Never waits on disk.
    pub fn append(&self, session_id: &str, chunk: &str) {
        if let Some(inner) = &self.inner {
            inner.append(session_id, chunk);
        }
    }

    /// Final-flush, close and unregister `session_id`. Unknown ids are a no-op.
    pub async fn complete(&self, session_id: &str) {
        let Some(inner) = &self.inner else {
            return;
        };
        match SessionId::parse(session_id) {
            Ok(id) => inner.complete(&id).await,
            Err(_) => tracing::debug!(session_id, "ignoring completion of invalid session id"),
        }
    }

    /// Flush every registered session now.
    pub async fn flush(&self) -> FlushReport {
        match &self.inner {
            Some(inner) => inner.flush_all().await,
            None => FlushReport::default(),
        }
    }

    /// Run one cleanup pass now, regardless of `cleanup_enabled`.
    pub async fn cleanup(&self) -> Result<SweepReport> {
        self.cleanup_at(SystemTime::now()).await
    }

    /// Run one cleanup pass as seen from `now`.
    pub async fn cleanup_at(&self, now: SystemTime) -> Result<SweepReport> {
        match &self.inner {
            Some(inner) => inner.cleanup_at(now).await,
            None => Ok(SweepReport::default()),
        }
    }

    /// Stop the maintenance loop, refuse further appends, then complete
    /// every active session. No cleanup sweep runs at shutdown.
    pub async fn shutdown(&self) {
        let Some(inner) = &self.inner else {
            return;
        };

        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }

        inner.accepting.store(false, Ordering::Release);
        let completed = inner.complete_all().await;
        tracing::info!(sessions = completed, "streaming log manager shut down");
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        let Some(inner) = &self.inner else {
            return false;
        };
        SessionId::parse(session_id).is_ok_and(|id| inner.registry.contains(&id))
    }

    pub fn active_sessions(&self) -> Vec<SessionSnapshot> {
        self.inner
            .as_ref()
            .map(|inner| inner.registry.snapshot())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StreamSink for StreamingLogManager {
    fn append(&self, session_id: &str, chunk: &str) {
        StreamingLogManager::append(self, session_id, chunk);
    }

    async fn complete(&self, session_id: &str) {
        StreamingLogManager::complete(self, session_id).await;
    }

    async fn shutdown(&self) {
        StreamingLogManager::shutdown(self).await;
    }

    fn name(&self) -> &str {
        if self.is_enabled() {
            "file"
        } else {
            "disabled"
        }
    }
}

fn ensure_directory(directory: &Path) -> Result<()> {
    if directory.exists() && !directory.is_dir() {
        bail!(
            "Streaming log path {} exists and is not a directory",
            directory.display()
        );
    }
    std::fs::create_dir_all(directory).with_context(|| {
        format!(
            "Failed to create streaming log directory {}",
            directory.display()
        )
    })
}
