//! Periodic tasks the maintenance loop runs on behalf of the manager.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::manager::ManagerInner;
use crate::infra::{PeriodicTask, TickOutcome};

pub(crate) struct FlushTask {
    inner: Arc<ManagerInner>,
}

impl FlushTask {
    pub(crate) fn new(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl PeriodicTask for FlushTask {
    async fn tick(&self) -> anyhow::Result<TickOutcome> {
        let report = self.inner.flush_all().await;
        if report.is_empty() {
            return Ok(TickOutcome::now(None));
        }
        Ok(TickOutcome::now(Some(format!(
            "flushed {} session(s): {} chunk(s), {} byte(s), {} failure(s)",
            report.sessions_flushed, report.chunks_written, report.bytes_written, report.failures
        ))))
    }

    fn interval(&self) -> Duration {
        self.inner.policy().flush_interval()
    }

    fn name(&self) -> &str {
        "flush"
    }
}

pub(crate) struct CleanupTask {
    inner: Arc<ManagerInner>,
}

impl CleanupTask {
    pub(crate) fn new(inner: Arc<ManagerInner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl PeriodicTask for CleanupTask {
    async fn tick(&self) -> anyhow::Result<TickOutcome> {
        let report = self.inner.cleanup_at(SystemTime::now()).await?;
        Ok(TickOutcome::now(Some(format!(
            "scanned {}, deleted {} ({} emergency), retained {}, active {}, evicted {}, errors {}",
            report.scanned,
            report.deleted,
            report.deleted_emergency,
            report.retained,
            report.skipped_active,
            report.evicted,
            report.errors.len()
        ))))
    }

    fn interval(&self) -> Duration {
        self.inner.policy().cleanup_interval()
    }

    fn name(&self) -> &str {
        "cleanup"
    }
}
