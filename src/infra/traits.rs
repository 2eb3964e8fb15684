use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Result of one run of a [`PeriodicTask`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickOutcome {
    pub checked_at: DateTime<Utc>,
    pub details: Option<String>,
}

impl TickOutcome {
    pub fn now(details: Option<String>) -> Self {
        Self {
            checked_at: Utc::now(),
            details,
        }
    }
}

/// Work the maintenance loop runs on a fixed cadence.
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    async fn tick(&self) -> anyhow::Result<TickOutcome>;
    fn interval(&self) -> Duration;
    fn name(&self) -> &str;
}
