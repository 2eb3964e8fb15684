//! Background maintenance loop driving the flush and cleanup actions.

use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::traits::PeriodicTask;

/// One background task running a flush task and an optional cleanup task on
/// independent timers.
///
/// Notifying `wake` runs the flush task immediately and restarts its timer.
/// The loop exits when [`LoopHandle::stop`] is called or the handle is dropped.
pub struct MaintenanceLoop {
    flush: Arc<dyn PeriodicTask>,
    cleanup: Option<Arc<dyn PeriodicTask>>,
    wake: Arc<Notify>,
}

/// Stop signal and join handle of a spawned [`MaintenanceLoop`].
pub struct LoopHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl LoopHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the loop and wait for it to exit. A tick already in progress
    /// finishes first.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(error) = self.join.await {
            tracing::error!("maintenance loop panicked: {error}");
        }
    }
}

impl MaintenanceLoop {
    pub fn new(
        flush: Arc<dyn PeriodicTask>,
        cleanup: Option<Arc<dyn PeriodicTask>>,
        wake: Arc<Notify>,
    ) -> Self {
        Self {
            flush,
            cleanup,
            wake,
        }
    }

    /// Spawn the loop on the current tokio runtime.
    pub fn spawn(self) -> LoopHandle {
        let (shutdown, receiver) = watch::channel(false);
        let join = tokio::spawn(self.run(receiver));
        LoopHandle { shutdown, join }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut flush_tick = interval(self.flush.interval());
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let cleanup_period = self
            .cleanup
            .as_ref()
            .map_or(self.flush.interval(), |task| task.interval());
        let mut cleanup_tick = interval(cleanup_period);
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            flush_task = self.flush.name(),
            flush_interval_secs = self.flush.interval().as_secs(),
            cleanup_task = self.cleanup.as_ref().map(|t| t.name()),
            cleanup_interval_secs = self.cleanup.as_ref().map(|t| t.interval().as_secs()),
            "maintenance loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                () = self.wake.notified() => {
                    run_tick(self.flush.as_ref()).await;
                    flush_tick.reset();
                }
                _ = flush_tick.tick() => run_tick(self.flush.as_ref()).await,
                _ = cleanup_tick.tick(), if self.cleanup.is_some() => {
                    if let Some(cleanup) = &self.cleanup {
                        run_tick(cleanup.as_ref()).await;
                    }
                }
            }
        }

        tracing::info!("maintenance loop stopped");
    }
}

async fn run_tick(task: &dyn PeriodicTask) {
    match task.tick().await {
        Ok(outcome) => {
            if let Some(details) = outcome.details {
                tracing::debug!(task = task.name(), "{details}");
            }
        }
        Err(error) => tracing::warn!(task = task.name(), "maintenance tick failed: {error:#}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::traits::TickOutcome;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingTask {
        name: &'static str,
        interval: Duration,
        ticks: AtomicUsize,
        fail: bool,
    }

    impl CountingTask {
        fn new(name: &'static str, secs: u64) -> Arc<Self> {
            Arc::new(Self {
                name,
                interval: Duration::from_secs(secs),
                ticks: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn count(&self) -> usize {
            self.ticks.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PeriodicTask for CountingTask {
        async fn tick(&self) -> anyhow::Result<TickOutcome> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("{} failed", self.name);
            }
            Ok(TickOutcome::now(None))
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        fn name(&self) -> &str {
            self.name
        }
    }

    async fn advance(secs: u64) {
        for _ in 0..secs {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_tasks_on_independent_cadences() {
        let flush = CountingTask::new("flush", 2);
        let cleanup = CountingTask::new("cleanup", 10);
        let handle = MaintenanceLoop::new(
            flush.clone(),
            Some(cleanup.clone() as Arc<dyn PeriodicTask>),
            Arc::new(Notify::new()),
        )
        .spawn();

        advance(20).await;

        // Both timers fire once immediately, then on their own period.
        assert!((10..=11).contains(&flush.count()), "flush ran {}", flush.count());
        assert!((2..=3).contains(&cleanup.count()), "cleanup ran {}", cleanup.count());

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn wake_triggers_out_of_cycle_flush() {
        let flush = CountingTask::new("flush", 60);
        let wake = Arc::new(Notify::new());
        let handle = MaintenanceLoop::new(flush.clone(), None, wake.clone()).spawn();

        advance(1).await;
        assert_eq!(flush.count(), 1);

        wake.notify_one();
        advance(1).await;
        assert_eq!(flush.count(), 2);

        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_ends_loop_and_ticks_cease() {
        let flush = CountingTask::new("flush", 1);
        let handle = MaintenanceLoop::new(flush.clone(), None, Arc::new(Notify::new())).spawn();

        advance(3).await;
        handle.stop().await;
        let after_stop = flush.count();

        advance(5).await;
        assert_eq!(flush.count(), after_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_task_does_not_stop_loop() {
        let flush = Arc::new(CountingTask {
            name: "flaky",
            interval: Duration::from_secs(1),
            ticks: AtomicUsize::new(0),
            fail: true,
        });
        let handle = MaintenanceLoop::new(flush.clone(), None, Arc::new(Notify::new())).spawn();

        advance(3).await;
        assert!(flush.count() >= 3);
        assert!(!handle.is_finished());
        handle.stop().await;
    }
}
