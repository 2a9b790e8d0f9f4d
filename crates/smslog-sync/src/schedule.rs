//! Continuous incremental mode: run a short-window sync on a cron schedule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use smslog_core::{SyncReport, SyncWindow};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::SyncRunner;

/// Releases the in-flight flag when a tick ends, even if the run panics.
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One scheduled tick. Returns `None` when the previous run is still going.
pub async fn run_tick(
    runner: &dyn SyncRunner,
    window: SyncWindow,
    cancel: CancellationToken,
    in_flight: &Arc<AtomicBool>,
) -> Option<SyncReport> {
    if in_flight
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        warn!("previous incremental sync still running; skipping tick");
        return None;
    }
    let _guard = InFlight(in_flight.clone());
    if cancel.is_cancelled() {
        return None;
    }

    match runner.run(window, cancel).await {
        Ok(report) => {
            info!(summary = %report.summary(), "incremental sync finished");
            Some(report)
        }
        Err(err) => {
            warn!(error = %err, "incremental sync could not start");
            None
        }
    }
}

pub struct IncrementalScheduler {
    scheduler: JobScheduler,
    cron: String,
}

impl IncrementalScheduler {
    pub async fn new(
        runner: Arc<dyn SyncRunner>,
        cron: &str,
        window: SyncWindow,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let in_flight = Arc::new(AtomicBool::new(false));

        let job = Job::new_async(cron, move |_uuid, _lock| {
            let runner = runner.clone();
            let cancel = cancel.clone();
            let in_flight = in_flight.clone();
            Box::pin(async move {
                run_tick(runner.as_ref(), window, cancel, &in_flight).await;
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        scheduler.add(job).await.context("adding scheduler job")?;

        Ok(Self {
            scheduler,
            cron: cron.to_string(),
        })
    }

    /// Starts ticking and blocks until `cancel` fires.
    pub async fn run_until_cancelled(mut self, cancel: CancellationToken) -> Result<()> {
        self.scheduler.start().await.context("starting scheduler")?;
        info!(cron = %self.cron, "incremental scheduler started");
        cancel.cancelled().await;
        info!("stopping incremental scheduler");
        self.scheduler
            .shutdown()
            .await
            .context("stopping scheduler")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use smslog_core::{SyncMode, SyncStatus};
    use smslog_storage::MemoryMessageStore;

    use super::*;
    use crate::engine::test_support::{page, ScriptedSource, Step};
    use crate::{SyncError, SyncOptions, SynchronousRunner};

    #[tokio::test]
    async fn tick_runs_the_configured_window() {
        let source = Arc::new(ScriptedSource::new(vec![Step::Page(page("SMa", 2, None))]));
        let runner = SynchronousRunner::new(
            source,
            Arc::new(MemoryMessageStore::new()),
            SyncOptions::default(),
        );
        let in_flight = Arc::new(AtomicBool::new(false));
        let report = run_tick(&runner, SyncWindow::Hours(1), CancellationToken::new(), &in_flight)
            .await
            .unwrap();
        assert_eq!(report.status, SyncStatus::Completed);
        assert_eq!(report.window, SyncWindow::Hours(1));
        assert!(!in_flight.load(Ordering::SeqCst));
    }

    struct SlowRunner;

    #[async_trait]
    impl SyncRunner for SlowRunner {
        fn mode(&self) -> SyncMode {
            SyncMode::Synchronous
        }

        async fn run(
            &self,
            _window: SyncWindow,
            _cancel: CancellationToken,
        ) -> Result<SyncReport, SyncError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(SyncError::InvalidOptions("slow".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_tick_is_skipped() {
        let runner: Arc<dyn SyncRunner> = Arc::new(SlowRunner);
        let in_flight = Arc::new(AtomicBool::new(false));

        let first = {
            let runner = runner.clone();
            let in_flight = in_flight.clone();
            tokio::spawn(async move {
                run_tick(runner.as_ref(), SyncWindow::Hours(1), CancellationToken::new(), &in_flight)
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert!(in_flight.load(Ordering::SeqCst));

        let second = run_tick(
            runner.as_ref(),
            SyncWindow::Hours(1),
            CancellationToken::new(),
            &in_flight,
        )
        .await;
        assert!(second.is_none());

        assert!(first.await.unwrap().is_none());
        assert!(!in_flight.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn rejects_a_malformed_cron_expression() {
        let runner: Arc<dyn SyncRunner> = Arc::new(SlowRunner);
        let result = IncrementalScheduler::new(
            runner,
            "every fifteen minutes",
            SyncWindow::Hours(1),
            CancellationToken::new(),
        )
        .await;
        assert!(result.is_err());
    }
}
