//! Synchronous fetch -> normalize -> buffer -> flush loop and the pieces
//! shared with the queued runner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use smslog_core::{
    FailureKind, MessageRecord, SyncFailure, SyncMode, SyncProgress, SyncReport, SyncStatus,
    SyncWindow,
};
use smslog_source::{MessagePage, MessageSource, PageRequest};
use smslog_storage::{MessageStore, MAX_BATCH_SIZE};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::normalize::normalize;
use crate::{SyncError, SyncRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Records per store transaction.
    pub batch_size: usize,
    /// Hard cap on pages fetched in one run.
    pub max_pages: u64,
    /// Pause before the single retry of a failed flush.
    pub store_retry_delay: Duration,
    pub queue_capacity: usize,
    /// Idle time after which the queued writer flushes a partial batch.
    pub flush_interval: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_pages: 5000,
            store_retry_delay: Duration::from_secs(1),
            queue_capacity: 2000,
            flush_interval: Duration::from_secs(5),
        }
    }
}

impl SyncOptions {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(SyncError::InvalidOptions(format!(
                "batch size {} must be between 1 and {MAX_BATCH_SIZE}",
                self.batch_size
            )));
        }
        if self.max_pages == 0 {
            return Err(SyncError::InvalidOptions(
                "page cap must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(SyncError::InvalidOptions(
                "queue capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Time bounds for one run, resolved once before the first fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowBounds {
    pub now: DateTime<Utc>,
    pub boundary: DateTime<Utc>,
    pub filter_date: NaiveDate,
}

impl WindowBounds {
    pub fn resolve(window: SyncWindow, now: DateTime<Utc>) -> Result<Self, SyncError> {
        let boundary = window
            .start_boundary(now)
            .ok_or(SyncError::InvalidWindow(window))?;
        Ok(Self {
            now,
            boundary,
            filter_date: boundary.date_naive(),
        })
    }

    pub fn first_request(&self) -> PageRequest {
        PageRequest::SentAfter(self.filter_date)
    }
}

/// How a run stopped before the source was exhausted.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Halt {
    Cancelled,
    Failed(SyncFailure),
}

/// Counters and identity for one run; turned into the final [`SyncReport`].
#[derive(Debug, Clone)]
pub(crate) struct RunTally {
    pub run_id: Uuid,
    pub mode: SyncMode,
    pub window: SyncWindow,
    pub started_at: DateTime<Utc>,
    pub progress: SyncProgress,
    pub limit_hit: bool,
}

impl RunTally {
    pub fn start(mode: SyncMode, window: SyncWindow) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode,
            window,
            started_at: Utc::now(),
            progress: SyncProgress::default(),
            limit_hit: false,
        }
    }

    pub fn finish(self, halt: Option<Halt>) -> SyncReport {
        let (status, failure) = match halt {
            None => (SyncStatus::Completed, None),
            Some(Halt::Cancelled) => (SyncStatus::Cancelled, None),
            Some(Halt::Failed(failure)) => (SyncStatus::Failed, Some(failure)),
        };
        let report = SyncReport {
            run_id: self.run_id,
            mode: self.mode,
            window: self.window,
            started_at: self.started_at,
            finished_at: Utc::now(),
            status,
            progress: self.progress,
            limit_hit: self.limit_hit,
            failure,
        };
        let p = &report.progress;
        info!(
            run_id = %report.run_id,
            status = ?report.status,
            pages = p.pages_fetched,
            fetched = p.records_fetched,
            saved = p.records_saved,
            skipped = p.records_skipped,
            limit_hit = report.limit_hit,
            "sync run finished"
        );
        if report.limit_hit {
            warn!(
                pages = p.pages_fetched,
                "page cap reached with more pages remaining; sync a smaller window"
            );
        }
        report
    }
}

/// Walks the continuation chain and enforces the page cap.
#[derive(Debug)]
pub(crate) struct Pager {
    next: Option<PageRequest>,
    pages: u64,
    max_pages: u64,
    limit_hit: bool,
}

impl Pager {
    pub fn new(first: PageRequest, max_pages: u64) -> Self {
        Self {
            next: Some(first),
            pages: 0,
            max_pages,
            limit_hit: false,
        }
    }

    pub fn take_next(&mut self) -> Option<PageRequest> {
        self.next.take()
    }

    /// Records a fetched page. Empty pages end the walk and are not counted.
    pub fn advance(&mut self, page: &MessagePage) {
        if page.messages.is_empty() {
            self.next = None;
            return;
        }
        self.pages += 1;
        self.next = page
            .next_cursor()
            .map(|cursor| PageRequest::Continue(cursor.to_string()));
        if self.next.is_some() && self.pages >= self.max_pages {
            self.limit_hit = true;
            self.next = None;
        }
    }

    pub fn pages(&self) -> u64 {
        self.pages
    }

    pub fn limit_hit(&self) -> bool {
        self.limit_hit
    }
}

/// Writes `batch` in one transaction, retrying once. Clears the buffer on success.
pub(crate) async fn flush_batch(
    store: &dyn MessageStore,
    batch: &mut Vec<MessageRecord>,
    retry_delay: Duration,
) -> Result<u64, SyncFailure> {
    if batch.is_empty() {
        return Ok(0);
    }
    debug!(state = "flushing", records = batch.len(), "writing batch");
    let first_err = match store.upsert_batch(batch).await {
        Ok(applied) => {
            batch.clear();
            return Ok(applied as u64);
        }
        Err(err) => err,
    };
    warn!(error = %first_err, records = batch.len(), "batch write failed; retrying once");
    tokio::time::sleep(retry_delay).await;
    match store.upsert_batch(batch).await {
        Ok(applied) => {
            batch.clear();
            Ok(applied as u64)
        }
        Err(err) => {
            let ids: Vec<String> = batch.iter().map(|r| r.id.clone()).collect();
            warn!(error = %err, ids = ?ids, "batch write failed twice; halting run");
            Err(SyncFailure::storage(err.to_string(), ids))
        }
    }
}

/// Fetch and process pages in a single task.
pub struct SynchronousRunner {
    source: Arc<dyn MessageSource>,
    store: Arc<dyn MessageStore>,
    options: SyncOptions,
}

impl SynchronousRunner {
    pub fn new(
        source: Arc<dyn MessageSource>,
        store: Arc<dyn MessageStore>,
        options: SyncOptions,
    ) -> Self {
        Self {
            source,
            store,
            options,
        }
    }

    async fn execute(
        &self,
        mut tally: RunTally,
        bounds: WindowBounds,
        cancel: CancellationToken,
    ) -> SyncReport {
        let mut pager = Pager::new(bounds.first_request(), self.options.max_pages);
        let mut batch: Vec<MessageRecord> = Vec::with_capacity(self.options.batch_size);
        let mut halt: Option<Halt> = None;

        'pages: while let Some(request) = pager.take_next() {
            if cancel.is_cancelled() {
                halt = Some(Halt::Cancelled);
                break;
            }
            debug!(state = "fetching", page = pager.pages() + 1, "requesting page");
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    halt = Some(Halt::Cancelled);
                    break 'pages;
                }
                result = self.source.fetch_page(&request) => result,
            };
            let page = match fetched {
                Ok(page) => page,
                Err(err) => {
                    warn!(error = %err, page = pager.pages() + 1, "page fetch failed");
                    halt = Some(Halt::Failed(SyncFailure::source(err.to_string())));
                    break;
                }
            };
            pager.advance(&page);
            tally.progress.pages_fetched = pager.pages();

            debug!(state = "normalizing", records = page.messages.len());
            let total = page.messages.len();
            for (idx, raw) in page.messages.iter().enumerate() {
                if cancel.is_cancelled() {
                    info!(unprocessed = total - idx, "cancelled mid-page");
                    halt = Some(Halt::Cancelled);
                    break 'pages;
                }
                tally.progress.records_fetched += 1;
                match normalize(raw, Some(bounds.boundary), bounds.now) {
                    Ok(record) => batch.push(record),
                    Err(skip) => {
                        tally.progress.records_skipped += 1;
                        debug!(sid = ?raw.sid, reason = %skip, "record skipped");
                    }
                }
                if batch.len() >= self.options.batch_size {
                    match flush_batch(self.store.as_ref(), &mut batch, self.options.store_retry_delay)
                        .await
                    {
                        Ok(saved) => tally.progress.records_saved += saved,
                        Err(failure) => {
                            halt = Some(Halt::Failed(failure));
                            break 'pages;
                        }
                    }
                }
            }
        }

        tally.limit_hit = pager.limit_hit();
        let storage_failed = matches!(
            &halt,
            Some(Halt::Failed(f)) if f.kind == FailureKind::Storage
        );
        if !storage_failed {
            match flush_batch(self.store.as_ref(), &mut batch, self.options.store_retry_delay).await
            {
                Ok(saved) => tally.progress.records_saved += saved,
                Err(failure) => halt = Some(Halt::Failed(failure)),
            }
        }
        tally.finish(halt)
    }
}

#[async_trait]
impl SyncRunner for SynchronousRunner {
    fn mode(&self) -> SyncMode {
        SyncMode::Synchronous
    }

    async fn run(
        &self,
        window: SyncWindow,
        cancel: CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        self.options.validate()?;
        let bounds = WindowBounds::resolve(window, Utc::now())?;
        let tally = RunTally::start(SyncMode::Synchronous, window);
        let span = info_span!("sync_run", run_id = %tally.run_id, mode = "synchronous", %window);
        Ok(self.execute(tally, bounds, cancel).instrument(span).await)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use smslog_source::{MessagePage, MessageSource, PageRequest, RawMessage, SourceError};
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    /// One scripted response.
    pub enum Step {
        Page(MessagePage),
        Fail(u16),
        /// Cancels the token, then returns the page.
        CancelThen(CancellationToken, MessagePage),
        /// Sleeps before returning the page.
        Delayed(std::time::Duration, MessagePage),
    }

    /// Source replaying a fixed list of steps; requests past the end get an empty page.
    #[derive(Default)]
    pub struct ScriptedSource {
        steps: Mutex<VecDeque<Step>>,
        pub requests: Mutex<Vec<PageRequest>>,
        pub calls: AtomicUsize,
    }

    impl ScriptedSource {
        pub fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: Mutex::new(steps.into()),
                requests: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn fetch_page(&self, request: &PageRequest) -> Result<MessagePage, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().await.push(request.clone());
            let step = self.steps.lock().await.pop_front();
            match step {
                None => Ok(MessagePage::default()),
                Some(Step::Page(page)) => Ok(page),
                Some(Step::Fail(status)) => Err(SourceError::HttpStatus {
                    status,
                    url: "scripted".into(),
                }),
                Some(Step::CancelThen(token, page)) => {
                    token.cancel();
                    Ok(page)
                }
                Some(Step::Delayed(delay, page)) => {
                    tokio::time::sleep(delay).await;
                    Ok(page)
                }
            }
        }
    }

    pub fn raw(sid: &str) -> RawMessage {
        RawMessage {
            sid: Some(sid.to_string()),
            date_created: Some((Utc::now() - ChronoDuration::minutes(5)).to_rfc2822()),
            status: Some("delivered".into()),
            to: Some("+15550001111".into()),
            direction: Some("outbound-api".into()),
            price: Some(serde_json::json!("-0.0075")),
            body: Some("hi".into()),
            ..RawMessage::default()
        }
    }

    /// Page of `count` fresh messages with ids `{prefix}{n}`.
    pub fn page(prefix: &str, count: usize, next: Option<&str>) -> MessagePage {
        MessagePage {
            messages: (0..count).map(|n| raw(&format!("{prefix}{n}"))).collect(),
            next_page_uri: next.map(ToString::to_string),
        }
    }
}
