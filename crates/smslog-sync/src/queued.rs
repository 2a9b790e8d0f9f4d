//! Producer/writer variant: one task fetches and normalizes, one task writes,
//! joined by a bounded queue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use smslog_core::{MessageRecord, SyncFailure, SyncMode, SyncReport, SyncWindow};
use smslog_source::MessageSource;
use smslog_storage::MessageStore;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::engine::{flush_batch, Halt, Pager, RunTally, SyncOptions, WindowBounds};
use crate::normalize::normalize;
use crate::{SyncError, SyncRunner};

#[derive(Debug)]
pub enum QueueItem {
    Record(MessageRecord),
    EndOfStream,
}

#[derive(Debug, Default)]
struct ProducerOutcome {
    pages: u64,
    fetched: u64,
    skipped: u64,
    limit_hit: bool,
    halt: Option<Halt>,
}

#[derive(Debug, Default)]
struct WriterOutcome {
    saved: u64,
    failure: Option<SyncFailure>,
}

pub struct QueuedRunner {
    source: Arc<dyn MessageSource>,
    store: Arc<dyn MessageStore>,
    options: SyncOptions,
}

impl QueuedRunner {
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
        let (tx, rx) = mpsc::channel::<QueueItem>(self.options.queue_capacity);
        // Cancelled by the user's token or by the writer giving up.
        let stop_producer = cancel.child_token();

        let producer = tokio::spawn(
            produce(
                self.source.clone(),
                bounds,
                self.options.max_pages,
                tx,
                stop_producer.clone(),
            )
            .in_current_span(),
        );
        let writer = tokio::spawn(
            write(self.store.clone(), rx, self.options, stop_producer).in_current_span(),
        );

        let (produced, written) = tokio::join!(producer, writer);
        let produced = produced.unwrap_or_else(|err| ProducerOutcome {
            halt: Some(Halt::Failed(SyncFailure::source(join_message("producer", &err)))),
            ..ProducerOutcome::default()
        });
        let written = written.unwrap_or_else(|err| WriterOutcome {
            saved: 0,
            failure: Some(SyncFailure::storage(join_message("writer", &err), Vec::new())),
        });

        tally.progress.pages_fetched = produced.pages;
        tally.progress.records_fetched = produced.fetched;
        tally.progress.records_skipped = produced.skipped;
        tally.progress.records_saved = written.saved;
        tally.limit_hit = produced.limit_hit;

        // The producer records a cancel only if it stopped early because of it.
        let halt = match written.failure {
            Some(failure) => Some(Halt::Failed(failure)),
            None => produced.halt,
        };
        tally.finish(halt)
    }
}

fn join_message(task: &str, err: &JoinError) -> String {
    if err.is_panic() {
        format!("{task} task panicked")
    } else {
        format!("{task} task was aborted")
    }
}

async fn produce(
    source: Arc<dyn MessageSource>,
    bounds: WindowBounds,
    max_pages: u64,
    tx: mpsc::Sender<QueueItem>,
    cancel: CancellationToken,
) -> ProducerOutcome {
    let mut pager = Pager::new(bounds.first_request(), max_pages);
    let mut outcome = ProducerOutcome::default();

    'pages: while let Some(request) = pager.take_next() {
        if cancel.is_cancelled() {
            outcome.halt = Some(Halt::Cancelled);
            break;
        }
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                outcome.halt = Some(Halt::Cancelled);
                break 'pages;
            }
            result = source.fetch_page(&request) => result,
        };
        let page = match fetched {
            Ok(page) => page,
            Err(err) => {
                warn!(error = %err, page = pager.pages() + 1, "page fetch failed");
                outcome.halt = Some(Halt::Failed(SyncFailure::source(err.to_string())));
                break;
            }
        };
        pager.advance(&page);
        outcome.pages = pager.pages();

        let total = page.messages.len();
        for (idx, raw) in page.messages.iter().enumerate() {
            if cancel.is_cancelled() {
                info!(unprocessed = total - idx, "cancelled mid-page");
                outcome.halt = Some(Halt::Cancelled);
                break 'pages;
            }
            outcome.fetched += 1;
            let record = match normalize(raw, Some(bounds.boundary), bounds.now) {
                Ok(record) => record,
                Err(skip) => {
                    outcome.skipped += 1;
                    debug!(sid = ?raw.sid, reason = %skip, "record skipped");
                    continue;
                }
            };
            if tx.send(QueueItem::Record(record)).await.is_err() {
                debug!("writer closed the queue; producer stopping");
                outcome.halt = Some(Halt::Cancelled);
                break 'pages;
            }
        }
    }

    outcome.limit_hit = pager.limit_hit();
    // Writer may already be gone after a storage failure.
    let _ = tx.send(QueueItem::EndOfStream).await;
    outcome
}

async fn write(
    store: Arc<dyn MessageStore>,
    mut rx: mpsc::Receiver<QueueItem>,
    options: SyncOptions,
    stop_producer: CancellationToken,
) -> WriterOutcome {
    let mut outcome = WriterOutcome::default();
    let mut batch: Vec<MessageRecord> = Vec::with_capacity(options.batch_size);

    loop {
        let (flush_now, finished) =
            match tokio::time::timeout(options.flush_interval, rx.recv()).await {
                Ok(Some(QueueItem::Record(record))) => {
                    batch.push(record);
                    (batch.len() >= options.batch_size, false)
                }
                Ok(Some(QueueItem::EndOfStream)) | Ok(None) => (true, true),
                Err(_idle) => {
                    if !batch.is_empty() {
                        debug!(records = batch.len(), "queue idle; flushing partial batch");
                    }
                    (!batch.is_empty(), false)
                }
            };

        if flush_now {
            match flush_batch(store.as_ref(), &mut batch, options.store_retry_delay).await {
                Ok(saved) => outcome.saved += saved,
                Err(failure) => {
                    stop_producer.cancel();
                    outcome.failure = Some(failure);
                    return outcome;
                }
            }
        }
        if finished {
            return outcome;
        }
    }
}

#[async_trait]
impl SyncRunner for QueuedRunner {
    fn mode(&self) -> SyncMode {
        SyncMode::Queued
    }

    async fn run(
        &self,
        window: SyncWindow,
        cancel: CancellationToken,
    ) -> Result<SyncReport, SyncError> {
        self.options.validate()?;
        let bounds = WindowBounds::resolve(window, Utc::now())?;
        let tally = RunTally::start(SyncMode::Queued, window);
        let span = info_span!("sync_run", run_id = %tally.run_id, mode = "queued", %window);
        Ok(self.execute(tally, bounds, cancel).instrument(span).await)
    }
}
