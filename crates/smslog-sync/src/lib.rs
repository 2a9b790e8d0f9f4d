//! Sync orchestration: pull the remote message feed into the local store.
//!
//! Two runners share the same normalize/flush rules. [`SynchronousRunner`]
//! does everything in one task; [`QueuedRunner`] splits fetching and writing
//! across a bounded queue. Pick one with [`runner_for`].

use std::sync::Arc;

use async_trait::async_trait;
use smslog_core::{SyncMode, SyncReport, SyncWindow};
use smslog_source::{LamlClient, MessageSource, SourceError};
use smslog_storage::MessageStore;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

mod config;
mod engine;
pub mod normalize;
mod queued;
mod schedule;
mod shutdown;

pub use config::{
    mask_database_url, mask_secret, ConfigError, SourceCredentials, SyncConfig,
    DEFAULT_DATABASE_URL, DEFAULT_SYNC_CRON,
};
pub use engine::{SyncOptions, SynchronousRunner};
pub use queued::{QueueItem, QueuedRunner};
pub use schedule::{run_tick, IncrementalScheduler};
pub use shutdown::install_signal_handler;

pub const CRATE_NAME: &str = "smslog-sync";

/// Errors that prevent a run from starting. Failures during a run are
/// reported in [`SyncReport::failure`] instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("could not build message source: {0}")]
    Source(#[from] SourceError),
    #[error("invalid sync options: {0}")]
    InvalidOptions(String),
    #[error("sync window of {0} reaches past the earliest representable date")]
    InvalidWindow(SyncWindow),
}

#[async_trait]
pub trait SyncRunner: Send + Sync {
    fn mode(&self) -> SyncMode;

    /// Runs one sync over `window`. Always produces a report once started.
    async fn run(
        &self,
        window: SyncWindow,
        cancel: CancellationToken,
    ) -> Result<SyncReport, SyncError>;
}

pub fn runner_for(
    mode: SyncMode,
    source: Arc<dyn MessageSource>,
    store: Arc<dyn MessageStore>,
    options: SyncOptions,
) -> Arc<dyn SyncRunner> {
    match mode {
        SyncMode::Synchronous => Arc::new(SynchronousRunner::new(source, store, options)),
        SyncMode::Queued => Arc::new(QueuedRunner::new(source, store, options)),
    }
}

/// Builds the remote client from config; missing credentials fail here, before any request.
pub fn build_laml_client(config: &SyncConfig) -> Result<LamlClient, SyncError> {
    let client_config = config.laml_client_config()?;
    Ok(LamlClient::new(client_config)?)
}

/// Runner over the real remote source for `mode`.
pub fn runner_from_config(
    config: &SyncConfig,
    mode: SyncMode,
    store: Arc<dyn MessageStore>,
) -> Result<Arc<dyn SyncRunner>, SyncError> {
    let source: Arc<dyn MessageSource> = Arc::new(build_laml_client(config)?);
    Ok(runner_for(mode, source, store, config.sync_options()))
}

#[cfg(test)]
mod tests {
    use smslog_storage::MemoryMessageStore;

    use super::*;

    #[test]
    fn runner_for_picks_the_mode() {
        let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
        let source: Arc<dyn MessageSource> =
            Arc::new(engine::test_support::ScriptedSource::new(Vec::new()));
        for mode in [SyncMode::Synchronous, SyncMode::Queued] {
            let runner = runner_for(mode, source.clone(), store.clone(), SyncOptions::default());
            assert_eq!(runner.mode(), mode);
        }
    }

    #[test]
    fn missing_credentials_fail_before_any_request() {
        let config = SyncConfig::from_lookup(|_| None).unwrap();
        let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::new());
        let err = runner_from_config(&config, SyncMode::Synchronous, store)
            .err()
            .unwrap();
        assert!(matches!(err, SyncError::Config(ConfigError::Missing(vars)) if vars.len() == 3));
    }
}
