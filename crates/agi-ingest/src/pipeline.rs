//! Pipeline orchestration
//!
//! [`Ingest`] owns the shared progress state and the stage runners. Creating
//! one loads the persisted progress and starts two background loops, one
//! saving dirty stages and one printing progress, both stopped by
//! [`Ingest::close`].
//!
//! ```no_run
//! # async fn example() -> agi_ingest::Result<()> {
//! use agi_ingest::{config::IngestConfig, patterns::Patterns, pipeline::Ingest};
//!
//! let ingest = Ingest::init(IngestConfig::load(None)?, Patterns::default()).await?;
//! let outcome = ingest.run().await;
//! ingest.close().await?;
//! outcome?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::config::IngestConfig;
use crate::download::{Downloader, RemoteSource};
use crate::downstream::{DownstreamProcessor, ManifestProcessor};
use crate::error::{IngestError, Result};
use crate::patterns::Patterns;
use crate::preprocess::identity::IdentityResolver;
use crate::preprocess::{PreProcessSummary, PreProcessor};
use crate::progress::report::ProgressReporter;
use crate::progress::store::ProgressStore;
use crate::progress::SharedProgress;
use crate::unpack::{UnpackSummary, Unpacker};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub unpack: UnpackSummary,
    pub pre_process: PreProcessSummary,
}

pub struct Ingest {
    config: IngestConfig,
    progress: SharedProgress,
    store: Arc<ProgressStore>,
    downloader: Downloader,
    unpacker: Unpacker,
    pre_processor: PreProcessor,
    downstream: Arc<dyn DownstreamProcessor>,
    cancel: CancellationToken,
    background: Vec<JoinHandle<()>>,
}

impl Ingest {
    /// Load progress and build the configured remote sources
    pub async fn init(config: IngestConfig, patterns: Patterns) -> Result<Self> {
        config.validate()?;
        let store = ProgressStore::new(&config.progress_file);
        let progress = SharedProgress::new(store.load()?);
        let downloader = Downloader::from_config(&config, progress.clone()).await?;
        Self::assemble(config, patterns, store, progress, downloader, Arc::new(ManifestProcessor))
    }

    /// Like [`Ingest::init`], with caller supplied sources and downstream processor
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_sources(
        config: IngestConfig,
        patterns: Patterns,
        sources: Vec<Arc<dyn RemoteSource>>,
        downstream: Arc<dyn DownstreamProcessor>,
    ) -> Result<Self> {
        config.validate()?;
        let store = ProgressStore::new(&config.progress_file);
        let progress = SharedProgress::new(store.load()?);
        let downloader = Downloader::new(
            sources,
            &config.directories.dirty_temp,
            config.downloader.concurrent_sources,
            progress.clone(),
        );
        Self::assemble(config, patterns, store, progress, downloader, downstream)
    }

    fn assemble(
        config: IngestConfig,
        patterns: Patterns,
        store: ProgressStore,
        progress: SharedProgress,
        downloader: Downloader,
        downstream: Arc<dyn DownstreamProcessor>,
    ) -> Result<Self> {
        let resolver = IdentityResolver::new(&patterns, config.node_id_regex()?);
        let mut ingest = Self {
            unpacker: Unpacker::new(&config, progress.clone()),
            pre_processor: PreProcessor::new(&config, resolver, progress.clone()),
            config,
            progress,
            store: Arc::new(store),
            downloader,
            downstream,
            cancel: CancellationToken::new(),
            background: Vec::new(),
        };
        if let Some(handle) = ingest.spawn_save_loop() {
            ingest.background.push(handle);
        }
        if let Some(handle) = ingest.spawn_print_loop() {
            ingest.background.push(handle);
        }
        Ok(ingest)
    }

    pub fn progress(&self) -> &SharedProgress {
        &self.progress
    }

    /// Download, unpack and preprocess, then run both downstream branches
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<RunSummary> {
        info!("Downloading");
        self.downloader
            .download()
            .await
            .map_err(IngestError::in_stage("Download"))?;

        info!("Unpacking");
        let unpack = self
            .unpacker
            .unpack()
            .await
            .map_err(IngestError::in_stage("Unpack"))?;

        info!("Preprocessing");
        let pre_process = self
            .pre_processor
            .pre_process()
            .await
            .map_err(IngestError::in_stage("PreProcess"))?;

        let logs_root = self.config.directories.logs.clone();
        let collectinfo_root = self.config.directories.collect_info.clone();
        let (logs, collectinfo) = tokio::join!(
            self.downstream.process_logs(&logs_root, &self.progress),
            self.downstream.process_collectinfo(&collectinfo_root, &self.progress),
        );
        let failures = [
            logs.err().map(IngestError::in_stage("ProcessLogs")),
            collectinfo.err().map(IngestError::in_stage("ProcessCollectInfo")),
        ];
        if let Some(err) = IngestError::aggregate(failures.into_iter().flatten()) {
            return Err(err);
        }

        info!("Ingest complete");
        Ok(RunSummary { unpack, pre_process })
    }

    /// Stop the background loops and write any unsaved progress
    pub async fn close(mut self) -> Result<()> {
        self.cancel.cancel();
        for handle in self.background.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        if self.config.progress_file.disable_write {
            return Ok(());
        }

        let store = self.store.clone();
        let progress = self.progress.clone();
        let written = tokio::task::spawn_blocking(move || store.save(&progress.read())).await??;
        debug!(documents = written, "Final progress save");
        Ok(())
    }

    fn spawn_save_loop(&self) -> Option<JoinHandle<()>> {
        let settings = &self.config.progress_file;
        if settings.disable_write {
            debug!("Progress writing disabled");
            return None;
        }
        let store = self.store.clone();
        let progress = self.progress.clone();
        let cancel = self.cancel.clone();
        let interval = settings.write_interval();
        debug!(?interval, dir = %settings.output_file_path.display(), "Saving progress periodically");

        Some(tokio::spawn(every(interval, cancel, move || {
            let store = store.clone();
            let progress = progress.clone();
            async move {
                match tokio::task::spawn_blocking(move || store.save(&progress.read())).await {
                    Ok(Ok(0)) => {},
                    Ok(Ok(written)) => trace!(documents = written, "Progress saved"),
                    Ok(Err(e)) => warn!(error = %e, "Progress could not be saved"),
                    Err(e) => warn!(error = %e, "Progress save task failed"),
                }
            }
        })))
    }

    fn spawn_print_loop(&self) -> Option<JoinHandle<()>> {
        let settings = &self.config.progress_print;
        if !settings.enable {
            debug!("Progress printing disabled");
            return None;
        }
        let reporter = ProgressReporter::new(&self.config);
        let progress = self.progress.clone();
        let cancel = self.cancel.clone();

        Some(tokio::spawn(every(settings.update_interval(), cancel, move || {
            reporter.report(&progress.read());
            async {}
        })))
    }
}

impl Drop for Ingest {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Run `tick` on every interval until `cancel` fires; the first tick waits one interval
async fn every<F, Fut>(interval: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => tick().await,
        }
    }
}

/// Initialize, run and close in one call; progress is saved even when the run fails
pub async fn run_with_config(config: IngestConfig, patterns: Patterns) -> Result<RunSummary> {
    let ingest = Ingest::init(config, patterns)
        .await
        .map_err(IngestError::in_stage("Init"))?;
    let outcome = ingest.run().await;
    let closed = ingest.close().await;
    let summary = outcome?;
    closed?;
    Ok(summary)
}
