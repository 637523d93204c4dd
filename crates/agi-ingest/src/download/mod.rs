//! Remote acquisition
//!
//! Pulls objects from the enabled remote sources into the dirty tree under a
//! per-source directory (`s3source/`, `sftpsource/`). The download ledger in
//! [`DownloaderProgress`] decides what needs fetching:
//!
//! - keys absent from the ledger
//! - keys whose size or modification time changed
//! - keys recorded earlier but never completed
//!
//! Transfers run with a per-source concurrency limit and one inline retry.
//! A failed transfer is recorded on its ledger entry; only a listing failure
//! fails the stage.

pub mod s3;
pub mod sftp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::{compile_optional, IngestConfig};
use crate::error::{IngestError, Result};
use crate::progress::{DownloaderFile, SharedProgress};

/// Attempts per file: the first try plus one inline retry
pub const TRANSFER_ATTEMPTS: u32 = 2;

/// Ledger timestamp layout
pub const LEDGER_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    S3,
    Sftp,
}

impl SourceKind {
    /// Subdirectory of the dirty tree this source writes into
    pub fn dir_name(self) -> &'static str {
        match self {
            SourceKind::S3 => "s3source",
            SourceKind::Sftp => "sftpsource",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SourceKind::S3 => "s3",
            SourceKind::Sftp => "sftp",
        }
    }
}

/// One listed remote object
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Which listed keys a source should fetch
#[derive(Debug, Clone, Default)]
pub struct KeyFilter {
    prefix: String,
    pattern: Option<Regex>,
    trim_leading_slash: bool,
}

impl KeyFilter {
    pub fn new(prefix: impl Into<String>, pattern: Option<Regex>) -> Self {
        Self {
            prefix: prefix.into(),
            pattern,
            trim_leading_slash: false,
        }
    }

    /// Also drop a `/` left over after removing the prefix before matching
    pub fn trim_leading_slash(mut self) -> Self {
        self.trim_leading_slash = true;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Directory markers never match; otherwise the pattern is applied to the
    /// key relative to the prefix
    pub fn accepts(&self, key: &str) -> bool {
        if key.ends_with('/') {
            return false;
        }
        let Some(pattern) = &self.pattern else {
            return true;
        };
        let mut relative = key.strip_prefix(self.prefix.as_str()).unwrap_or(key);
        if self.trim_leading_slash {
            relative = relative.trim_start_matches('/');
        }
        pattern.is_match(relative)
    }
}

#[async_trait]
pub trait RemoteSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Maximum parallel transfers for this source
    fn concurrency(&self) -> usize;

    fn key_filter(&self) -> &KeyFilter;

    /// List every object below the configured prefix
    async fn list(&self) -> anyhow::Result<Vec<RemoteObject>>;

    /// Fetch `key` into `dest`, truncating whatever is there
    async fn fetch(&self, key: &str, dest: &Path) -> anyhow::Result<()>;
}

pub struct Downloader {
    sources: Vec<Arc<dyn RemoteSource>>,
    dirty_root: PathBuf,
    concurrent_sources: bool,
    progress: SharedProgress,
}

impl Downloader {
    pub fn new(
        sources: Vec<Arc<dyn RemoteSource>>,
        dirty_root: impl Into<PathBuf>,
        concurrent_sources: bool,
        progress: SharedProgress,
    ) -> Self {
        Self {
            sources,
            dirty_root: dirty_root.into(),
            concurrent_sources,
            progress,
        }
    }

    /// Build the enabled sources from configuration
    pub async fn from_config(config: &IngestConfig, progress: SharedProgress) -> Result<Self> {
        let mut sources: Vec<Arc<dyn RemoteSource>> = Vec::new();

        let s3_config = &config.downloader.s3_source;
        if s3_config.enabled {
            let pattern = compile_optional(&s3_config.search_regex, "s3_source.search_regex")?;
            sources.push(Arc::new(s3::S3Source::new(s3_config, pattern).await?));
        }

        let sftp_config = &config.downloader.sftp_source;
        if sftp_config.enabled {
            let pattern = compile_optional(&sftp_config.search_regex, "sftp_source.search_regex")?;
            sources.push(Arc::new(sftp::SftpSource::new(sftp_config.clone(), pattern)));
        }

        Ok(Self::new(
            sources,
            &config.directories.dirty_temp,
            config.downloader.concurrent_sources,
            progress,
        ))
    }

    #[instrument(skip(self), fields(sources = self.sources.len()))]
    pub async fn download(&self) -> Result<()> {
        {
            let mut progress = self.progress.write();
            progress.downloader.finished = false;
            progress.downloader.flags.set_running(true);
            progress.downloader.flags.mark_changed();
        }
        let result = self.run_sources().await;

        {
            let mut progress = self.progress.write();
            let downloader = &mut progress.downloader;
            downloader.finished = result.is_ok();
            downloader.flags.set_running(false);
            downloader.flags.mark_changed();
        }
        result
    }

    async fn run_sources(&self) -> Result<()> {
        if self.sources.is_empty() {
            debug!("No remote sources enabled");
            return Ok(());
        }

        if self.concurrent_sources {
            let results =
                futures::future::join_all(self.sources.iter().map(|s| self.run_source(s.as_ref())))
                    .await;
            match IngestError::aggregate(results.into_iter().filter_map(|r| r.err())) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        } else {
            for source in &self.sources {
                self.run_source(source.as_ref()).await?;
            }
            Ok(())
        }
    }

    async fn run_source(&self, source: &dyn RemoteSource) -> Result<()> {
        let kind = source.kind();
        let objects = source.list().await.map_err(|e| IngestError::Listing {
            kind: kind.label(),
            message: format!("{:#}", e),
        })?;
        let listed = objects.len();
        let queue = self.schedule(kind, source.key_filter(), objects);
        info!(
            source = kind.label(),
            listed,
            scheduled = queue.len(),
            "Remote listing complete"
        );

        stream::iter(queue)
            .map(|key| self.transfer(source, key))
            .buffer_unordered(source.concurrency().max(1))
            .collect::<Vec<()>>()
            .await;
        Ok(())
    }

    /// Reconcile a listing with the ledger and return the keys to fetch
    fn schedule(
        &self,
        kind: SourceKind,
        filter: &KeyFilter,
        objects: Vec<RemoteObject>,
    ) -> Vec<String> {
        let mut progress = self.progress.write();
        let ledger = ledger_mut(&mut progress.downloader, kind);
        let mut queue = BTreeSet::new();

        for object in objects.into_iter().filter(|o| filter.accepts(&o.key)) {
            match ledger.get_mut(&object.key) {
                Some(entry)
                    if entry.size == object.size && entry.last_modified == object.last_modified =>
                {
                    if !entry.is_downloaded {
                        queue.insert(object.key);
                    }
                },
                Some(entry) => {
                    entry.size = object.size;
                    entry.last_modified = object.last_modified;
                    entry.is_downloaded = false;
                    queue.insert(object.key);
                },
                None => {
                    ledger.insert(
                        object.key.clone(),
                        DownloaderFile {
                            size: object.size,
                            last_modified: object.last_modified,
                            ..Default::default()
                        },
                    );
                    queue.insert(object.key);
                },
            }
        }

        progress.downloader.flags.mark_changed();
        queue.into_iter().collect()
    }

    async fn transfer(&self, source: &dyn RemoteSource, key: String) {
        let kind = source.kind();
        self.update_entry(kind, &key, |entry| {
            entry.start_time = ledger_now();
            entry.finish_time.clear();
        });

        let outcome = match local_path(&self.dirty_root, kind, &key) {
            Some(dest) => fetch_with_retry(source, &key, &dest).await,
            None => Err(format!("refusing to write remote key outside the input tree: {}", key)),
        };

        match &outcome {
            Ok(()) => debug!(source = kind.label(), key = %key, "Downloaded"),
            Err(e) => warn!(source = kind.label(), key = %key, error = %e, "Download failed"),
        }

        self.update_entry(kind, &key, |entry| {
            entry.finish_time = ledger_now();
            match outcome {
                Ok(()) => {
                    entry.is_downloaded = true;
                    entry.error.clear();
                },
                Err(e) => {
                    entry.is_downloaded = false;
                    entry.error = e;
                },
            }
        });
    }

    fn update_entry(&self, kind: SourceKind, key: &str, f: impl FnOnce(&mut DownloaderFile)) {
        let mut progress = self.progress.write();
        if let Some(entry) = ledger_mut(&mut progress.downloader, kind).get_mut(key) {
            f(entry);
        }
        progress.downloader.flags.mark_changed();
    }
}

async fn fetch_with_retry(
    source: &dyn RemoteSource,
    key: &str,
    dest: &Path,
) -> std::result::Result<(), String> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("create {}: {}", parent.display(), e))?;
    }

    let mut last_error = String::new();
    for attempt in 1..=TRANSFER_ATTEMPTS {
        match source.fetch(key, dest).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_error = format!("{:#}", e);
                if attempt < TRANSFER_ATTEMPTS {
                    debug!(key = %key, attempt, error = %last_error, "Transfer failed, retrying");
                }
            },
        }
    }
    Err(last_error)
}

fn ledger_mut(
    downloader: &mut crate::progress::DownloaderProgress,
    kind: SourceKind,
) -> &mut BTreeMap<String, DownloaderFile> {
    match kind {
        SourceKind::S3 => &mut downloader.s3_files,
        SourceKind::Sftp => &mut downloader.sftp_files,
    }
}

fn ledger_now() -> String {
    Utc::now().format(LEDGER_TIME_FORMAT).to_string()
}

/// Local landing path for a remote key, or `None` if the key would escape
pub fn local_path(dirty_root: &Path, kind: SourceKind, key: &str) -> Option<PathBuf> {
    let relative = Path::new(key.trim_start_matches('/'));
    let mut path = dirty_root.join(kind.dir_name());
    for component in relative.components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {},
            _ => return None,
        }
    }
    Some(path)
}
