//! Shared fixtures for pipeline integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use agi_ingest::config::IngestConfig;
use agi_ingest::download::{KeyFilter, RemoteObject, RemoteSource, SourceKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};
use walkdir::WalkDir;

/// A remote source backed by a local directory
pub struct LocalDirSource {
    root: PathBuf,
    kind: SourceKind,
    filter: KeyFilter,
    fetches: AtomicUsize,
}

impl LocalDirSource {
    pub fn new(root: impl Into<PathBuf>, kind: SourceKind) -> Self {
        Self {
            root: root.into(),
            kind,
            filter: KeyFilter::new("", None),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSource for LocalDirSource {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn concurrency(&self) -> usize {
        2
    }

    fn key_filter(&self) -> &KeyFilter {
        &self.filter
    }

    async fn list(&self) -> anyhow::Result<Vec<RemoteObject>> {
        let mut objects = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry.metadata()?;
            let key = entry
                .path()
                .strip_prefix(&self.root)?
                .to_string_lossy()
                .into_owned();
            objects.push(RemoteObject {
                key,
                size: meta.len(),
                last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }
        Ok(objects)
    }

    async fn fetch(&self, key: &str, dest: &Path) -> anyhow::Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        fs::copy(self.root.join(key), dest)?;
        Ok(())
    }
}

/// Settings rooted in a scratch directory, with printing off
pub fn config(root: &Path) -> IngestConfig {
    let mut config = IngestConfig::default();
    config.directories.dirty_temp = root.join("input");
    config.directories.logs = root.join("logs");
    config.directories.collect_info = root.join("collectinfo");
    config.directories.other_files = root.join("other");
    config.progress_file.output_file_path = root.join("progress");
    config.progress_print.enable = false;
    config
}

/// A server log announcing `node` in `cluster`, padded with `filler` lines
pub fn node_log(node: &str, cluster: &str, filler: &str) -> String {
    format!(
        "Jan 01 2024 00:00:00 GMT: INFO (clustering): (clustering.c:1) NODE-ID {} CLUSTER-SIZE 3 CLUSTER-NAME {}\n{}\n",
        node, cluster, filler
    )
}

/// A server log of exactly `len` bytes
pub fn node_log_of_len(node: &str, cluster: &str, len: usize) -> String {
    let mut log = node_log(node, cluster, "");
    while log.len() < len {
        log.push('x');
    }
    log.truncate(len - 1);
    log.push('\n');
    log
}

pub fn tar_gz_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn write(path: &Path, data: impl AsRef<[u8]>) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, data).unwrap();
}

/// Push the mtime of `path` `secs` seconds into the future
pub fn touch_later(path: &Path, secs: u64) {
    let later = SystemTime::now() + Duration::from_secs(secs);
    fs::File::options().write(true).open(path).unwrap().set_modified(later).unwrap();
}

/// Every file below `root` with its content
pub fn snapshot(root: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| (e.path().to_path_buf(), fs::read(e.path()).unwrap()))
        .collect()
}

/// Paths of every file below `root`, relative to it
pub fn layout(root: &Path) -> Vec<String> {
    snapshot(root)
        .keys()
        .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().into_owned())
        .collect()
}
