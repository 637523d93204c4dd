//! Hand-off to downstream processors
//!
//! Once preprocessing finishes, the pipeline runs a log branch and a
//! collectinfo branch concurrently through a [`DownstreamProcessor`]. The
//! bundled [`ManifestProcessor`] registers every normalized file in the
//! LogProcessor and CollectinfoProcessor documents, which the indexer reads.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::error::{IngestError, Result};
use crate::progress::{CfFile, LogFile, SharedProgress};

#[async_trait]
pub trait DownstreamProcessor: Send + Sync {
    /// Consume `<logs_root>/<cluster>/<prefix>_<node>_<suffix>` files
    async fn process_logs(&self, logs_root: &Path, progress: &SharedProgress) -> Result<()>;

    /// Consume `<collectinfo_root>/x<N>_<name>` bundles
    async fn process_collectinfo(&self, collectinfo_root: &Path, progress: &SharedProgress) -> Result<()>;
}

/// Records the normalized tree in the downstream progress documents
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestProcessor;

#[async_trait]
impl DownstreamProcessor for ManifestProcessor {
    async fn process_logs(&self, logs_root: &Path, progress: &SharedProgress) -> Result<()> {
        {
            let mut p = progress.write();
            p.log_processor.flags.set_running(true);
            if p.log_processor.start_time.is_none() {
                p.log_processor.start_time = Some(Utc::now());
            }
        }

        let root = logs_root.to_path_buf();
        let result = tokio::task::spawn_blocking(move || scan(&root, 2)).await;

        let mut p = progress.write();
        p.log_processor.flags.set_running(false);
        let files = result??;

        let mut registered = 0;
        for (path, size) in files {
            let Some(file) = log_entry(&path, size) else {
                warn!(path = %path.display(), "Not a normalized log name, skipping");
                continue;
            };
            let key = path.to_string_lossy().into_owned();
            if p.log_processor.files.get(&key) != Some(&file) {
                p.log_processor.files.insert(key, file);
                registered += 1;
            }
        }
        p.log_processor.finished = true;
        p.log_processor.flags.mark_changed();
        info!(registered, total = p.log_processor.files.len(), "Logs registered");
        Ok(())
    }

    async fn process_collectinfo(&self, collectinfo_root: &Path, progress: &SharedProgress) -> Result<()> {
        progress.read().collectinfo_processor.flags.set_running(true);

        let root = collectinfo_root.to_path_buf();
        let result = tokio::task::spawn_blocking(move || scan(&root, 1)).await;

        let mut p = progress.write();
        p.collectinfo_processor.flags.set_running(false);
        let files = result??;

        let mut registered = 0;
        for (path, size) in files {
            let key = path.to_string_lossy().into_owned();
            let known = p
                .collectinfo_processor
                .files
                .get(&key)
                .is_some_and(|f| f.size == size && f.processed);
            if known {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            p.collectinfo_processor.files.insert(
                key,
                CfFile {
                    size,
                    original_name: original_collectinfo_name(&name).to_string(),
                    processing_attempted: true,
                    processed: true,
                    ..Default::default()
                },
            );
            registered += 1;
        }
        p.collectinfo_processor.finished = true;
        p.collectinfo_processor.flags.mark_changed();
        info!(registered, total = p.collectinfo_processor.files.len(), "Collectinfo registered");
        Ok(())
    }
}

/// Regular files exactly `depth` levels below `root`, with sizes
fn scan(root: &Path, depth: usize) -> Result<BTreeMap<PathBuf, u64>> {
    let mut files = BTreeMap::new();
    if !root.exists() {
        return Ok(files);
    }
    for entry in WalkDir::new(root).min_depth(depth).max_depth(depth) {
        let entry = entry.map_err(|e| IngestError::Enumerate {
            path: root.to_path_buf(),
            message: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let size = entry
            .metadata()
            .map_err(|e| IngestError::Enumerate {
                path: entry.path().to_path_buf(),
                message: e.to_string(),
            })?
            .len();
        files.insert(entry.into_path(), size);
    }
    debug!(root = %root.display(), files = files.len(), "Scanned");
    Ok(files)
}

fn log_entry(path: &Path, size: u64) -> Option<LogFile> {
    let cluster = path.parent()?.file_name()?.to_string_lossy().into_owned();
    let name = path.file_name()?.to_string_lossy();
    let (prefix, node, suffix) = parse_log_name(&name)?;
    Some(LogFile {
        cluster_name: cluster,
        node_prefix: prefix,
        node_id: node.to_string(),
        node_suffix: suffix,
        size,
        processed: size,
        finished: true,
    })
}

/// Split `<prefix>_<node>_<suffix>`; the node part may itself contain `_`
pub fn parse_log_name(name: &str) -> Option<(u32, &str, u32)> {
    let (prefix, rest) = name.split_once('_')?;
    let (node, suffix) = rest.rsplit_once('_')?;
    if node.is_empty() {
        return None;
    }
    Some((prefix.parse().ok()?, node, suffix.parse().ok()?))
}

/// Strip the `x<N>_` placement prefix
pub fn original_collectinfo_name(name: &str) -> &str {
    name.strip_prefix('x')
        .and_then(|rest| rest.split_once('_'))
        .filter(|(digits, _)| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
        .map(|(_, original)| original)
        .unwrap_or(name)
}
