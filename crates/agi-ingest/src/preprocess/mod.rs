//! Preprocessing: from an unpacked working tree to placed log files
//!
//! 1. Enumerate the working tree (plus staging in read-only mode)
//! 2. Mark content duplicates and drop them
//! 3. Move collectinfo bundles to `collect_info/x<N>_<name>`
//! 4. Split multiplexed exports, resolve each log's identity and move it to
//!    `logs/<cluster>/<prefix>_<node>_<suffix>`
//! 5. Sweep whatever is left into `other_files/<unix time>/`
//!
//! Files under the input tree are never modified in read-only mode; files the
//! pipeline wrote to staging itself may still be moved.

pub mod dedup;
pub mod identity;
pub mod special;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::config::{DedupConfig, IngestConfig};
use crate::enumerate;
use crate::error::{IngestError, Result};
use crate::fsops::{self, relocate};
use crate::progress::{EnumFile, SharedProgress};
use identity::IdentityResolver;
use special::SplitOutcome;

#[derive(Debug, Clone)]
struct PreProcessPaths {
    dirty_root: PathBuf,
    staging_root: PathBuf,
    logs_root: PathBuf,
    collectinfo_root: PathBuf,
    other_root: PathBuf,
    read_only: bool,
}

impl PreProcessPaths {
    /// Whether `path` must be copied rather than moved
    fn protected(&self, path: &Path) -> bool {
        self.read_only && !path.starts_with(&self.staging_root)
    }

    /// Where split outputs of `path` are written
    fn split_base(&self, path: &Path) -> PathBuf {
        if !self.protected(path) {
            return path.to_path_buf();
        }
        fsops::mirror_path(path, &self.dirty_root, &self.staging_root).unwrap_or_else(|| {
            self.staging_root
                .join(path.file_name().unwrap_or_else(|| path.as_os_str()))
        })
    }
}

pub struct PreProcessor {
    paths: Arc<PreProcessPaths>,
    resolver: Arc<IdentityResolver>,
    dedup: DedupConfig,
    threads: usize,
    collectinfo_max_size: u64,
    progress: SharedProgress,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreProcessSummary {
    /// Log files placed under the logs tree
    pub logs: usize,
    pub collectinfo: usize,
    pub duplicates: usize,
    /// Files that recorded at least one error
    pub failed: usize,
    /// Files skipped because an earlier run already placed them
    pub resumed: usize,
    pub leftovers: usize,
}

impl PreProcessor {
    pub fn new(config: &IngestConfig, resolver: IdentityResolver, progress: SharedProgress) -> Self {
        let dirs = &config.directories;
        Self {
            paths: Arc::new(PreProcessPaths {
                dirty_root: dirs.dirty_temp.clone(),
                staging_root: dirs.staging_dir(),
                logs_root: dirs.logs.clone(),
                collectinfo_root: dirs.collect_info.clone(),
                other_root: dirs.other_files.clone(),
                read_only: dirs.read_only_input,
            }),
            resolver: Arc::new(resolver),
            dedup: config.dedup.clone(),
            threads: config.pre_processor.file_threads.max(1),
            collectinfo_max_size: config.collect_info_max_size,
            progress,
        }
    }

    #[instrument(skip(self), fields(read_only = self.paths.read_only))]
    pub async fn pre_process(&self) -> Result<PreProcessSummary> {
        {
            let mut progress = self.progress.write();
            progress.pre_processor.finished = false;
            progress.pre_processor.flags.set_running(true);
            progress.pre_processor.flags.mark_changed();
        }
        let result = self.run().await;

        let mut progress = self.progress.write();
        progress.pre_processor.flags.set_running(false);
        if let Ok(summary) = &result {
            progress.pre_processor.finished = true;
            progress.pre_processor.flags.mark_changed();
            info!(
                logs = summary.logs,
                collectinfo = summary.collectinfo,
                duplicates = summary.duplicates,
                failed = summary.failed,
                resumed = summary.resumed,
                leftovers = summary.leftovers,
                "Preprocess complete"
            );
        }
        result
    }

    async fn run(&self) -> Result<PreProcessSummary> {
        self.prepare_dirs()?;
        let mut files = self.enumerate().await?;
        let mut summary = PreProcessSummary::default();

        let resumed = self.resumable(&files);
        summary.resumed = resumed.len();
        if !resumed.is_empty() {
            debug!(files = resumed.len(), "Skipping files placed by an earlier run");
        }

        if self.dedup.enabled {
            summary.duplicates = self.drop_duplicates(&mut files, &resumed).await?;
        }

        summary.collectinfo = self.place_collectinfo(&mut files, &resumed);

        let work: Vec<(String, EnumFile)> = files
            .iter()
            .filter(|(path, file)| {
                file.is_text
                    && !file.is_collect_info
                    && file.pre_process_duplicate_of.is_empty()
                    && !resumed.contains(*path)
            })
            .map(|(path, file)| (path.clone(), file.clone()))
            .collect();
        debug!(files = work.len(), "Processing text files");

        let processed: Vec<(String, EnumFile)> = stream::iter(work)
            .map(|(path, file)| {
                let paths = self.paths.clone();
                let resolver = self.resolver.clone();
                let progress = self.progress.clone();
                async move {
                    let task_path = path.clone();
                    let mut fallback = file.clone();
                    let file = tokio::task::spawn_blocking(move || {
                        process_text(&paths, &resolver, &progress, &task_path, file)
                    })
                    .await
                    .unwrap_or_else(|e| {
                        fallback.errors.push(format!("preprocess task failed: {}", e));
                        fallback
                    });
                    (path, file)
                }
            })
            .buffer_unordered(self.threads)
            .collect()
            .await;

        for (path, file) in processed {
            summary.logs += file.pre_process_out_paths.len();
            files.insert(path, file);
        }
        summary.failed = files.values().filter(|f| !f.errors.is_empty()).count();

        if !self.paths.read_only {
            let paths = self.paths.clone();
            summary.leftovers = tokio::task::spawn_blocking(move || move_leftovers(&paths)).await?;
        }

        let mut progress = self.progress.write();
        for (path, file) in files {
            if !resumed.contains(&path) {
                progress.pre_processor.files.insert(path, file);
            }
        }
        progress.pre_processor.flags.mark_changed();
        Ok(summary)
    }

    /// Read-only inputs an earlier run already handled
    ///
    /// Writable runs move or delete everything they handle, so whatever is
    /// still in the tree there is new or changed.
    fn resumable(&self, files: &BTreeMap<String, EnumFile>) -> BTreeSet<String> {
        if !self.paths.read_only {
            return BTreeSet::new();
        }
        let progress = self.progress.read();
        files
            .iter()
            .filter(|(path, file)| already_placed(progress.pre_processor.files.get(*path), file))
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn prepare_dirs(&self) -> Result<()> {
        let mut dirs = vec![&self.paths.logs_root, &self.paths.collectinfo_root];
        if !self.paths.read_only {
            dirs.push(&self.paths.other_root);
        }
        for dir in dirs {
            fs::create_dir_all(dir).map_err(|e| IngestError::io(dir, e))?;
        }
        Ok(())
    }

    async fn enumerate(&self) -> Result<BTreeMap<String, EnumFile>> {
        let paths = self.paths.clone();
        let max = self.collectinfo_max_size;
        tokio::task::spawn_blocking(move || {
            let mut roots = vec![paths.dirty_root.as_path()];
            if paths.read_only {
                roots.push(paths.staging_root.as_path());
            }
            enumerate::enumerate(&roots, max)
        })
        .await?
    }

    async fn drop_duplicates(
        &self,
        files: &mut BTreeMap<String, EnumFile>,
        resumed: &BTreeSet<String>,
    ) -> Result<usize> {
        let candidates: BTreeMap<String, EnumFile> = files
            .iter()
            .filter(|(path, _)| !resumed.contains(*path))
            .map(|(path, file)| (path.clone(), file.clone()))
            .collect();
        let read_bytes = self.dedup.read_bytes;
        let duplicates =
            tokio::task::spawn_blocking(move || dedup::find_duplicates(&candidates, read_bytes)).await?;

        for (dup, canonical) in &duplicates {
            let Some(file) = files.get_mut(dup) else {
                continue;
            };
            debug!(duplicate = %dup, canonical = %canonical, "Duplicate content");
            file.pre_process_duplicate_of = canonical.clone();
            if !self.paths.read_only {
                if let Err(e) = fsops::remove_if_exists(Path::new(dup.as_str())) {
                    warn!(path = %dup, error = %e, "Could not remove duplicate");
                    file.errors.push(format!("failed to remove duplicate: {}", e));
                }
            }
        }
        Ok(duplicates.len())
    }

    fn place_collectinfo(&self, files: &mut BTreeMap<String, EnumFile>, resumed: &BTreeSet<String>) -> usize {
        let mut placed = 0;
        for (path, file) in files.iter_mut() {
            if !file.is_collect_info || resumed.contains(path) {
                continue;
            }
            let src = Path::new(path.as_str());
            let name = src
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let counter = self.progress.write().pre_processor.next_collectinfo_prefix();
            let dst = self.paths.collectinfo_root.join(format!("x{}_{}", counter, name));

            match relocate(src, &dst, self.paths.protected(src)) {
                Ok(()) => {
                    placed += 1;
                    file.pre_process_out_paths = vec![dst.to_string_lossy().into_owned()];
                },
                Err(e) => {
                    warn!(path = %path, error = %e, "Could not place collectinfo");
                    file.errors.push(format!("failed to place collectinfo: {}", e));
                },
            }
        }
        placed
    }
}

/// An earlier run placed or deduplicated this file and its size and mtime are unchanged
fn already_placed(prior: Option<&EnumFile>, current: &EnumFile) -> bool {
    prior.is_some_and(|prior| {
        let placed = !prior.pre_process_out_paths.is_empty()
            && prior
                .pre_process_out_paths
                .iter()
                .all(|out| Path::new(out).exists());
        prior.stamp() == current.stamp()
            && prior.errors.is_empty()
            && (placed || !prior.pre_process_duplicate_of.is_empty())
    })
}

fn process_text(
    paths: &PreProcessPaths,
    resolver: &IdentityResolver,
    progress: &SharedProgress,
    path: &str,
    mut file: EnumFile,
) -> EnumFile {
    let src = Path::new(path);
    let candidates = match special::split(src, &file.content_type, &paths.split_base(src)) {
        Ok(SplitOutcome::Standard) => vec![src.to_path_buf()],
        Ok(SplitOutcome::Split(outputs)) => outputs,
        Err(e) => {
            warn!(path = %path, error = %e, "Special split failed");
            file.errors.push(format!("special split failed: {:#}", e));
            return file;
        },
    };

    for candidate in candidates {
        match place_log(paths, resolver, progress, &candidate) {
            Ok(dst) => file.pre_process_out_paths.push(dst.to_string_lossy().into_owned()),
            Err(e) => {
                warn!(path = %candidate.display(), error = %e, "Could not place log");
                file.errors.push(format!("{}: {}", candidate.display(), e));
            },
        }
    }

    let mut progress = progress.write();
    progress.pre_processor.files.insert(path.to_string(), file.clone());
    progress.pre_processor.flags.mark_changed();
    file
}

fn place_log(
    paths: &PreProcessPaths,
    resolver: &IdentityResolver,
    progress: &SharedProgress,
    candidate: &Path,
) -> Result<PathBuf> {
    let identity = resolver.resolve(candidate)?;
    let slot = progress
        .write()
        .pre_processor
        .allocate_identity(&identity.cluster, &identity.node);

    let dst = paths.logs_root.join(path_component(&identity.cluster)).join(format!(
        "{}_{}_{}",
        slot.prefix,
        path_component(&identity.node),
        slot.suffix
    ));
    relocate(candidate, &dst, paths.protected(candidate)).map_err(|e| IngestError::io(candidate, e))?;
    debug!(src = %candidate.display(), dst = %dst.display(), "Placed log");
    Ok(dst)
}

/// A name usable as a single path component
fn path_component(name: &str) -> String {
    match name {
        "" | "." | ".." => "_".to_string(),
        _ => name.replace(['/', '\\', '\0'], "_"),
    }
}

/// Move everything left in the dirty tree to `other_files/<unix time>/`
fn move_leftovers(paths: &PreProcessPaths) -> usize {
    if !paths.dirty_root.exists() {
        return 0;
    }
    let target = paths.other_root.join(Utc::now().timestamp().to_string());
    let leftovers: Vec<PathBuf> = WalkDir::new(&paths.dirty_root)
        .min_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();

    let mut moved = 0;
    for path in &leftovers {
        let Some(dst) = fsops::mirror_path(path, &paths.dirty_root, &target) else {
            continue;
        };
        match relocate(path, &dst, false) {
            Ok(()) => moved += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Could not move leftover file"),
        }
    }

    let dirs: Vec<PathBuf> = WalkDir::new(&paths.dirty_root)
        .min_depth(1)
        .contents_first(true)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_dir())
        .map(|entry| entry.into_path())
        .collect();
    for dir in dirs {
        // Only empty directories go; anything that failed to move keeps its parent.
        let _ = fs::remove_dir(&dir);
    }

    if moved > 0 {
        info!(files = moved, target = %target.display(), "Moved unprocessed files aside");
    }
    moved
}
