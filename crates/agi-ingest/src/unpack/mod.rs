//! Recursive archive expansion
//!
//! Runs full rounds until one extracts nothing. Each round enumerates the
//! working tree, extracts every archive not yet known to fail into
//! `<archive>.dir`, then removes the consumed archive. Nested archives surface
//! one level per round.
//!
//! In read-only input mode an archive from the input tree is first copied to
//! the same relative path under the staging tree and only that copy is
//! extracted and removed. Originals that a finished earlier run extracted are
//! not staged again unless their size or mtime changed.

pub mod extract;

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::IngestConfig;
use crate::enumerate;
use crate::error::Result;
use crate::fsops::{self, relocate};
use crate::progress::{EnumFile, SharedProgress};
use extract::ArchiveSpec;

type Stamp = (u64, Option<chrono::DateTime<chrono::Utc>>);

/// Attempts per archive: the first try plus one inline retry
pub const EXTRACT_ATTEMPTS: u32 = 2;

pub const EXTRACTED_DIR_SUFFIX: &str = ".dir";

#[derive(Debug, Clone)]
struct UnpackPaths {
    dirty_root: PathBuf,
    staging_root: PathBuf,
    read_only: bool,
}

pub struct Unpacker {
    paths: Arc<UnpackPaths>,
    threads: usize,
    collectinfo_max_size: u64,
    progress: SharedProgress,
}

/// Outcome of a completed unpack stage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpackSummary {
    /// Rounds run, including the final one that extracted nothing
    pub rounds: usize,
    pub extracted: usize,
    pub failed: usize,
}

impl Unpacker {
    pub fn new(config: &IngestConfig, progress: SharedProgress) -> Self {
        Self {
            paths: Arc::new(UnpackPaths {
                dirty_root: config.directories.dirty_temp.clone(),
                staging_root: config.directories.staging_dir(),
                read_only: config.directories.read_only_input,
            }),
            threads: config.pre_processor.unpacker_file_threads.max(1),
            collectinfo_max_size: config.collect_info_max_size,
            progress,
        }
    }

    #[instrument(skip(self), fields(read_only = self.paths.read_only))]
    pub async fn unpack(&self) -> Result<UnpackSummary> {
        let consumed = self.previously_extracted();
        {
            let mut progress = self.progress.write();
            progress.unpacker.finished = false;
            progress.unpacker.flags.set_running(true);
            progress.unpacker.flags.mark_changed();
        }
        let result = self.run_rounds(consumed).await;

        let mut progress = self.progress.write();
        progress.unpacker.flags.set_running(false);
        if let Ok(summary) = &result {
            progress.unpacker.finished = true;
            progress.unpacker.flags.mark_changed();
            info!(
                rounds = summary.rounds,
                extracted = summary.extracted,
                failed = summary.failed,
                "Unpack complete"
            );
        }
        result
    }

    /// Read-only originals that a finished earlier run already extracted, with their stamps
    fn previously_extracted(&self) -> BTreeMap<String, Stamp> {
        if !self.paths.read_only {
            return BTreeMap::new();
        }
        let progress = self.progress.read();
        if !progress.unpacker.finished {
            return BTreeMap::new();
        }
        progress
            .unpacker
            .files
            .iter()
            .filter(|(path, file)| {
                file.is_archive
                    && !file.unpack_failed
                    && !Path::new(path.as_str()).starts_with(&self.paths.staging_root)
            })
            .map(|(path, file)| (path.clone(), file.stamp()))
            .collect()
    }

    async fn run_rounds(&self, mut consumed: BTreeMap<String, Stamp>) -> Result<UnpackSummary> {
        let mut failed: BTreeMap<String, String> = BTreeMap::new();
        let mut summary = UnpackSummary::default();

        loop {
            summary.rounds += 1;
            let files = self.enumerate().await?;
            let candidates: Vec<(String, EnumFile)> = files
                .iter()
                .filter(|(path, file)| {
                    file.is_archive
                        && !failed.contains_key(*path)
                        && consumed.get(*path) != Some(&file.stamp())
                })
                .map(|(path, file)| (path.clone(), file.clone()))
                .collect();
            self.record(files, &failed);

            if candidates.is_empty() {
                break;
            }
            debug!(round = summary.rounds, archives = candidates.len(), "Unpack round");

            let outcomes: Vec<(String, Stamp, std::result::Result<bool, String>)> =
                stream::iter(candidates)
                    .map(|(path, file)| {
                        let paths = self.paths.clone();
                        async move {
                            let task_path = path.clone();
                            let stamp = file.stamp();
                            let outcome = tokio::task::spawn_blocking(move || {
                                unpack_one(&paths, Path::new(&task_path), &file)
                            })
                            .await
                            .unwrap_or_else(|e| Err(format!("unpack task failed: {}", e)));
                            (path, stamp, outcome)
                        }
                    })
                    .buffer_unordered(self.threads)
                    .collect()
                    .await;

            let mut successes = 0;
            for (path, stamp, outcome) in outcomes {
                match outcome {
                    Ok(original_kept) => {
                        successes += 1;
                        if original_kept {
                            consumed.insert(path, stamp);
                        }
                    },
                    Err(e) => {
                        warn!(path = %path, error = %e, "Unpack failed, skipping for the rest of the run");
                        failed.insert(path, e);
                    },
                }
            }
            summary.extracted += successes;

            if successes == 0 {
                break;
            }
        }

        summary.failed = failed.len();
        let files = self.enumerate().await?;
        self.record(files, &failed);
        Ok(summary)
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

    /// Store the latest enumeration, with failures folded in
    fn record(&self, mut files: BTreeMap<String, EnumFile>, failed: &BTreeMap<String, String>) {
        for (path, error) in failed {
            if let Some(file) = files.get_mut(path) {
                file.unpack_failed = true;
                if !file.errors.contains(error) {
                    file.errors.push(error.clone());
                }
            }
        }
        let mut progress = self.progress.write();
        progress.unpacker.files = files;
        progress.unpacker.flags.mark_changed();
    }
}

/// Extract one archive; `Ok(true)` means the read-only original stays in place
fn unpack_one(
    paths: &UnpackPaths,
    path: &Path,
    file: &EnumFile,
) -> std::result::Result<bool, String> {
    let Some(kind) = file.archive else {
        return Err("not an archive".to_string());
    };
    let spec = ArchiveSpec {
        kind,
        tar_wrapped: file.is_tar_gz || file.is_tar_bz,
    };

    let stage_copy = paths.read_only && !path.starts_with(&paths.staging_root);
    let work = if stage_copy {
        let staged = fsops::mirror_path(path, &paths.dirty_root, &paths.staging_root)
            .ok_or_else(|| format!("{} is outside the input tree", path.display()))?;
        relocate(path, &staged, true)
            .map_err(|e| format!("failed to stage {}: {}", path.display(), e))?;
        staged
    } else {
        path.to_path_buf()
    };
    let out_dir = extracted_dir(&work);

    let extracted = with_retries(EXTRACT_ATTEMPTS, &work, || {
        if out_dir.exists() {
            let _ = fs::remove_dir_all(&out_dir);
        }
        extract::extract(&work, spec, &out_dir)
    });
    if let Err(last_error) = extracted {
        let _ = fs::remove_dir_all(&out_dir);
        if stage_copy {
            let _ = fsops::remove_if_exists(&work);
        }
        return Err(last_error);
    }

    fsops::remove_if_exists(&work)
        .map_err(|e| format!("extracted but could not remove {}: {}", work.display(), e))?;
    Ok(stage_copy)
}

/// Run `op` until it succeeds or `attempts` runs out; the last error wins
fn with_retries<E: std::fmt::Display>(
    attempts: u32,
    path: &Path,
    mut op: impl FnMut() -> std::result::Result<(), E>,
) -> std::result::Result<(), String> {
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_error = format!("{:#}", e);
                if attempt < attempts {
                    debug!(path = %path.display(), error = %last_error, "Extraction failed, retrying");
                }
            },
        }
    }
    Err(last_error)
}

/// `<archive>.dir` next to the archive
pub fn extracted_dir(archive: &Path) -> PathBuf {
    let mut name = OsString::from(archive.as_os_str());
    name.push(EXTRACTED_DIR_SUFFIX);
    PathBuf::from(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_extraction_gets_one_retry() {
        let calls = Cell::new(0);
        let result = with_retries(EXTRACT_ATTEMPTS, Path::new("a.tgz"), || {
            calls.set(calls.get() + 1);
            if calls.get() == 1 {
                Err("truncated stream")
            } else {
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_extraction_reports_last_error() {
        let calls = Cell::new(0);
        let result = with_retries(EXTRACT_ATTEMPTS, Path::new("a.tgz"), || {
            calls.set(calls.get() + 1);
            Err(format!("attempt {} failed", calls.get()))
        });
        assert_eq!(result.unwrap_err(), "attempt 2 failed");
        assert_eq!(calls.get(), 2);
    }
}
