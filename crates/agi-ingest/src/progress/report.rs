//! Human readable progress reports
//!
//! Each report walks the stages once. A stage that is idle and was idle on
//! the previous report prints nothing; otherwise it prints a running or
//! finished line, then optional per-file detail and an overall summary.

use byte_unit::{Byte, UnitType};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use super::{DownloaderFile, Progress, Stage, Transition};
use crate::config::IngestConfig;
use crate::download::{local_path, SourceKind};

/// Estimate shown when nothing has been processed yet
pub const UNKNOWN_REMAINING: Duration = Duration::from_secs(24 * 60 * 60);

pub fn format_size(bytes: u64) -> String {
    format!("{:.2}", Byte::from_u64(bytes).get_appropriate_unit(UnitType::Binary))
}

/// Aggregate rate over a processing run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throughput {
    pub total: u64,
    pub processed: u64,
    pub per_second: u64,
    pub percent: u64,
    pub remaining: Duration,
}

impl Throughput {
    pub fn compute(total: u64, processed: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs().max(1);
        let per_second = processed / secs;
        let left = total.saturating_sub(processed);
        Self {
            total,
            processed,
            per_second,
            percent: if total > 0 { processed * 100 / total } else { 0 },
            remaining: if per_second >= 1 {
                Duration::from_secs(left / per_second)
            } else {
                UNKNOWN_REMAINING
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressReporter {
    dirty_root: PathBuf,
    print_overall: bool,
    print_detail: bool,
}

impl ProgressReporter {
    pub fn new(config: &IngestConfig) -> Self {
        Self {
            dirty_root: config.directories.dirty_temp.clone(),
            print_overall: config.progress_print.print_overall,
            print_detail: config.progress_print.print_detail,
        }
    }

    pub fn report(&self, progress: &Progress) {
        for line in self.lines(progress) {
            info!("{}", line);
        }
    }

    /// Build one report; advances each stage's running transition
    pub fn lines(&self, progress: &Progress) -> Vec<String> {
        let mut out = Vec::new();

        if let Some(state) = state_line(&progress.downloader) {
            out.push(state);
            let sources = [
                (SourceKind::S3, &progress.downloader.s3_files),
                (SourceKind::Sftp, &progress.downloader.sftp_files),
            ];
            for (kind, files) in sources {
                self.downloader_lines(kind, files, &mut out);
            }
        }

        if let Some(state) = state_line(&progress.unpacker) {
            out.push(state);
            if self.print_detail {
                for (path, f) in &progress.unpacker.files {
                    out.push(format!(
                        "Unpacker detail file:{} size:{} archive:{} collectinfo:{} tar_gz:{} tar_bz:{} text:{} unpack_failed:{} content_type:{} errors:{:?}",
                        path,
                        format_size(f.size),
                        f.is_archive,
                        f.is_collect_info,
                        f.is_tar_gz,
                        f.is_tar_bz,
                        f.is_text,
                        f.unpack_failed,
                        f.content_type,
                        f.errors
                    ));
                }
            }
        }

        if let Some(state) = state_line(&progress.pre_processor) {
            out.push(state);
            if self.print_detail {
                for (path, f) in &progress.pre_processor.files {
                    let placement = if f.pre_process_duplicate_of.is_empty() {
                        format!("outputs:{:?}", f.pre_process_out_paths)
                    } else {
                        format!("duplicate_of:{}", f.pre_process_duplicate_of)
                    };
                    out.push(format!(
                        "PreProcessor detail file:{} size:{} text:{} collectinfo:{} content_type:{} errors:{:?} {}",
                        path,
                        format_size(f.size),
                        f.is_text,
                        f.is_collect_info,
                        f.content_type,
                        f.errors,
                        placement
                    ));
                }
            }
        }

        if let Some(state) = state_line(&progress.collectinfo_processor) {
            out.push(state);
            if self.print_detail {
                for (path, f) in &progress.collectinfo_processor.files {
                    out.push(format!(
                        "CollectinfoProcessor detail file:{} size:{} node:{} attempted:{} processed:{} original:{} errors:{:?}",
                        path,
                        format_size(f.size),
                        f.node_id,
                        f.processing_attempted,
                        f.processed,
                        f.original_name,
                        f.errors
                    ));
                }
            }
        }

        if let Some(state) = state_line(&progress.log_processor) {
            out.push(state);
            let logs = &progress.log_processor;
            if self.print_detail {
                for (path, f) in &logs.files {
                    out.push(format!(
                        "LogProcessor detail file:{} size:{} processed:{} cluster:{} finished:{} node:{}_{}_{}",
                        path,
                        format_size(f.size),
                        format_size(f.processed),
                        f.cluster_name,
                        f.finished,
                        f.node_prefix,
                        f.node_id,
                        f.node_suffix
                    ));
                }
            }
            if self.print_overall {
                let total = logs.files.values().map(|f| f.size).sum();
                let processed = logs.files.values().map(|f| f.processed).sum();
                let elapsed = logs
                    .start_time
                    .and_then(|start| (Utc::now() - start).to_std().ok())
                    .unwrap_or_default();
                let t = Throughput::compute(total, processed, elapsed);
                out.push(format!(
                    "LogProcessor summary processed:{} total:{} remaining:{} speed:{}/s complete:{}% run_time:{}s remaining_time:{}s",
                    format_size(t.processed),
                    format_size(t.total),
                    format_size(t.total.saturating_sub(t.processed)),
                    format_size(t.per_second),
                    t.percent,
                    elapsed.as_secs(),
                    t.remaining.as_secs()
                ));
            }
        }

        out
    }

    fn downloader_lines(&self, kind: SourceKind, files: &BTreeMap<String, DownloaderFile>, out: &mut Vec<String>) {
        let mut done = 0;
        let mut total_size = 0;
        let mut downloaded_size = 0;
        for (key, f) in files {
            total_size += f.size;
            let have = if f.is_downloaded {
                done += 1;
                f.size
            } else {
                local_path(&self.dirty_root, kind, key)
                    .map(|path| partial_size(&path))
                    .unwrap_or(0)
            };
            downloaded_size += have;
            if self.print_detail {
                out.push(format!(
                    "Downloader detail source:{} file:{} size:{} downloaded:{} modified:{} done:{} error:'{}'",
                    kind.label(),
                    key,
                    format_size(f.size),
                    format_size(have),
                    f.last_modified.map(|t| t.to_rfc3339()).unwrap_or_default(),
                    f.is_downloaded,
                    f.error
                ));
            }
        }
        if self.print_overall {
            out.push(format!(
                "Downloader progress source:{} files:{} downloaded_files:{} size:{} downloaded_size:{}",
                kind.label(),
                files.len(),
                done,
                format_size(total_size),
                format_size(downloaded_size)
            ));
        }
    }
}

/// Size of a partially transferred file, zero if it is not there yet
fn partial_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// The running/finished line of a stage, or `None` when it has nothing to report
fn state_line<S: Stage>(stage: &S) -> Option<String> {
    match stage.flags().transition() {
        Transition::Started | Transition::Running => Some(format!("{} running", S::LABEL)),
        Transition::Stopped => Some(format!("{} finished", S::LABEL)),
        Transition::Idle => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::progress::LogFile;

    #[test]
    fn test_throughput() {
        let t = Throughput::compute(1000, 250, Duration::from_secs(5));
        assert_eq!(t.per_second, 50);
        assert_eq!(t.percent, 25);
        assert_eq!(t.remaining, Duration::from_secs(15));
    }

    #[test]
    fn test_throughput_clamps_elapsed_and_stalls() {
        let t = Throughput::compute(1000, 500, Duration::from_millis(10));
        assert_eq!(t.per_second, 500);

        let stalled = Throughput::compute(1000, 0, Duration::from_secs(30));
        assert_eq!(stalled.remaining, UNKNOWN_REMAINING);
        assert_eq!(Throughput::compute(0, 0, Duration::ZERO).percent, 0);
    }

    #[test]
    fn test_format_size_uses_binary_units() {
        assert!(format_size(2048).contains("KiB"));
        assert!(format_size(3 * 1024 * 1024).contains("MiB"));
    }

    #[test]
    fn test_idle_stages_print_nothing() {
        let reporter = ProgressReporter::new(&IngestConfig::default());
        assert!(reporter.lines(&Progress::default()).is_empty());
    }

    #[test]
    fn test_stage_reports_running_then_finished_once() {
        let reporter = ProgressReporter::new(&IngestConfig::default());
        let progress = Progress::default();
        progress.unpacker.flags.set_running(true);
        assert!(reporter.lines(&progress).contains(&"Unpacker running".to_string()));

        progress.unpacker.flags.set_running(false);
        assert!(reporter.lines(&progress).contains(&"Unpacker finished".to_string()));
        assert!(reporter.lines(&progress).is_empty());
    }

    #[test]
    fn test_downloader_counts_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = IngestConfig::default();
        config.directories.dirty_temp = dir.path().to_path_buf();
        config.progress_print.print_detail = false;
        std::fs::create_dir_all(dir.path().join("s3source")).unwrap();
        std::fs::write(dir.path().join("s3source/partial.log"), vec![0u8; 100]).unwrap();

        let mut progress = Progress::default();
        progress.downloader.s3_files.insert(
            "partial.log".into(),
            DownloaderFile {
                size: 400,
                ..Default::default()
            },
        );
        progress.downloader.s3_files.insert(
            "done.log".into(),
            DownloaderFile {
                size: 200,
                is_downloaded: true,
                ..Default::default()
            },
        );
        progress.downloader.flags.set_running(true);

        let lines = ProgressReporter::new(&config).lines(&progress);
        let s3 = lines
            .iter()
            .find(|l| l.starts_with("Downloader progress source:s3"))
            .unwrap();
        assert!(s3.contains("files:2 downloaded_files:1"));
        assert!(s3.contains(&format!("downloaded_size:{}", format_size(300))));
    }

    #[test]
    fn test_log_processor_summary() {
        let config = IngestConfig::default();
        let mut progress = Progress::default();
        progress.log_processor.files.insert(
            "/logs/prod/1_bb9_1".into(),
            LogFile {
                size: 100,
                processed: 100,
                ..Default::default()
            },
        );
        progress.log_processor.start_time = Some(Utc::now());
        progress.log_processor.flags.set_running(true);

        let lines = ProgressReporter::new(&config).lines(&progress);
        assert!(lines.iter().any(|l| l.contains("complete:100%")));
        assert!(lines
            .iter()
            .any(|l| l.starts_with("LogProcessor detail file:/logs/prod/1_bb9_1")));
    }
}
