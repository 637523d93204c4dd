//! End-to-end runs of the ingest pipeline against a local-directory source

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use agi_ingest::config::IngestConfig;
use agi_ingest::download::{RemoteSource, SourceKind};
use agi_ingest::downstream::{parse_log_name, DownstreamProcessor, ManifestProcessor};
use agi_ingest::patterns::Patterns;
use agi_ingest::pipeline::{Ingest, RunSummary};
use agi_ingest::progress::store::ProgressStore;
use agi_ingest::progress::SharedProgress;
use agi_ingest::{IngestError, Result};
use async_trait::async_trait;
use common::{
    config, layout, node_log, node_log_of_len, snapshot, tar_gz_bytes, touch_later, write, LocalDirSource,
};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

async fn run_once(config: &IngestConfig, source: Arc<LocalDirSource>) -> (RunSummary, SharedProgress) {
    let sources: Vec<Arc<dyn RemoteSource>> = vec![source];
    let ingest = Ingest::with_sources(config.clone(), Patterns::default(), sources, Arc::new(ManifestProcessor)).unwrap();
    let progress = ingest.progress().clone();
    let summary = ingest.run().await.unwrap();
    ingest.close().await.unwrap();
    (summary, progress)
}

fn key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[tokio::test]
async fn test_identical_logs_are_collapsed() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote");
    let log = node_log_of_len("bb1", "prod", 500);
    write(&remote.join("a/log1.txt"), &log);
    write(&remote.join("a/log2.txt"), &log);
    let config = config(dir.path());

    let source = Arc::new(LocalDirSource::new(&remote, SourceKind::Sftp));
    let (summary, progress) = run_once(&config, source.clone()).await;

    assert_eq!(source.fetches(), 2);
    assert_eq!(summary.pre_process.duplicates, 1);
    assert_eq!(summary.pre_process.logs, 1);
    assert_eq!(layout(&config.directories.logs), vec!["prod/1_bb1_1".to_string()]);

    let landed = config.directories.dirty_temp.join("sftpsource/a");
    let p = progress.read();
    let dup = &p.pre_processor.files[&key(&landed.join("log2.txt"))];
    assert_eq!(dup.pre_process_duplicate_of, key(&landed.join("log1.txt")));
    assert!(dup.pre_process_out_paths.is_empty());
    assert_eq!(p.log_processor.files.len(), 1);
}

#[tokio::test]
async fn test_nodes_get_stable_prefixes_and_suffixes() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote");
    write(&remote.join("n1/aerospike.log"), node_log("bb1", "prod", "one"));
    write(&remote.join("n1/aerospike.log.1"), node_log("bb1", "prod", "two"));
    write(&remote.join("n1/aerospike.log.2"), node_log("bb1", "prod", "three"));
    write(&remote.join("n2/aerospike.log"), node_log("bb2", "prod", "four"));
    let config = config(dir.path());

    let (summary, _) = run_once(&config, Arc::new(LocalDirSource::new(&remote, SourceKind::Sftp))).await;
    assert_eq!(summary.pre_process.logs, 4);

    let mut by_node: BTreeMap<String, (BTreeSet<u32>, BTreeSet<u32>)> = BTreeMap::new();
    for name in layout(&config.directories.logs.join("prod")) {
        let (prefix, node, suffix) = parse_log_name(&name).unwrap();
        let entry = by_node.entry(node.to_string()).or_default();
        entry.0.insert(prefix);
        entry.1.insert(suffix);
    }
    let (bb1_prefixes, bb1_suffixes) = &by_node["bb1"];
    let (bb2_prefixes, bb2_suffixes) = &by_node["bb2"];
    assert_eq!(bb1_prefixes.len(), 1);
    assert_eq!(bb1_suffixes, &BTreeSet::from([1, 2, 3]));
    assert_eq!(bb2_suffixes, &BTreeSet::from([1]));
    let all: BTreeSet<u32> = bb1_prefixes.union(bb2_prefixes).copied().collect();
    assert_eq!(all, BTreeSet::from([1, 2]));
}

#[tokio::test]
async fn test_nested_archives_resolve_in_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote");
    let log = node_log("bb1", "prod", "nested");
    let inner = tar_gz_bytes(&[("node/aerospike.log", log.as_bytes())]);
    write(&remote.join("bundle.tar.gz"), tar_gz_bytes(&[("inner.tar.gz", inner.as_slice())]));
    let config = config(dir.path());

    let (summary, _) = run_once(&config, Arc::new(LocalDirSource::new(&remote, SourceKind::S3))).await;

    assert_eq!(summary.unpack.extracted, 2);
    assert_eq!(summary.unpack.rounds, 3);
    assert_eq!(summary.unpack.failed, 0);
    let placed = config.directories.logs.join("prod/1_bb1_1");
    assert_eq!(std::fs::read_to_string(placed).unwrap(), log);
}

#[tokio::test]
async fn test_no_archives_means_one_round() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote");
    write(&remote.join("aerospike.log"), node_log("bb1", "prod", "plain"));
    let config = config(dir.path());

    let (summary, _) = run_once(&config, Arc::new(LocalDirSource::new(&remote, SourceKind::Sftp))).await;
    assert_eq!(summary.unpack.rounds, 1);
    assert_eq!(summary.unpack.extracted, 0);
}

#[tokio::test]
async fn test_corrupt_archive_does_not_stop_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote");
    // Valid gzip header followed by a deflate block of the reserved type.
    let broken: [u8; 14] = [0x1F, 0x8B, 0x08, 0x00, 0, 0, 0, 0, 0x00, 0xFF, 0x07, 0x07, 0x07, 0x07];
    write(&remote.join("broken.tar.gz"), &broken);
    write(&remote.join("aerospike.log"), node_log("bb1", "prod", "fine"));
    let config = config(dir.path());

    let (summary, progress) = run_once(&config, Arc::new(LocalDirSource::new(&remote, SourceKind::Sftp))).await;

    assert_eq!(summary.unpack.failed, 1);
    assert_eq!(summary.unpack.rounds, 1);
    assert_eq!(summary.pre_process.logs, 1);
    let landed = config.directories.dirty_temp.join("sftpsource/broken.tar.gz");
    let p = progress.read();
    let entry = &p.unpacker.files[&key(&landed)];
    assert!(entry.unpack_failed);
    assert!(!entry.errors.is_empty());
    assert!(p.unpacker.finished);
}

#[tokio::test]
async fn test_rerun_fetches_nothing_and_keeps_layout() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote");
    write(&remote.join("n1/aerospike.log"), node_log("bb1", "prod", "one"));
    write(&remote.join("n2/aerospike.log"), node_log("bb2", "dev", "two"));
    let config = config(dir.path());

    let first = Arc::new(LocalDirSource::new(&remote, SourceKind::Sftp));
    run_once(&config, first.clone()).await;
    assert_eq!(first.fetches(), 2);
    let before = snapshot(&config.directories.logs);

    let second = Arc::new(LocalDirSource::new(&remote, SourceKind::Sftp));
    let (summary, _) = run_once(&config, second.clone()).await;
    assert_eq!(second.fetches(), 0);
    assert_eq!(summary.pre_process.logs, 0);
    assert_eq!(snapshot(&config.directories.logs), before);
}

#[tokio::test]
async fn test_replaced_remote_file_of_same_size_is_placed() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote");
    let object = remote.join("a.log");
    write(&object, node_log_of_len("bb1", "prod", 300));
    let config = config(dir.path());

    run_once(&config, Arc::new(LocalDirSource::new(&remote, SourceKind::Sftp))).await;
    assert_eq!(layout(&config.directories.logs), vec!["prod/1_bb1_1".to_string()]);

    let replacement = node_log_of_len("cc2", "prod", 300);
    write(&object, &replacement);
    touch_later(&object, 120);

    let source = Arc::new(LocalDirSource::new(&remote, SourceKind::Sftp));
    let (summary, _) = run_once(&config, source.clone()).await;

    assert_eq!(source.fetches(), 1);
    assert_eq!(summary.pre_process.resumed, 0);
    assert_eq!(summary.pre_process.logs, 1);
    assert_eq!(
        layout(&config.directories.logs),
        vec!["prod/1_bb1_1".to_string(), "prod/2_cc2_1".to_string()]
    );
    let placed = config.directories.logs.join("prod/2_cc2_1");
    assert_eq!(std::fs::read_to_string(placed).unwrap(), replacement);
    assert!(layout(&config.directories.other_files).is_empty());
}

#[tokio::test]
async fn test_read_only_input_survives_repeated_runs() {
    let dir = tempfile::tempdir().unwrap();
    let empty_remote = dir.path().join("remote");
    std::fs::create_dir_all(&empty_remote).unwrap();
    let mut config = config(dir.path());
    config.directories.read_only_input = true;

    let input = config.directories.dirty_temp.clone();
    let dup = node_log("bb1", "prod", "twice");
    write(&input.join("a/one.log"), &dup);
    write(&input.join("a/two.log"), &dup);
    write(&input.join("b/other.log"), node_log("bb2", "prod", "once"));
    let packed = node_log("bb3", "prod", "packed");
    write(
        &input.join("c/bundle.tar.gz"),
        tar_gz_bytes(&[("aerospike.log", packed.as_bytes())]),
    );
    write(&input.join("c/blob.bin"), [0u8, 1, 2, 0xFF]);
    let original = snapshot(&input);

    let (first, _) = run_once(&config, Arc::new(LocalDirSource::new(&empty_remote, SourceKind::Sftp))).await;
    assert_eq!(first.unpack.extracted, 1);
    assert_eq!(first.pre_process.duplicates, 1);
    assert_eq!(first.pre_process.logs, 3);
    assert_eq!(snapshot(&input), original);
    let placed = layout(&config.directories.logs);
    assert_eq!(placed.len(), 3);

    let (second, _) = run_once(&config, Arc::new(LocalDirSource::new(&empty_remote, SourceKind::Sftp))).await;
    assert_eq!(second.unpack.extracted, 0);
    assert_eq!(second.unpack.rounds, 1);
    assert_eq!(second.pre_process.logs, 0);
    assert_eq!(snapshot(&input), original);
    assert_eq!(layout(&config.directories.logs), placed);
}

#[tokio::test]
async fn test_progress_is_persisted_on_close() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote");
    write(&remote.join("n1/aerospike.log"), node_log("bb1", "prod", "one"));
    write(&remote.join("n2/aerospike.log"), node_log("bb2", "prod", "two"));
    write(&remote.join("collect_info_20240101_x.tgz"), b"bundle");
    let config = config(dir.path());

    let (_, progress) = run_once(&config, Arc::new(LocalDirSource::new(&remote, SourceKind::Sftp))).await;

    let store = ProgressStore::new(&config.progress_file);
    assert!(store.path_for("pre-processor.json").exists());
    let saved = store.load().unwrap();
    let live = progress.read();
    assert_eq!(saved.pre_processor.node_to_prefix, live.pre_processor.node_to_prefix);
    assert_eq!(saved.pre_processor.last_used_prefix, 2);
    assert_eq!(
        saved.pre_processor.last_used_suffix_for_prefix,
        live.pre_processor.last_used_suffix_for_prefix
    );
    assert_eq!(saved.pre_processor.collect_info_unique_prefixes, 1);
    assert_eq!(saved.downloader.sftp_files, live.downloader.sftp_files);
    assert!(saved.downloader.sftp_files.values().all(|f| f.is_downloaded));
    assert_eq!(
        saved.log_processor.files.keys().collect::<Vec<_>>(),
        live.log_processor.files.keys().collect::<Vec<_>>()
    );
    assert!(saved.unpacker.finished && saved.pre_processor.finished);
}

struct FailingDownstream;

#[async_trait]
impl DownstreamProcessor for FailingDownstream {
    async fn process_logs(&self, _: &Path, _: &SharedProgress) -> Result<()> {
        Err(IngestError::Aggregate("indexer unavailable".to_string()))
    }

    async fn process_collectinfo(&self, _: &Path, _: &SharedProgress) -> Result<()> {
        Err(IngestError::Config("no collectinfo handler".to_string()))
    }
}

#[tokio::test]
async fn test_downstream_failures_are_joined() {
    let dir = tempfile::tempdir().unwrap();
    let remote = dir.path().join("remote");
    std::fs::create_dir_all(&remote).unwrap();
    let config = config(dir.path());

    let sources: Vec<Arc<dyn RemoteSource>> = vec![Arc::new(LocalDirSource::new(&remote, SourceKind::Sftp))];
    let ingest = Ingest::with_sources(config, Patterns::default(), sources, Arc::new(FailingDownstream)).unwrap();
    let err = ingest.run().await.unwrap_err().to_string();
    ingest.close().await.unwrap();

    assert_eq!(
        err,
        "ProcessLogs: indexer unavailable; ProcessCollectInfo: Configuration error: no collectinfo handler"
    );
}
