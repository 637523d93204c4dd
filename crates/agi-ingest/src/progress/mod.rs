//! Pipeline progress state
//!
//! One record type per stage, all held in a single [`Progress`] behind one
//! reader/writer lock ([`SharedProgress`]). Stage workers take the write lock
//! only while touching their own entry; the save and print loops take the read
//! lock for a full scan.
//!
//! Field names serialize in PascalCase so the five documents keep the layout
//! downstream tooling already reads.

pub mod report;
pub mod store;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::detect::ArchiveKind;

/// Transient per-stage flags; never persisted
#[derive(Debug, Default)]
pub struct StageFlags {
    running: AtomicBool,
    was_running: AtomicBool,
    changed: AtomicBool,
}

impl StageFlags {
    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::SeqCst);
    }

    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::SeqCst)
    }

    pub(crate) fn clear_changed(&self) {
        self.changed.store(false, Ordering::SeqCst);
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Record the current running state and report how it moved since the last call
    pub fn transition(&self) -> Transition {
        let now = self.running.load(Ordering::SeqCst);
        let before = self.was_running.swap(now, Ordering::SeqCst);
        match (before, now) {
            (false, true) => Transition::Started,
            (true, false) => Transition::Stopped,
            (true, true) => Transition::Running,
            (false, false) => Transition::Idle,
        }
    }
}

impl Clone for StageFlags {
    fn clone(&self) -> Self {
        Self {
            running: AtomicBool::new(self.running.load(Ordering::SeqCst)),
            was_running: AtomicBool::new(self.was_running.load(Ordering::SeqCst)),
            changed: AtomicBool::new(self.changed.load(Ordering::SeqCst)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Started,
    Running,
    Stopped,
    Idle,
}

/// A persisted stage document
pub trait Stage: Serialize + DeserializeOwned + Default {
    /// File name of the document, before any compression suffix
    const DOCUMENT: &'static str;
    const LABEL: &'static str;

    fn flags(&self) -> &StageFlags;
    fn finished(&self) -> bool;
}

// ============================================================================
// Downloader
// ============================================================================

/// Ledger entry for one remote object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DownloaderFile {
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub is_downloaded: bool,
    pub start_time: String,
    pub finish_time: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct DownloaderProgress {
    pub s3_files: BTreeMap<String, DownloaderFile>,
    pub sftp_files: BTreeMap<String, DownloaderFile>,
    pub finished: bool,
    #[serde(skip)]
    pub flags: StageFlags,
}

impl Stage for DownloaderProgress {
    const DOCUMENT: &'static str = "downloader.json";
    const LABEL: &'static str = "Downloader";

    fn flags(&self) -> &StageFlags {
        &self.flags
    }

    fn finished(&self) -> bool {
        self.finished
    }
}

// ============================================================================
// Unpacker / PreProcessor
// ============================================================================

/// A file discovered in the working tree
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EnumFile {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub content_type: String,
    pub is_collect_info: bool,
    pub is_archive: bool,
    pub is_text: bool,
    pub is_tar_gz: bool,
    pub is_tar_bz: bool,
    pub unpack_failed: bool,
    pub errors: Vec<String>,
    pub pre_process_duplicate_of: String,
    /// Offset of the first byte after leading zero-filled blocks
    pub start_at: u64,
    pub pre_process_out_paths: Vec<String>,
    #[serde(skip)]
    pub archive: Option<ArchiveKind>,
}

impl EnumFile {
    /// Size and mtime, enough to tell a replaced file from the one recorded
    pub fn stamp(&self) -> (u64, Option<DateTime<Utc>>) {
        (self.size, self.modified)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct UnpackerProgress {
    pub files: BTreeMap<String, EnumFile>,
    pub finished: bool,
    #[serde(skip)]
    pub flags: StageFlags,
}

impl Stage for UnpackerProgress {
    const DOCUMENT: &'static str = "unpacker.json";
    const LABEL: &'static str = "Unpacker";

    fn flags(&self) -> &StageFlags {
        &self.flags
    }

    fn finished(&self) -> bool {
        self.finished
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PreProcessorProgress {
    pub files: BTreeMap<String, EnumFile>,
    pub collect_info_unique_prefixes: u64,
    pub finished: bool,
    pub last_used_prefix: u32,
    pub last_used_suffix_for_prefix: BTreeMap<u32, u32>,
    pub node_to_prefix: BTreeMap<String, u32>,
    #[serde(skip)]
    pub flags: StageFlags,
}

/// Placement assigned to one log file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSlot {
    pub prefix: u32,
    pub suffix: u32,
}

impl PreProcessorProgress {
    /// Hand out the next slot for a (cluster, node) pair
    ///
    /// A new pair gets the next unused prefix and suffix 1; a known pair keeps
    /// its prefix and bumps its suffix.
    pub fn allocate_identity(&mut self, cluster: &str, node: &str) -> NodeSlot {
        let key = format!("{}_{}", cluster, node);
        let slot = match self.node_to_prefix.get(&key) {
            Some(&prefix) => {
                let suffix = self.last_used_suffix_for_prefix.entry(prefix).or_insert(0);
                *suffix += 1;
                NodeSlot {
                    prefix,
                    suffix: *suffix,
                }
            },
            None => {
                self.last_used_prefix += 1;
                let prefix = self.last_used_prefix;
                self.node_to_prefix.insert(key, prefix);
                self.last_used_suffix_for_prefix.insert(prefix, 1);
                NodeSlot { prefix, suffix: 1 }
            },
        };
        self.flags.mark_changed();
        slot
    }

    /// Next run-unique collectinfo counter
    pub fn next_collectinfo_prefix(&mut self) -> u64 {
        self.collect_info_unique_prefixes += 1;
        self.flags.mark_changed();
        self.collect_info_unique_prefixes
    }
}

impl Stage for PreProcessorProgress {
    const DOCUMENT: &'static str = "pre-processor.json";
    const LABEL: &'static str = "PreProcessor";

    fn flags(&self) -> &StageFlags {
        &self.flags
    }

    fn finished(&self) -> bool {
        self.finished
    }
}

// ============================================================================
// Downstream processors
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LogFile {
    pub cluster_name: String,
    pub node_prefix: u32,
    #[serde(rename = "NodeID")]
    pub node_id: String,
    pub node_suffix: u32,
    pub size: u64,
    pub processed: u64,
    pub finished: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LogProcessorProgress {
    pub files: BTreeMap<String, LogFile>,
    pub finished: bool,
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub flags: StageFlags,
}

impl Stage for LogProcessorProgress {
    const DOCUMENT: &'static str = "log-processor.json";
    const LABEL: &'static str = "LogProcessor";

    fn flags(&self) -> &StageFlags {
        &self.flags
    }

    fn finished(&self) -> bool {
        self.finished
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CfFile {
    pub size: u64,
    #[serde(rename = "NodeID")]
    pub node_id: String,
    pub original_name: String,
    pub processing_attempted: bool,
    pub processed: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CollectinfoProgress {
    pub files: BTreeMap<String, CfFile>,
    pub finished: bool,
    #[serde(skip)]
    pub flags: StageFlags,
}

impl Stage for CollectinfoProgress {
    const DOCUMENT: &'static str = "cf-processor.json";
    const LABEL: &'static str = "CollectinfoProcessor";

    fn flags(&self) -> &StageFlags {
        &self.flags
    }

    fn finished(&self) -> bool {
        self.finished
    }
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug, Default)]
pub struct Progress {
    pub downloader: DownloaderProgress,
    pub unpacker: UnpackerProgress,
    pub pre_processor: PreProcessorProgress,
    pub log_processor: LogProcessorProgress,
    pub collectinfo_processor: CollectinfoProgress,
}

/// The lock every stage shares
#[derive(Debug, Clone, Default)]
pub struct SharedProgress(Arc<RwLock<Progress>>);

impl SharedProgress {
    pub fn new(progress: Progress) -> Self {
        Self(Arc::new(RwLock::new(progress)))
    }

    // A panicked worker leaves its entry half-updated at worst; the rest of
    // the state is still usable, so poisoning is ignored.
    pub fn read(&self) -> RwLockReadGuard<'_, Progress> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Progress> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_same_pair_shares_prefix_with_increasing_suffix() {
        let mut pre = PreProcessorProgress::default();
        let slots: Vec<_> = (0..4)
            .map(|_| pre.allocate_identity("prod", "bb9a1b2c"))
            .collect();

        assert!(slots.iter().all(|s| s.prefix == 1));
        assert_eq!(
            slots.iter().map(|s| s.suffix).collect::<Vec<_>>(),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn test_distinct_pairs_never_share_prefix() {
        let mut pre = PreProcessorProgress::default();
        let a = pre.allocate_identity("prod", "node-a");
        let b = pre.allocate_identity("prod", "node-b");
        let c = pre.allocate_identity("staging", "node-a");
        let a2 = pre.allocate_identity("prod", "node-a");

        assert_eq!((a.prefix, b.prefix, c.prefix), (1, 2, 3));
        assert_eq!(a2, NodeSlot { prefix: 1, suffix: 2 });
        assert_eq!(pre.last_used_prefix, 3);
        assert!(pre.flags.is_changed());
    }

    #[test]
    fn test_allocation_continues_after_reload() {
        let mut pre = PreProcessorProgress::default();
        pre.allocate_identity("prod", "node-a");
        pre.allocate_identity("prod", "node-a");

        let json = serde_json::to_string(&pre).unwrap();
        let mut reloaded: PreProcessorProgress = serde_json::from_str(&json).unwrap();
        assert!(!reloaded.flags.is_changed());

        assert_eq!(
            reloaded.allocate_identity("prod", "node-a"),
            NodeSlot { prefix: 1, suffix: 3 }
        );
        assert_eq!(reloaded.allocate_identity("prod", "node-b").prefix, 2);
    }

    #[test]
    fn test_running_transitions() {
        let flags = StageFlags::default();
        assert_eq!(flags.transition(), Transition::Idle);
        flags.set_running(true);
        assert_eq!(flags.transition(), Transition::Started);
        assert_eq!(flags.transition(), Transition::Running);
        flags.set_running(false);
        assert_eq!(flags.transition(), Transition::Stopped);
        assert_eq!(flags.transition(), Transition::Idle);
    }

    #[test]
    fn test_document_field_names() {
        let file = LogFile {
            cluster_name: "prod".into(),
            node_id: "bb9".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&file).unwrap();
        assert_eq!(value["ClusterName"], "prod");
        assert_eq!(value["NodeID"], "bb9");

        let value = serde_json::to_value(EnumFile::default()).unwrap();
        assert!(value.get("PreProcessDuplicateOf").is_some());
        assert!(value.get("IsCollectInfo").is_some());
        assert!(value.get("Archive").is_none());
    }
}
