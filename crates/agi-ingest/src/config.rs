//! Ingest configuration
//!
//! The resolved configuration consumed by every pipeline stage. Loaded from a
//! YAML file with `LOGINGEST_*` overrides through
//! [`agi_common::settings::load_layered`].

use crate::error::{IngestError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_COLLECTINFO_DIR: &str = "ingest/files/collectinfo";
pub const DEFAULT_LOGS_DIR: &str = "ingest/files/logs";
pub const DEFAULT_DIRTY_DIR: &str = "ingest/files/input";
pub const DEFAULT_OTHER_FILES_DIR: &str = "ingest/files/other";
pub const DEFAULT_PROGRESS_DIR: &str = "ingest/progress/";

/// Name of the staging directory created next to the dirty tree
pub const DEFAULT_STAGING_DIR_NAME: &str = "staging";

pub const DEFAULT_SOURCE_THREADS: usize = 4;
pub const DEFAULT_SFTP_PORT: u16 = 22;
pub const DEFAULT_NETWORK_TIMEOUT_SECS: u64 = 60;

pub const DEFAULT_DEDUP_READ_BYTES: u64 = 1_048_576;
pub const DEFAULT_PREPROCESS_FILE_THREADS: usize = 6;
pub const DEFAULT_UNPACK_FILE_THREADS: usize = 4;

pub const DEFAULT_PROGRESS_WRITE_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_PROGRESS_PRINT_INTERVAL_SECS: u64 = 10;

/// Collectinfo bundles larger than this are never inspected for the marker
pub const DEFAULT_COLLECTINFO_MAX_SIZE: u64 = 20_971_520;

pub const DEFAULT_NODE_ID_REGEX: &str =
    r"NODE-ID (?P<NodeId>[^ ]+) CLUSTER-SIZE (?P<ClusterSize>\d+)( CLUSTER-NAME (?P<ClusterName>[^$]+))*";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub directories: DirectoriesConfig,
    pub downloader: DownloaderConfig,
    pub dedup: DedupConfig,
    pub pre_processor: PreProcessorConfig,
    pub progress_file: ProgressFileConfig,
    pub progress_print: ProgressPrintConfig,
    pub collect_info_max_size: u64,
    pub find_cluster_name_node_id_regex: String,
    /// YAML file holding the generic log patterns
    pub patterns_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoriesConfig {
    pub collect_info: PathBuf,
    pub logs: PathBuf,
    pub dirty_temp: PathBuf,
    pub other_files: PathBuf,
    /// Scratch mirror used in read-only mode; a sibling of `dirty_temp` when unset
    pub staging: Option<PathBuf>,
    pub read_only_input: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloaderConfig {
    pub concurrent_sources: bool,
    pub s3_source: S3SourceConfig,
    pub sftp_source: SftpSourceConfig,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3SourceConfig {
    pub enabled: bool,
    pub threads: usize,
    pub region: String,
    pub bucket_name: String,
    /// Static credentials; the default provider chain is used when empty
    pub key_id: String,
    pub secret_key: String,
    pub path_prefix: String,
    pub search_regex: String,
    pub endpoint: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SftpSourceConfig {
    pub enabled: bool,
    pub threads: usize,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub key_file: Option<PathBuf>,
    pub path_prefix: String,
    pub search_regex: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    pub read_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreProcessorConfig {
    pub file_threads: usize,
    pub unpacker_file_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressFileConfig {
    pub output_file_path: PathBuf,
    pub write_interval_secs: u64,
    pub compress: bool,
    pub disable_write: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressPrintConfig {
    pub enable: bool,
    pub update_interval_secs: u64,
    pub print_overall: bool,
    pub print_detail: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            directories: DirectoriesConfig::default(),
            downloader: DownloaderConfig::default(),
            dedup: DedupConfig::default(),
            pre_processor: PreProcessorConfig::default(),
            progress_file: ProgressFileConfig::default(),
            progress_print: ProgressPrintConfig::default(),
            collect_info_max_size: DEFAULT_COLLECTINFO_MAX_SIZE,
            find_cluster_name_node_id_regex: DEFAULT_NODE_ID_REGEX.to_string(),
            patterns_file: None,
        }
    }
}

impl Default for DirectoriesConfig {
    fn default() -> Self {
        Self {
            collect_info: PathBuf::from(DEFAULT_COLLECTINFO_DIR),
            logs: PathBuf::from(DEFAULT_LOGS_DIR),
            dirty_temp: PathBuf::from(DEFAULT_DIRTY_DIR),
            other_files: PathBuf::from(DEFAULT_OTHER_FILES_DIR),
            staging: None,
            read_only_input: false,
        }
    }
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            concurrent_sources: true,
            s3_source: S3SourceConfig::default(),
            sftp_source: SftpSourceConfig::default(),
        }
    }
}

impl Default for S3SourceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threads: DEFAULT_SOURCE_THREADS,
            region: String::new(),
            bucket_name: String::new(),
            key_id: String::new(),
            secret_key: String::new(),
            path_prefix: String::new(),
            search_regex: String::new(),
            endpoint: None,
            timeout_secs: DEFAULT_NETWORK_TIMEOUT_SECS,
        }
    }
}

impl Default for SftpSourceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threads: DEFAULT_SOURCE_THREADS,
            host: String::new(),
            port: DEFAULT_SFTP_PORT,
            username: String::new(),
            password: String::new(),
            key_file: None,
            path_prefix: String::new(),
            search_regex: String::new(),
            timeout_secs: DEFAULT_NETWORK_TIMEOUT_SECS,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_bytes: DEFAULT_DEDUP_READ_BYTES,
        }
    }
}

impl Default for PreProcessorConfig {
    fn default() -> Self {
        Self {
            file_threads: DEFAULT_PREPROCESS_FILE_THREADS,
            unpacker_file_threads: DEFAULT_UNPACK_FILE_THREADS,
        }
    }
}

impl Default for ProgressFileConfig {
    fn default() -> Self {
        Self {
            output_file_path: PathBuf::from(DEFAULT_PROGRESS_DIR),
            write_interval_secs: DEFAULT_PROGRESS_WRITE_INTERVAL_SECS,
            compress: true,
            disable_write: false,
        }
    }
}

impl Default for ProgressPrintConfig {
    fn default() -> Self {
        Self {
            enable: true,
            update_interval_secs: DEFAULT_PROGRESS_PRINT_INTERVAL_SECS,
            print_overall: true,
            print_detail: true,
        }
    }
}

// Credentials stay out of Debug output.
impl std::fmt::Debug for S3SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3SourceConfig")
            .field("enabled", &self.enabled)
            .field("threads", &self.threads)
            .field("region", &self.region)
            .field("bucket_name", &self.bucket_name)
            .field("key_id", &self.key_id)
            .field("secret_key", &"***")
            .field("path_prefix", &self.path_prefix)
            .field("search_regex", &self.search_regex)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl std::fmt::Debug for SftpSourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpSourceConfig")
            .field("enabled", &self.enabled)
            .field("threads", &self.threads)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("key_file", &self.key_file)
            .field("path_prefix", &self.path_prefix)
            .field("search_regex", &self.search_regex)
            .finish()
    }
}

impl IngestConfig {
    /// Load from an optional settings file plus environment overrides, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Self = agi_common::settings::load_layered(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pre_processor.file_threads == 0 {
            return Err(IngestError::Config(
                "pre_processor.file_threads must be greater than 0".into(),
            ));
        }
        if self.pre_processor.unpacker_file_threads == 0 {
            return Err(IngestError::Config(
                "pre_processor.unpacker_file_threads must be greater than 0".into(),
            ));
        }
        if self.dedup.enabled && self.dedup.read_bytes == 0 {
            return Err(IngestError::Config(
                "dedup.read_bytes must be greater than 0 when dedup is enabled".into(),
            ));
        }

        self.node_id_regex()?;

        let s3 = &self.downloader.s3_source;
        if s3.enabled {
            if s3.bucket_name.is_empty() {
                return Err(IngestError::Config("s3_source.bucket_name is required".into()));
            }
            if s3.threads == 0 {
                return Err(IngestError::Config(
                    "s3_source.threads must be greater than 0".into(),
                ));
            }
            compile_optional(&s3.search_regex, "s3_source.search_regex")?;
        }

        let sftp = &self.downloader.sftp_source;
        if sftp.enabled {
            if sftp.host.is_empty() || sftp.username.is_empty() {
                return Err(IngestError::Config(
                    "sftp_source.host and sftp_source.username are required".into(),
                ));
            }
            if sftp.password.is_empty() && sftp.key_file.is_none() {
                return Err(IngestError::Config(
                    "sftp_source needs either a password or a key_file".into(),
                ));
            }
            if sftp.threads == 0 {
                return Err(IngestError::Config(
                    "sftp_source.threads must be greater than 0".into(),
                ));
            }
            compile_optional(&sftp.search_regex, "sftp_source.search_regex")?;
        }

        Ok(())
    }

    pub fn node_id_regex(&self) -> Result<Regex> {
        Regex::new(&self.find_cluster_name_node_id_regex).map_err(|e| {
            IngestError::Config(format!("find_cluster_name_node_id_regex: {}", e))
        })
    }
}

impl DirectoriesConfig {
    pub fn staging_dir(&self) -> PathBuf {
        match &self.staging {
            Some(dir) => dir.clone(),
            None => self
                .dirty_temp
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(DEFAULT_STAGING_DIR_NAME),
        }
    }
}

impl ProgressFileConfig {
    pub fn write_interval(&self) -> Duration {
        Duration::from_secs(self.write_interval_secs.max(1))
    }
}

impl ProgressPrintConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs.max(1))
    }
}

/// Compile a user supplied pattern; an empty string means "match everything"
pub fn compile_optional(pattern: &str, field: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern)
        .map(Some)
        .map_err(|e| IngestError::Config(format!("{}: {}", field, e)))
}
