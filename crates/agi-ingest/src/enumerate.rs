//! Working tree enumeration
//!
//! Walks one or more roots and classifies every regular file into an
//! [`EnumFile`]. Unpack and preprocess both start from a fresh enumeration.

use bzip2::read::BzDecoder;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use tracing::{trace, warn};
use walkdir::WalkDir;

use crate::detect::{self, ArchiveKind, Sniffed};
use crate::error::{IngestError, Result};
use crate::progress::EnumFile;

/// Bundles named like collectinfo and below this size skip content inspection
pub const EARLY_COLLECTINFO_MAX_SIZE: u64 = 10 * 1024 * 1024;

const COLLECTINFO_NAME_MARKER: &str = "collect_info_";
const COLLECTINFO_ENTRY_PREFIX: &str = "tmp/collect_info_";

/// Enumerate every regular file below `roots`, keyed by path
///
/// Roots that do not exist are skipped; any other walk failure aborts.
pub fn enumerate(roots: &[&Path], collectinfo_max_size: u64) -> Result<BTreeMap<String, EnumFile>> {
    let mut files = BTreeMap::new();
    for root in roots {
        if !root.exists() {
            trace!(root = %root.display(), "Enumeration root missing, skipping");
            continue;
        }
        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| IngestError::Enumerate {
                path: root.to_path_buf(),
                message: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = entry.metadata().map_err(|e| IngestError::Enumerate {
                path: entry.path().to_path_buf(),
                message: e.to_string(),
            })?;
            match classify(entry.path(), meta.len(), collectinfo_max_size) {
                Ok(mut file) => {
                    file.modified = meta.modified().ok().map(DateTime::<Utc>::from);
                    trace!(
                        path = %entry.path().display(),
                        archive = file.is_archive,
                        text = file.is_text,
                        collectinfo = file.is_collect_info,
                        content_type = %file.content_type,
                        "Enumerated file"
                    );
                    files.insert(entry.path().to_string_lossy().into_owned(), file);
                },
                Err(e) => warn!(path = %entry.path().display(), error = %e, "Could not read file, skipping"),
            }
        }
    }
    Ok(files)
}

/// Classify one file of known size
pub fn classify(path: &Path, size: u64, collectinfo_max_size: u64) -> io::Result<EnumFile> {
    let mut file = EnumFile {
        size,
        ..Default::default()
    };
    if size == 0 {
        return Ok(file);
    }

    let name = path.to_string_lossy();
    if name.contains(COLLECTINFO_NAME_MARKER)
        && name.ends_with(".tgz")
        && size < EARLY_COLLECTINFO_MAX_SIZE
    {
        file.is_collect_info = true;
        return Ok(file);
    }

    let detection = detect::detect_file(path)?;
    file.start_at = detection.start_at;
    file.content_type = detection.sniffed.content_type().to_string();

    match detection.sniffed {
        Sniffed::Archive(kind) => {
            if kind == ArchiveKind::Gzip && size < collectinfo_max_size {
                match is_collectinfo_bundle(path) {
                    Ok(true) => {
                        file.is_collect_info = true;
                        return Ok(file);
                    },
                    Ok(false) => {},
                    Err(e) => warn!(
                        path = %path.display(),
                        error = %e,
                        "Collectinfo inspection failed, treating as a regular archive"
                    ),
                }
            }
            file.is_archive = true;
            file.archive = Some(kind);
            match kind {
                ArchiveKind::Gzip => file.is_tar_gz = head_is_tar(GzDecoder::new(open(path)?)),
                ArchiveKind::Bzip2 => file.is_tar_bz = head_is_tar(BzDecoder::new(open(path)?)),
                _ => {},
            }
        },
        Sniffed::Text(_) => file.is_text = true,
        Sniffed::Binary => {},
    }
    Ok(file)
}

fn open(path: &Path) -> io::Result<BufReader<File>> {
    File::open(path).map(BufReader::new)
}

fn head_is_tar<R: io::Read>(mut reader: R) -> bool {
    let mut head = [0u8; 512];
    match detect::read_full(&mut reader, &mut head) {
        Ok(read) => detect::is_tar_header(&head[..read]),
        Err(_) => false,
    }
}

/// A gzipped tar whose only visible files live under `tmp/collect_info_`
pub fn is_collectinfo_bundle(path: &Path) -> io::Result<bool> {
    let mut archive = tar::Archive::new(GzDecoder::new(open(path)?));
    let mut found = false;
    for entry in archive.entries()? {
        let entry = entry?;
        if entry.header().entry_type().is_dir() {
            continue;
        }
        let entry_path = entry.path()?;
        let hidden = entry_path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(false);
        if hidden {
            continue;
        }
        if entry_path.to_string_lossy().starts_with(COLLECTINFO_ENTRY_PREFIX) {
            found = true;
        } else {
            return Ok(false);
        }
    }
    Ok(found)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::fs;
    use std::path::PathBuf;

    /// Write a gzipped tar holding `entries` (name, content) at `path`
    pub(crate) fn write_tar_gz(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn key(path: PathBuf) -> String {
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn test_classifies_mixed_tree() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("node1")).unwrap();
        fs::write(root.join("node1/aerospike.log"), b"Jan 01 2024 00:00:00 GMT: INFO (as): up\n").unwrap();
        fs::write(root.join("empty.log"), b"").unwrap();
        fs::write(root.join("blob.bin"), [0u8, 1, 2, 3, 0xFF, 0xFE]).unwrap();
        write_tar_gz(&root.join("bundle.tar.gz"), &[("var/log/aerospike.log", b"hello\n")]);

        let files = enumerate(&[root], 20_971_520).unwrap();
        assert_eq!(files.len(), 4);

        let log = &files[&key(root.join("node1/aerospike.log"))];
        assert!(log.is_text && !log.is_archive);
        assert!(log.modified.is_some());

        let empty = &files[&key(root.join("empty.log"))];
        assert_eq!(empty.size, 0);
        assert!(!empty.is_text && !empty.is_archive);

        let blob = &files[&key(root.join("blob.bin"))];
        assert!(!blob.is_text && !blob.is_archive);

        let bundle = &files[&key(root.join("bundle.tar.gz"))];
        assert!(bundle.is_archive && bundle.is_tar_gz);
        assert_eq!(bundle.archive, Some(ArchiveKind::Gzip));
    }

    #[test]
    fn test_collectinfo_detected_by_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("diag.tar.gz");
        write_tar_gz(
            &path,
            &[
                ("tmp/collect_info_20240101/ascinfo.json", b"{}"),
                ("tmp/collect_info_20240101/.hidden", b"x"),
            ],
        );
        let file = classify(&path, fs::metadata(&path).unwrap().len(), 20_971_520).unwrap();
        assert!(file.is_collect_info);
        assert!(!file.is_archive);
    }

    #[test]
    fn test_mixed_bundle_is_not_collectinfo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.tgz");
        write_tar_gz(
            &path,
            &[
                ("tmp/collect_info_20240101/ascinfo.json", b"{}"),
                ("var/log/aerospike.log", b"line\n"),
            ],
        );
        assert!(!is_collectinfo_bundle(&path).unwrap());
    }

    #[test]
    fn test_collectinfo_detected_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x_collect_info_20240101_node1.tgz");
        fs::write(&path, b"not even gzip").unwrap();
        let file = classify(&path, 13, 20_971_520).unwrap();
        assert!(file.is_collect_info);
    }

    #[test]
    fn test_missing_root_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let files = enumerate(&[&dir.path().join("staging")], 1024).unwrap();
        assert!(files.is_empty());
    }
}
