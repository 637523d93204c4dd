//! Content deduplication
//!
//! Text files are grouped by exact size; within a size group each file is
//! fingerprinted with SHA-256 over its first `read_bytes` bytes, starting at
//! its text offset. The lexicographically first path of every fingerprint
//! group is canonical.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tracing::trace;

use crate::progress::EnumFile;

pub type Fingerprint = [u8; 32];

/// SHA-256 of up to `read_bytes` bytes from `start_at`; `None` if unreadable
pub fn fingerprint(path: &Path, start_at: u64, read_bytes: u64) -> Option<Fingerprint> {
    let mut file = File::open(path).ok()?;
    file.seek(SeekFrom::Start(start_at)).ok()?;

    let mut hasher = Sha256::new();
    let mut limited = file.take(read_bytes);
    std::io::copy(&mut limited, &mut hasher).ok()?;
    let digest: Fingerprint = hasher.finalize().into();
    trace!(path = %path.display(), sha256 = %hex::encode(digest), "Fingerprinted");
    Some(digest)
}

/// Map every duplicate path to its canonical path
pub fn find_duplicates(
    files: &BTreeMap<String, EnumFile>,
    read_bytes: u64,
) -> BTreeMap<String, String> {
    let mut by_size: BTreeMap<u64, Vec<&String>> = BTreeMap::new();
    for (path, file) in files {
        if file.is_text {
            by_size.entry(file.size).or_default().push(path);
        }
    }

    let mut duplicates = BTreeMap::new();
    for group in by_size.values().filter(|g| g.len() > 1) {
        let mut by_hash: BTreeMap<Fingerprint, Vec<&String>> = BTreeMap::new();
        for path in group {
            let start_at = files.get(*path).map(|f| f.start_at).unwrap_or(0);
            if let Some(hash) = fingerprint(Path::new(path.as_str()), start_at, read_bytes) {
                by_hash.entry(hash).or_default().push(path);
            }
        }
        for same in by_hash.values() {
            if let Some((canonical, rest)) = same.split_first() {
                for dup in rest {
                    duplicates.insert((*dup).clone(), (*canonical).clone());
                }
            }
        }
    }
    duplicates
}
