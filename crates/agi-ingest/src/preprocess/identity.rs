//! Cluster and node identity of a log file
//!
//! A file is scanned line by line. Generic patterns are checked first: once
//! every substring of a pattern has been seen the file belongs to that
//! pattern's cluster and gets a node id derived from its path. Otherwise the
//! first `NODE-ID` line matching the node regex decides.

use regex::Regex;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use uuid::Uuid;

use crate::error::{IngestError, Result};
use crate::patterns::{GenericLogPattern, Patterns};

pub const UNSET_CLUSTER: &str = "unset";
pub const UNDEFINED_NODE: &str = "undefined";

const NODE_ID_MARKER: &str = "NODE-ID";
const NODE_ID_GROUP: &str = "NodeId";
const CLUSTER_NAME_GROUP: &str = "ClusterName";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub cluster: String,
    pub node: String,
}

/// Which substrings of one pattern a file has shown so far
struct PatternTracker<'a> {
    pattern: &'a GenericLogPattern,
    seen: Vec<bool>,
    remaining: usize,
}

impl<'a> PatternTracker<'a> {
    fn new(pattern: &'a GenericLogPattern) -> Self {
        Self {
            pattern,
            seen: vec![false; pattern.contains_strings.len()],
            remaining: pattern.contains_strings.len(),
        }
    }

    /// Returns true once every substring has been seen
    fn observe(&mut self, line: &str) -> bool {
        for (seen, needle) in self.seen.iter_mut().zip(&self.pattern.contains_strings) {
            if !*seen && line.contains(needle.as_str()) {
                *seen = true;
                self.remaining -= 1;
            }
        }
        self.remaining == 0
    }
}

#[derive(Debug, Clone)]
pub struct IdentityResolver {
    patterns: Vec<GenericLogPattern>,
    node_regex: Regex,
    /// Any match of `node_regex` settles the node, even one where the group stayed empty
    has_node_group: bool,
}

impl IdentityResolver {
    pub fn new(patterns: &Patterns, node_regex: Regex) -> Self {
        let has_node_group = node_regex
            .capture_names()
            .flatten()
            .any(|name| name == NODE_ID_GROUP);
        Self {
            patterns: patterns.usable().cloned().collect(),
            node_regex,
            has_node_group,
        }
    }

    pub fn resolve(&self, path: &Path) -> Result<Identity> {
        let file = File::open(path).map_err(|e| IngestError::io(path, e))?;
        self.resolve_reader(BufReader::new(file), &path.to_string_lossy())
            .map_err(|e| match e {
                IngestError::Io { error, .. } => IngestError::io(path, error),
                other => other,
            })
    }

    /// Resolve from a line reader; `key` seeds the node id of pattern matches
    pub fn resolve_reader<R: BufRead>(&self, mut reader: R, key: &str) -> Result<Identity> {
        let mut trackers: Vec<PatternTracker> = self.patterns.iter().map(PatternTracker::new).collect();
        let mut cluster = UNSET_CLUSTER.to_string();
        let mut raw = Vec::new();

        loop {
            raw.clear();
            let read = reader
                .read_until(b'\n', &mut raw)
                .map_err(|e| IngestError::io(key, e))?;
            if read == 0 {
                return Err(IngestError::IdentityNotFound);
            }
            let line = String::from_utf8_lossy(&raw);

            for tracker in trackers.iter_mut() {
                if tracker.observe(&line) {
                    let name = &tracker.pattern.apply_cluster_name;
                    return Ok(Identity {
                        cluster: if name.is_empty() {
                            UNSET_CLUSTER.to_string()
                        } else {
                            name.clone()
                        },
                        node: path_node_id(key),
                    });
                }
            }

            if !line.contains(NODE_ID_MARKER) {
                continue;
            }
            let Some(captures) = self.node_regex.captures(&line) else {
                continue;
            };
            if let Some(name) = captures.name(CLUSTER_NAME_GROUP) {
                let name = name.as_str().trim();
                if !name.is_empty() {
                    cluster = name.to_string();
                }
            }
            if self.has_node_group {
                let node = captures.name(NODE_ID_GROUP).map_or("", |m| m.as_str()).trim();
                return Ok(Identity {
                    cluster,
                    node: if node.is_empty() {
                        UNDEFINED_NODE.to_string()
                    } else {
                        node.to_string()
                    },
                });
            }
        }
    }
}

/// Stable node id for files identified by pattern: a name-based UUID of the path
pub fn path_node_id(key: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
        .simple()
        .to_string()
}
