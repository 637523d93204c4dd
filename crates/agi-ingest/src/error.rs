//! Error types for the ingest pipeline
//!
//! Only stage-aborting conditions travel through [`IngestError`]. Per-file
//! failures are stored as strings on the progress records instead.

use std::path::{Path, PathBuf};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("IO error at {path}: {error}")]
    Io {
        path: PathBuf,
        #[source]
        error: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to enumerate {path}: {message}")]
    Enumerate { path: PathBuf, message: String },

    #[error("Failed to list {kind} source: {message}")]
    Listing { kind: &'static str, message: String },

    #[error("Progress document {name}: {message}")]
    Progress { name: String, message: String },

    #[error("node ID not found")]
    IdentityNotFound,

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A pipeline stage failed
    #[error("{stage}: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<IngestError>,
    },

    /// Errors from concurrently run branches, joined with `"; "`
    #[error("{0}")]
    Aggregate(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IngestError {
    pub fn io(path: impl AsRef<Path>, error: std::io::Error) -> Self {
        IngestError::Io {
            path: path.as_ref().to_path_buf(),
            error,
        }
    }

    /// Tag an error with the stage it came from
    pub fn in_stage(stage: &'static str) -> impl FnOnce(IngestError) -> IngestError {
        move |source| IngestError::Stage {
            stage,
            source: Box::new(source),
        }
    }

    /// Join several branch errors into one, or `None` when all succeeded
    pub fn aggregate<I>(errors: I) -> Option<Self>
    where
        I: IntoIterator<Item = IngestError>,
    {
        let joined = errors
            .into_iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        if joined.is_empty() {
            None
        } else {
            Some(IngestError::Aggregate(joined))
        }
    }
}

impl From<agi_common::AgiError> for IngestError {
    fn from(err: agi_common::AgiError) -> Self {
        match err {
            agi_common::AgiError::Config(msg) => IngestError::Config(msg),
            other => IngestError::Other(anyhow::Error::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_joins_with_semicolon() {
        let err = IngestError::aggregate(vec![
            IngestError::Aggregate("log processor: disk full".into()),
            IngestError::IdentityNotFound,
        ]);
        assert_eq!(
            err.map(|e| e.to_string()).as_deref(),
            Some("log processor: disk full; node ID not found")
        );
    }

    #[test]
    fn test_aggregate_of_nothing_is_none() {
        assert!(IngestError::aggregate(Vec::new()).is_none());
    }

    #[test]
    fn test_stage_prefix() {
        let err = IngestError::in_stage("PreProcess")(IngestError::Config("bad".into()));
        assert_eq!(err.to_string(), "PreProcess: Configuration error: bad");
    }
}
