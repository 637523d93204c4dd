//! AGI log ingestion
//!
//! Collects database server logs and collectinfo bundles from remote sources,
//! expands archives, removes duplicate content, works out which cluster and
//! node each log belongs to, and lays the result out as
//! `<logs>/<cluster>/<prefix>_<node>_<suffix>` for the downstream indexer.
//!
//! # Stages
//!
//! | Stage | Module | Progress document |
//! |-------|--------|-------------------|
//! | Download | [`download`] | `downloader.json` |
//! | Unpack | [`unpack`] | `unpacker.json` |
//! | Preprocess | [`preprocess`] | `pre-processor.json` |
//! | Logs hand-off | [`downstream`] | `log-processor.json` |
//! | Collectinfo hand-off | [`downstream`] | `cf-processor.json` |
//!
//! Stages run one after another through [`pipeline::Ingest`]; all of them share
//! one [`progress::SharedProgress`] that is saved periodically and reloaded on
//! restart, so an interrupted run resumes without re-downloading or
//! renumbering.

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod detect;
pub mod download;
pub mod downstream;
pub mod enumerate;
pub mod error;
pub mod fsops;
pub mod patterns;
pub mod pipeline;
pub mod preprocess;
pub mod progress;
pub mod unpack;

pub use error::{IngestError, Result};
