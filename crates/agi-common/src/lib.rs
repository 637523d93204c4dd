//! AGI Common Library
//!
//! Shared error handling and logging setup for the AGI log ingestion tools.
//!
//! - **Error Handling**: [`AgiError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by `LOGINGEST_LOG_*` variables
//! - **Settings**: layered file + environment configuration loading
//!
//! # Example
//!
//! ```no_run
//! use agi_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> agi_common::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     let _guard = init_logging(&config)?;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod error;
pub mod logging;
pub mod settings;

pub use error::{AgiError, Result};
