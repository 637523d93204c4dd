//! Layered settings loading
//!
//! A settings file (YAML, TOML or JSON, picked by extension) is read first,
//! then `LOGINGEST_*` environment variables override individual keys. Nested
//! keys use a double underscore: `LOGINGEST_DEDUP__READ_BYTES=4096`.

use crate::error::{AgiError, Result};
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::debug;

/// Environment prefix without the trailing separator
pub const SETTINGS_ENV_PREFIX: &str = "LOGINGEST";

/// Load `T` from an optional file plus environment overrides
///
/// A `.env` file in the working directory is honoured when present. Missing
/// keys fall back to `T`'s serde defaults.
pub fn load_layered<T: DeserializeOwned>(file: Option<&Path>) -> Result<T> {
    dotenvy::dotenv().ok();

    let mut builder = config::Config::builder();
    if let Some(path) = file {
        if !path.exists() {
            return Err(AgiError::Config(format!(
                "settings file {} does not exist",
                path.display()
            )));
        }
        debug!(path = %path.display(), "Loading settings file");
        builder = builder.add_source(config::File::from(path));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(SETTINGS_ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    builder
        .build()
        .and_then(|settings| settings.try_deserialize::<T>())
        .map_err(|e| AgiError::Config(e.to_string()))
}
