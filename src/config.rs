//! Configuration management for relic.
//!
//! Configuration can be set via environment variables:
//! - `RELIC_ARTIFACT` - Optional. Path of the encrypted artifact. Defaults to `config/relic.json`.
//! - `RELIC_MASTER_KEY_FILE` - Optional. Path of the master key file. Defaults to `config/relic.key`.
//! - `RELIC_MASTER_KEY` - Optional. Inline master key, used when the key file is absent or empty.
//! - `RELIC_ITERATIONS` - Optional. PBKDF2 iterations for new tokens. Defaults to `210000`.
//! - `VISUAL` / `EDITOR` - Optional. Editor command for `relic edit`. Defaults to `vi`.

use std::path::PathBuf;
use thiserror::Error;

use crate::codec::{valid_iterations, DEFAULT_ITERATIONS, MAX_ITERATIONS, MIN_ITERATIONS};
use crate::edit::{CommandEditor, DEFAULT_EDITOR};
use crate::error::RelicError;
use crate::kdf::MasterKey;

pub const DEFAULT_ARTIFACT_PATH: &str = "config/relic.json";
pub const DEFAULT_KEY_FILE: &str = "config/relic.key";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Engine configuration.
#[derive(Clone)]
pub struct Config {
    /// Encrypted artifact location
    pub artifact_path: PathBuf,

    /// Master key file location
    pub key_file: PathBuf,

    /// Inline master key from the environment
    pub master_key: Option<MasterKey>,

    /// PBKDF2 iterations for newly encrypted leaves
    pub iterations: u32,

    /// Editor command line
    pub editor: String,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("artifact_path", &self.artifact_path)
            .field("key_file", &self.key_file)
            .field("master_key", &self.master_key.as_ref().map(|_| "<redacted>"))
            .field("iterations", &self.iterations)
            .field("editor", &self.editor)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            artifact_path: PathBuf::from(DEFAULT_ARTIFACT_PATH),
            key_file: PathBuf::from(DEFAULT_KEY_FILE),
            master_key: None,
            iterations: DEFAULT_ITERATIONS,
            editor: DEFAULT_EDITOR.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if `RELIC_ITERATIONS` is not a
    /// number in the supported range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let artifact_path = non_empty("RELIC_ARTIFACT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACT_PATH));

        let key_file = non_empty("RELIC_MASTER_KEY_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_KEY_FILE));

        // A blank inline key is treated as unset.
        let master_key = non_empty("RELIC_MASTER_KEY").and_then(|k| MasterKey::new(k).ok());

        let iterations = match non_empty("RELIC_ITERATIONS") {
            Some(raw) => parse_iterations(&raw)
                .map_err(|e| ConfigError::InvalidValue("RELIC_ITERATIONS".to_string(), e))?,
            None => DEFAULT_ITERATIONS,
        };

        let editor = non_empty("VISUAL")
            .or_else(|| non_empty("EDITOR"))
            .unwrap_or_else(|| DEFAULT_EDITOR.to_string());

        Ok(Self {
            artifact_path,
            key_file,
            master_key,
            iterations,
            editor,
        })
    }

    /// Editor process described by the configured command line.
    pub fn editor(&self) -> CommandEditor {
        CommandEditor::from_command_line(&self.editor)
            .unwrap_or_else(|| CommandEditor::new(DEFAULT_EDITOR))
    }
}

/// Parse an iteration count and check it against the supported range.
pub fn parse_iterations(raw: &str) -> Result<u32, String> {
    let iterations: u32 = raw.trim().parse().map_err(|e| format!("{}", e))?;
    if !valid_iterations(iterations) {
        return Err(format!(
            "{} is outside {}..={}",
            iterations, MIN_ITERATIONS, MAX_ITERATIONS
        ));
    }
    Ok(iterations)
}

/// Resolve the master key: the key file wins when it exists and is non-empty
/// after trimming, then the inline key from the environment.
pub async fn resolve_master_key(config: &Config) -> Result<MasterKey, RelicError> {
    match tokio::fs::read_to_string(&config.key_file).await {
        Ok(contents) => {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                tracing::debug!("Using master key from {}", config.key_file.display());
                return MasterKey::new(trimmed);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    config
        .master_key
        .clone()
        .ok_or(RelicError::MissingMasterKey)
}
