//! Configuration loading and validation.
//!
//! The configuration file is optional. When present it provides defaults
//! for run settings, profile options, tool paths and reporting; command
//! line flags override it. See [`schema`] for the file format.

pub mod schema;

pub use schema::*;

use std::borrow::Cow;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Name of the configuration file picked up from the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "targetrun.toml";

/// Invalid configuration values. These are fatal before any test runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("jobs must be at least 1")]
    InvalidJobs,

    #[error("timeout_secs must be at least 1")]
    InvalidTimeout,

    #[error("output_cap_bytes must be at least 1")]
    InvalidOutputCap,

    #[error("Failed to expand path {path}: {message}")]
    Expand { path: String, message: String },
}

impl Config {
    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run.jobs == Some(0) {
            return Err(ConfigError::InvalidJobs);
        }
        if self.run.timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout);
        }
        if self.run.output_cap_bytes == 0 {
            return Err(ConfigError::InvalidOutputCap);
        }
        Ok(())
    }

    /// Expands `~` and `$VARS` in every path-valued setting.
    pub fn expand_paths(&mut self) -> Result<(), ConfigError> {
        expand_opt(&mut self.run.working_dir)?;
        expand_opt(&mut self.run.extensions_dir)?;
        expand_opt(&mut self.profile.ld_path)?;
        for path in &mut self.profile.lib_paths {
            *path = expand_path(path)?;
        }
        for path in self.tools.values_mut() {
            *path = expand_path(path)?;
        }
        expand_opt(&mut self.report.junit)?;
        Ok(())
    }
}

/// Expands `~` and environment variables in a path.
pub fn expand_path(path: &Path) -> Result<PathBuf, ConfigError> {
    let raw = path.to_string_lossy();
    let expanded: Cow<'_, str> = shellexpand::full(&raw).map_err(|e| ConfigError::Expand {
        path: raw.to_string(),
        message: e.to_string(),
    })?;
    Ok(PathBuf::from(expanded.as_ref()))
}

fn expand_opt(path: &mut Option<PathBuf>) -> Result<(), ConfigError> {
    if let Some(p) = path {
        *p = expand_path(p)?;
    }
    Ok(())
}

/// Loads configuration from a TOML file, expanding and validating it.
///
/// # Example
///
/// ```no_run
/// use targetrun::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("targetrun.toml"))?;
/// println!("Timeout: {}s", config.run.timeout_secs);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    load_config_str(&content)
        .with_context(|| format!("Failed to load config file: {}", path.display()))
}

/// Loads configuration from a TOML string.
///
/// ```
/// use targetrun::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [run]
///     jobs = 2
/// "#)?;
/// assert_eq!(config.run.jobs, Some(2));
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.expand_paths()?;
    config.validate()?;
    Ok(config)
}

/// Loads `path` if given, else `targetrun.toml` if it exists, else defaults.
pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => load_config(path),
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.is_file() {
                load_config(default)
            } else {
                Ok(Config::default())
            }
        }
    }
}
