//! Reverb configuration
//!
//! Persistent settings for the reverb processor: mix levels, engine choice,
//! latency and the library to load at startup. Stored as YAML; loading
//! falls back to defaults when the file is missing or invalid so a broken
//! config never prevents startup.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::engine::EngineType;

/// Reverb processor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverbConfig {
    /// Wet (reverb) mix level, 0.0-1.0. Default: 0.3
    pub wet_level: f64,

    /// Dry (direct) mix level, 0.0-1.0. Default: 0.7
    pub dry_level: f64,

    /// Convolution engine to build on IR load. Default: low-latency
    pub engine: EngineType,

    /// Latency as a block order (6 = 64 samples ... 9 = 512 samples).
    /// Default: 6
    pub latency_order: usize,

    /// Resampler quality as sinc lobes per side (4-64). Default: 16
    pub resampler_lobes: usize,

    /// IR library to load at startup, if any
    pub library_path: Option<PathBuf>,

    /// IR to select from the library at startup (by name)
    pub startup_ir: Option<String>,
}

impl Default for ReverbConfig {
    fn default() -> Self {
        Self {
            wet_level: 0.3,
            dry_level: 0.7,
            engine: EngineType::LowLatency,
            latency_order: 6,
            resampler_lobes: 16,
            library_path: None,
            startup_ir: None,
        }
    }
}

/// Load configuration from a YAML file.
///
/// If the file doesn't exist, or exists but fails to parse, returns the
/// default config (with a warning in the parse-failure case).
pub fn load_config<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        log::info!("config file {path:?} doesn't exist, using defaults");
        return T::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<T>(&contents) {
            Ok(config) => config,
            Err(err) => {
                log::warn!("failed to parse config {path:?}: {err}, using defaults");
                T::default()
            }
        },
        Err(err) => {
            log::warn!("failed to read config {path:?}: {err}, using defaults");
            T::default()
        }
    }
}

/// Save configuration to a YAML file, creating parent directories as needed.
pub fn save_config<T>(config: &T, path: &Path) -> Result<()>
where
    T: Serialize,
{
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {parent:?}"))?;
    }

    let yaml = serde_yaml::to_string(config).context("failed to serialize config")?;
    std::fs::write(path, yaml).with_context(|| format!("failed to write config file {path:?}"))?;

    log::info!("config saved to {path:?}");
    Ok(())
}
