//! Configuration for toolfit.
//!
//! Static constants live on unit structs; user-tunable options are persisted
//! in a small JSON document loaded once per process.

use crate::persist::atomic_read_json;
use crate::{Result, ToolfitError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_NAME: &'static str = "toolfit";
    /// Environment variable that points at an alternate config file.
    pub const CONFIG_ENV_VAR: &'static str = "TOOLFIT_CONFIG";
    pub const CONFIG_FILE_NAME: &'static str = "config.json";
}

/// Cache directory layout.
pub struct PathsConfig;

impl PathsConfig {
    pub const DOWNLOADS_DIR_NAME: &'static str = "downloads";
    pub const MERGED_DIR_NAME: &'static str = "merged";
    pub const WORK_DIR_NAME: &'static str = "work";
    pub const INDEX_FILE_NAME: &'static str = "index.json";
    pub const LOCK_FILE_NAME: &'static str = ".lock";
    pub const WORK_DIR_PREFIX: &'static str = "run-";
    pub const MODELFILE_NAME: &'static str = "Modelfile";
}

/// Model artifact and collaborator settings.
pub struct ModelConfig;

impl ModelConfig {
    /// File extension of model artifacts.
    pub const ARTIFACT_EXTENSION: &'static str = "gguf";
    /// Bytes read from the head of a model file for architecture sniffing.
    pub const SNIFF_BYTES: usize = 10 * 1024;
    pub const DEFAULT_TEMPERATURE: f64 = 0.7;
    pub const MERGE_TOOL_NAME: &'static str = "llama-gguf-split";
    pub const DOWNLOAD_TOOL_NAME: &'static str = "hf";
    pub const RUNTIME_PROGRAM: &'static str = "ollama";
    pub const SMOKE_TEST_PROMPT: &'static str = "Hello, can you help me with code?";
    /// Name used when nothing usable can be derived from the artifact file name.
    pub const FALLBACK_MODEL_NAME: &'static str = "local-model";
}

/// Persisted, user-tunable settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root of the download/merge cache. `None` means the platform cache dir.
    pub cache_root: Option<PathBuf>,
    /// Keep downloaded files in the cache after a run.
    pub keep_downloads: bool,
    /// Keep merged artifacts in the cache after a run.
    pub keep_merged: bool,
    /// Explicit location of the shard merge tool (file or llama.cpp folder).
    pub merge_tool_path: Option<PathBuf>,
    /// Model runtime executable; looked up on PATH when unset.
    pub runtime_program: Option<PathBuf>,
    /// Hub download CLI; looked up on PATH when unset.
    pub download_program: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_root: None,
            keep_downloads: true,
            keep_merged: true,
            merge_tool_path: None,
            runtime_program: None,
            download_program: None,
        }
    }
}

/// Settings resolved against the command line and the environment.
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub config_path: PathBuf,
    pub cache_root: PathBuf,
    pub settings: Settings,
}

impl ResolvedSettings {
    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_root.join(PathsConfig::DOWNLOADS_DIR_NAME)
    }

    pub fn merged_dir(&self) -> PathBuf {
        self.cache_root.join(PathsConfig::MERGED_DIR_NAME)
    }

    pub fn work_dir(&self) -> PathBuf {
        self.cache_root.join(PathsConfig::WORK_DIR_NAME)
    }
}

/// Default config file location: `<config dir>/toolfit/config.json`.
pub fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().ok_or_else(|| ToolfitError::Config {
        message: "Could not determine the user config directory".to_string(),
    })?;
    Ok(base.join(AppConfig::APP_NAME).join(AppConfig::CONFIG_FILE_NAME))
}

/// Default cache root: `<cache dir>/toolfit`.
pub fn default_cache_root() -> Result<PathBuf> {
    let base = dirs::cache_dir().ok_or_else(|| ToolfitError::Config {
        message: "Could not determine the user cache directory".to_string(),
    })?;
    Ok(base.join(AppConfig::APP_NAME))
}

/// Pick the config file: explicit flag, then environment, then default.
pub fn resolve_config_path(explicit: Option<&Path>, env_value: Option<String>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    match env_value.filter(|v| !v.trim().is_empty()) {
        Some(value) => Ok(PathBuf::from(value)),
        None => default_config_path(),
    }
}

/// Read settings from `path`, falling back to defaults when the file is
/// missing or malformed.
pub fn read_settings(path: &Path) -> Settings {
    match atomic_read_json::<Settings>(path) {
        Ok(Some(settings)) => {
            debug!("Loaded settings from {}", path.display());
            settings
        }
        Ok(None) => Settings::default(),
        Err(e) => {
            warn!("Ignoring unreadable config {}: {}", path.display(), e);
            Settings::default()
        }
    }
}

/// Load settings for this process.
///
/// `cache_root_override` (from the command line) wins over the persisted
/// `cache_root`, which wins over the platform default.
pub fn load_settings(
    config_path: Option<&Path>,
    cache_root_override: Option<&Path>,
) -> Result<ResolvedSettings> {
    let env_value = std::env::var(AppConfig::CONFIG_ENV_VAR).ok();
    let config_path = resolve_config_path(config_path, env_value)?;
    let settings = read_settings(&config_path);

    let cache_root = match (cache_root_override, settings.cache_root.as_deref()) {
        (Some(path), _) => path.to_path_buf(),
        (None, Some(path)) => path.to_path_buf(),
        (None, None) => default_cache_root()?,
    };

    Ok(ResolvedSettings {
        config_path,
        cache_root,
        settings,
    })
}
