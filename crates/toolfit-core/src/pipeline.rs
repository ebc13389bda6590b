//! End-to-end setup run.
//!
//! A run moves through the [`Stage`]s strictly forward:
//!
//! ```text
//! Classifying -> Resolving -> ShardChecking -> Merging -> ArchitectureDetecting
//!   -> Composing -> Registering -> Verifying -> TestingSmoke -> Done
//! ```
//!
//! Any error aborts the run. The per-run working directory is owned by a
//! [`WorkDir`] guard created before the first stage that writes to disk, so
//! it is removed on success, on failure and when the run future is dropped
//! by an interrupt, unless retention was requested.
//!
//! External calls are single-attempt; nothing is retried.

use serde::Serialize;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::architecture::{self, Architecture, ArchitectureDetection};
use crate::cache::{CacheArea, CacheEntry, CacheStore, ResolvedArtifact};
use crate::config::{ModelConfig, PathsConfig, ResolvedSettings};
use crate::download::{find_artifacts, select_primary, HubDownloader};
use crate::error::Advisory;
use crate::merge::{MergeTool, ShardMerger};
use crate::modelfile::{self, ModelfileParams};
use crate::naming::{derive_model_name, sanitize_model_name};
use crate::process::ProcessRunner;
use crate::runtime::OllamaCli;
use crate::shard::{self, ShardSet};
use crate::source::{self, ModelSource, SourceKind};
use crate::{Result, ToolfitError};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classifying,
    Resolving,
    ShardChecking,
    Merging,
    ArchitectureDetecting,
    Composing,
    Registering,
    Verifying,
    TestingSmoke,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Classifying => "classifying",
            Stage::Resolving => "resolving",
            Stage::ShardChecking => "shard-checking",
            Stage::Merging => "merging",
            Stage::ArchitectureDetecting => "architecture-detecting",
            Stage::Composing => "composing",
            Stage::Registering => "registering",
            Stage::Verifying => "verifying",
            Stage::TestingSmoke => "testing-smoke",
            Stage::Done => "done",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Forward-only stage tracker.
#[derive(Debug)]
struct StageCursor {
    current: Stage,
    visited: Vec<Stage>,
}

impl StageCursor {
    fn new() -> Self {
        Self {
            current: Stage::Classifying,
            visited: vec![Stage::Classifying],
        }
    }

    fn advance(&mut self, next: Stage) {
        debug_assert!(next > self.current, "stage {next} after {}", self.current);
        info!("[{}]", next);
        self.current = next;
        self.visited.push(next);
    }
}

/// Options for one setup run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParameters {
    /// Repository reference, hub URL or local path.
    pub source: String,
    /// Name to register; derived from the artifact file name when absent.
    pub model_name: Option<String>,
    /// Fixed architecture; detected when absent.
    pub architecture: Option<Architecture>,
    /// Emitted as `num_ctx` only when set.
    pub context_length: Option<u32>,
    pub temperature: f64,
    /// Used when the source carries no `:QUANT` suffix.
    pub quant_filter: Option<String>,
    /// Overrides the configured merge tool location.
    pub merge_tool_path: Option<PathBuf>,
    /// Keep the per-run working directory.
    pub keep_artifacts: bool,
    pub skip_smoke_test: bool,
}

impl RunParameters {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            model_name: None,
            architecture: None,
            context_length: None,
            temperature: ModelConfig::DEFAULT_TEMPERATURE,
            quant_filter: None,
            merge_tool_path: None,
            keep_artifacts: false,
            skip_smoke_test: false,
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(ToolfitError::Config {
                message: format!(
                    "temperature must be a non-negative number, got {}",
                    self.temperature
                ),
            });
        }
        if self.context_length == Some(0) {
            return Err(ToolfitError::Config {
                message: "context length must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub model_name: String,
    pub source: ModelSource,
    pub artifact: ResolvedArtifact,
    pub architecture: Architecture,
    /// `None` when the architecture was fixed by the caller.
    pub detection: Option<ArchitectureDetection>,
    /// Whether the artifact came from the cache without download or merge.
    pub cache_hit: bool,
    /// Set when the working directory was retained.
    pub work_dir: Option<PathBuf>,
    pub stages: Vec<Stage>,
    pub advisories: Vec<Advisory>,
}

/// Per-run scratch directory, removed on drop unless retained.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    keep: bool,
}

impl WorkDir {
    /// Create `<parent>/run-<uuid>`.
    pub fn create(parent: &Path, keep: bool) -> Result<Self> {
        let parent =
            std::path::absolute(parent).map_err(|e| ToolfitError::io_with_path(e, parent))?;
        let path = parent.join(format!("{}{}", PathsConfig::WORK_DIR_PREFIX, Uuid::new_v4()));
        std::fs::create_dir_all(&path)
            .map_err(|e| ToolfitError::io("creating work directory", &path, e))?;
        Ok(Self { path, keep })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_kept(&self) -> bool {
        self.keep
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.keep {
            info!("Kept working directory: {}", self.path.display());
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove working directory {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Artifact produced by the resolving stage.
struct Resolved {
    path: PathBuf,
    cache_hit: bool,
}

/// Sequences the pipeline stages.
pub struct Orchestrator {
    settings: ResolvedSettings,
    runner: Arc<dyn ProcessRunner>,
    cache: CacheStore,
}

impl Orchestrator {
    pub fn new(settings: ResolvedSettings, runner: Arc<dyn ProcessRunner>) -> Self {
        let cache = CacheStore::new(&settings.cache_root);
        Self {
            settings,
            runner,
            cache,
        }
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Run until completion or until `cancel` resolves.
    ///
    /// On cancellation the run future is dropped, which kills any running
    /// child process and releases the working directory guard.
    pub async fn run_until<F>(&self, params: &RunParameters, cancel: F) -> Result<RunReport>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            result = self.run(params) => result,
            _ = cancel => {
                warn!("Cancelled");
                Err(ToolfitError::Cancelled)
            }
        }
    }

    /// Run the whole pipeline once.
    pub async fn run(&self, params: &RunParameters) -> Result<RunReport> {
        let mut cursor = StageCursor::new();
        let result = self.execute(params, &mut cursor).await;
        if let Err(e) = &result {
            error!("Failed while {}: {}", cursor.current, e);
        }
        result
    }

    async fn execute(&self, params: &RunParameters, cursor: &mut StageCursor) -> Result<RunReport> {
        let runner = self.runner.as_ref();
        let mut advisories = Vec::new();

        info!("[{}]", Stage::Classifying);
        params.validate()?;
        let runtime = OllamaCli::locate(self.settings.settings.runtime_program.as_deref())?;
        let source = source::classify(&params.source)?;
        let quant = source.effective_quant(params.quant_filter.as_deref());
        if let (Some(embedded), Some(supplied)) = (&source.quant_filter, &params.quant_filter) {
            if !embedded.eq_ignore_ascii_case(supplied) {
                warn!("Using quant {} from the source reference instead of {}", embedded, supplied);
            }
        }

        let work_dir = WorkDir::create(&self.settings.work_dir(), params.keep_artifacts)?;

        cursor.advance(Stage::Resolving);
        let resolved = self.resolve(&source, quant.as_deref(), &work_dir).await?;

        cursor.advance(Stage::ShardChecking);
        let shards = shard::detect(&resolved.path)?;
        let (artifact, cache_hit) = match shards {
            Some(set) => {
                info!(
                    "Sharded model: {} parts of {}",
                    set.len(),
                    set.base_name
                );
                set.ensure_complete()?;
                cursor.advance(Stage::Merging);
                self.merge(&set, params, &work_dir).await?
            }
            None => (
                ResolvedArtifact::from_path(&resolved.path, false)?,
                resolved.cache_hit,
            ),
        };
        info!("Working with {}", artifact.path.display());

        cursor.advance(Stage::ArchitectureDetecting);
        let (architecture, detection) = match params.architecture {
            Some(fixed) => {
                info!("Architecture: {} (override)", fixed);
                (fixed, None)
            }
            None => {
                let detection = architecture::detect(&artifact.path);
                if !detection.is_confident() {
                    push_advisory(
                        &mut advisories,
                        Advisory::ArchitectureUnconfident {
                            fallback: detection.architecture.to_string(),
                        },
                    );
                }
                info!("Architecture: {}", detection.architecture);
                (detection.architecture, Some(detection))
            }
        };

        cursor.advance(Stage::Composing);
        let model_name = params
            .model_name
            .as_deref()
            .map(sanitize_model_name)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| derive_model_name(&artifact.path));
        info!("Model name: {}", model_name);

        let file_name = artifact
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let hint = format!("{} {}", source.repo_id.as_deref().unwrap_or_default(), file_name);
        let modelfile_params = ModelfileParams::new(params.context_length, params.temperature)
            .with_compatibility_for(&hint);
        let text = modelfile::compose(&artifact.path, architecture, &modelfile_params);
        let modelfile_path = work_dir.path().join(PathsConfig::MODELFILE_NAME);
        std::fs::write(&modelfile_path, &text)
            .map_err(|e| ToolfitError::io("writing Modelfile", &modelfile_path, e))?;

        cursor.advance(Stage::Registering);
        runtime.create(runner, &model_name, &modelfile_path).await?;

        cursor.advance(Stage::Verifying);
        if let Some(advisory) = runtime.verify(runner, &model_name).await {
            push_advisory(&mut advisories, advisory);
        }

        if !params.skip_smoke_test {
            cursor.advance(Stage::TestingSmoke);
            if let Some(advisory) = runtime
                .smoke_test(runner, &model_name, ModelConfig::SMOKE_TEST_PROMPT)
                .await
            {
                push_advisory(&mut advisories, advisory);
            }
        }

        cursor.advance(Stage::Done);
        info!("Setup complete: {} is ready for tool calling", model_name);

        Ok(RunReport {
            model_name,
            source,
            artifact,
            architecture,
            detection,
            cache_hit,
            work_dir: work_dir.is_kept().then(|| work_dir.path().to_path_buf()),
            stages: cursor.visited.clone(),
            advisories,
        })
    }

    /// Produce the model file to continue with: a cached or fresh download,
    /// or the user's local file.
    async fn resolve(
        &self,
        source: &ModelSource,
        quant: Option<&str>,
        work_dir: &WorkDir,
    ) -> Result<Resolved> {
        match source.kind {
            SourceKind::Local => {
                let path = source.local_path().unwrap_or_else(|| PathBuf::from(&source.raw));
                let path = if path.is_dir() {
                    select_primary(&find_artifacts(&path)).ok_or_else(|| {
                        ToolfitError::NoArtifactsFound {
                            repo_id: path.display().to_string(),
                            pattern: "*".to_string(),
                            extension: ModelConfig::ARTIFACT_EXTENSION.to_string(),
                        }
                    })?
                } else {
                    path
                };
                let path =
                    std::path::absolute(&path).map_err(|e| ToolfitError::io_with_path(e, &path))?;
                Ok(Resolved {
                    path,
                    cache_hit: false,
                })
            }
            SourceKind::Remote => {
                let repo_id = source.repo_id.as_deref().unwrap_or(&source.raw);
                let keep = self.settings.settings.keep_downloads;
                let key = CacheStore::fingerprint(repo_id, quant);

                if keep {
                    if let Some(entry) = self.cache.get(&key)? {
                        info!("Reusing cached download: {}", entry.artifact_path.display());
                        return Ok(Resolved {
                            path: entry.artifact_path,
                            cache_hit: true,
                        });
                    }
                }

                let configured = self.settings.settings.download_program.as_deref();
                let downloader = HubDownloader::locate(configured).map_err(|e| match e {
                    ToolfitError::DownloadFailed { message, .. } => ToolfitError::DownloadFailed {
                        repo_id: repo_id.to_string(),
                        message,
                    },
                    other => other,
                })?;
                let dest = if keep {
                    self.cache.download_dir(&key)
                } else {
                    work_dir.path().join(PathsConfig::DOWNLOADS_DIR_NAME)
                };

                let path = downloader
                    .download(self.runner.as_ref(), repo_id, &dest, quant)
                    .await?;
                info!("Downloaded: {}", path.display());

                if keep {
                    let artifact = ResolvedArtifact::from_path(&path, false)?;
                    self.cache.put(CacheEntry::new(
                        &key,
                        repo_id,
                        quant.map(String::from),
                        &artifact,
                    ))?;
                }
                Ok(Resolved {
                    path,
                    cache_hit: false,
                })
            }
        }
    }

    /// Merge a complete shard set, reusing a cached merge when possible.
    ///
    /// Merges are keyed by [`ShardSet::signature`], so replaced or rewritten
    /// shards never hit an old entry. Shards that only live in this run's
    /// work directory are merged there too and never cached.
    async fn merge(
        &self,
        set: &ShardSet,
        params: &RunParameters,
        work_dir: &WorkDir,
    ) -> Result<(ResolvedArtifact, bool)> {
        let first = set
            .first_shard()
            .ok_or_else(|| ToolfitError::IncompleteShardSet {
                base_name: set.base_name.clone(),
                total: 0,
                missing: Vec::new(),
            })?;
        let reference = first.to_string_lossy().into_owned();
        let keep =
            self.settings.settings.keep_merged && !set.directory.starts_with(work_dir.path());
        let key = CacheStore::fingerprint(&set.signature(), None);

        if keep {
            if let Some(entry) = self.cache.get(&key)? {
                info!("Reusing cached merge: {}", entry.artifact_path.display());
                return Ok((entry.artifact(), true));
            }
        }

        let configured = params
            .merge_tool_path
            .as_deref()
            .or(self.settings.settings.merge_tool_path.as_deref());
        let tool = MergeTool::locate(configured)?;

        let file_name = format!("{}.{}", set.base_name, set.extension);
        let output = if keep {
            self.cache.merged_path(&key, &file_name)
        } else {
            work_dir.path().join(&file_name)
        };

        let artifact = ShardMerger::new(self.runner.as_ref(), &tool)
            .merge(set, &output)
            .await?;

        if keep {
            self.evict_superseded_merges(&reference, &key)?;
            self.cache
                .put(CacheEntry::new(&key, &reference, None, &artifact))?;
        }
        Ok((artifact, false))
    }

    /// Drop older merges of the same first shard along with their files.
    fn evict_superseded_merges(&self, reference: &str, key: &str) -> Result<()> {
        let merged_area = self.cache.area_dir(CacheArea::Merged);
        let stale = self
            .cache
            .entries()
            .into_iter()
            .filter(|e| e.is_merged && e.reference == reference && e.key != key);
        for entry in stale {
            info!("Dropping superseded merge {}", entry.artifact_path.display());
            self.cache.remove(&entry.key)?;
            let dir = entry
                .artifact_path
                .parent()
                .filter(|d| d.parent() == Some(merged_area.as_path()));
            if let Some(dir) = dir {
                if let Err(e) = std::fs::remove_dir_all(dir) {
                    warn!("Failed to remove {}: {}", dir.display(), e);
                }
            }
        }
        Ok(())
    }
}

fn push_advisory(advisories: &mut Vec<Advisory>, advisory: Advisory) {
    warn!("{}", advisory);
    advisories.push(advisory);
}
