//! Remote repository download through the hub CLI.
//!
//! The download itself is delegated to `hf download`; this module builds the
//! invocation, checks the outcome and picks the model file to continue with.

use std::path::{Path, PathBuf};
use tokio::sync::OnceCell;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::ModelConfig;
use crate::process::{resolve_program, CommandSpec, ProcessRunner};
use crate::shard::parse_shard_name;
use crate::{Result, ToolfitError};

/// Substrings marking auxiliary GGUFs that are not the model weights.
const HELPER_MARKERS: &[&str] = &["imatrix", "mmproj", "clip", "vision", "text-encoder", "vae"];

const SYMLINKS_FLAG: &str = "--local-dir-use-symlinks";

/// `--include` glob for an optional quant filter.
pub fn include_pattern(quant_filter: Option<&str>) -> String {
    let ext = ModelConfig::ARTIFACT_EXTENSION;
    match quant_filter {
        Some(quant) => format!("*{quant}*.{ext}"),
        None => format!("*.{ext}"),
    }
}

/// Driver for the hub download CLI.
#[derive(Debug)]
pub struct HubDownloader {
    program: PathBuf,
    supports_symlinks_flag: OnceCell<bool>,
}

impl HubDownloader {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            supports_symlinks_flag: OnceCell::new(),
        }
    }

    /// Find the CLI from configuration or the search path.
    pub fn locate(configured: Option<&Path>) -> Result<Self> {
        let name = ModelConfig::DOWNLOAD_TOOL_NAME;
        resolve_program(configured, name)
            .map(Self::new)
            .ok_or_else(|| ToolfitError::DownloadFailed {
                repo_id: String::new(),
                message: format!(
                    "HuggingFace CLI ('{name}') not found. \
                     Install with: python -m pip install -U huggingface_hub"
                ),
            })
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Older CLI versions take `--local-dir-use-symlinks`; newer ones reject it.
    async fn supports_symlinks_flag(&self, runner: &dyn ProcessRunner) -> bool {
        *self
            .supports_symlinks_flag
            .get_or_init(|| async {
                let spec = CommandSpec::new(&self.program).args(["download", "--help"]);
                match runner.run(&spec).await {
                    Ok(output) => output.combined().contains(SYMLINKS_FLAG),
                    Err(e) => {
                        debug!("Could not read download CLI help: {}", e);
                        false
                    }
                }
            })
            .await
    }

    /// Build the download invocation.
    pub fn command(
        &self,
        repo_id: &str,
        dest: &Path,
        quant_filter: Option<&str>,
        symlinks_flag: bool,
    ) -> CommandSpec {
        let mut spec = CommandSpec::new(&self.program)
            .args(["download", repo_id, "--local-dir"])
            .arg(dest);
        if symlinks_flag {
            spec = spec.args([SYMLINKS_FLAG, "False"]);
        }
        spec.arg("--include")
            .arg(include_pattern(quant_filter))
            .env("HF_HUB_DISABLE_SYMLINKS_WARNING", "1")
            .streamed()
    }

    /// Download `repo_id` into `dest` and return the primary model file.
    ///
    /// Single attempt: a non-zero exit is [`ToolfitError::DownloadFailed`],
    /// and a successful exit with no matching files is
    /// [`ToolfitError::NoArtifactsFound`].
    pub async fn download(
        &self,
        runner: &dyn ProcessRunner,
        repo_id: &str,
        dest: &Path,
        quant_filter: Option<&str>,
    ) -> Result<PathBuf> {
        std::fs::create_dir_all(dest)
            .map_err(|e| ToolfitError::io("creating download directory", dest, e))?;

        let symlinks_flag = self.supports_symlinks_flag(runner).await;
        let spec = self.command(repo_id, dest, quant_filter, symlinks_flag);
        info!("Downloading {} ({})", repo_id, include_pattern(quant_filter));

        let output = runner.run(&spec).await?;
        if !output.success() {
            return Err(ToolfitError::DownloadFailed {
                repo_id: repo_id.to_string(),
                message: format!("exit {}: {}", output.exit_code, output.combined()),
            });
        }

        let candidates = find_artifacts(dest);
        select_primary(&candidates).ok_or_else(|| ToolfitError::NoArtifactsFound {
            repo_id: repo_id.to_string(),
            pattern: include_pattern(quant_filter),
            extension: ModelConfig::ARTIFACT_EXTENSION.to_string(),
        })
    }
}

/// A downloaded model file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Model files under `dir`, recursively.
pub fn find_artifacts(dir: &Path) -> Vec<Candidate> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(ModelConfig::ARTIFACT_EXTENSION))
        })
        .map(|e| Candidate {
            size_bytes: e.metadata().map(|m| m.len()).unwrap_or(0),
            path: e.into_path(),
        })
        .collect()
}

pub fn is_helper_artifact(file_name: &str) -> bool {
    let lowered = file_name.to_lowercase();
    HELPER_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Pick the file to continue with.
///
/// Helper files are ignored when real weights are present. Among the rest,
/// the first shard of a split file wins; otherwise the largest file.
pub fn select_primary(candidates: &[Candidate]) -> Option<PathBuf> {
    let file_name = |c: &Candidate| {
        c.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    let weights: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| !is_helper_artifact(&file_name(c)))
        .collect();
    let pool: Vec<&Candidate> = if weights.is_empty() {
        candidates.iter().collect()
    } else {
        weights
    };

    let mut first_shards: Vec<&Candidate> = pool
        .iter()
        .copied()
        .filter(|c| parse_shard_name(&file_name(c)).is_some_and(|s| s.index == 1))
        .collect();
    if !first_shards.is_empty() {
        first_shards.sort_by_key(|c| file_name(c));
        return Some(first_shards[0].path.clone());
    }

    pool.iter()
        .max_by_key(|c| c.size_bytes)
        .map(|c| c.path.clone())
}
