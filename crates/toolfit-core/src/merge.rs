//! Shard merging through `llama-gguf-split`.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::cache::{format_bytes, ResolvedArtifact};
use crate::config::ModelConfig;
use crate::process::{existing_file, find_on_path, CommandSpec, ProcessRunner};
use crate::shard::ShardSet;
use crate::{Result, ToolfitError};

/// Merges need roughly this multiple of the shard-set size while running.
const DISK_SPACE_FACTOR: u64 = 2;

fn tool_file_name() -> String {
    format!("{}{}", ModelConfig::MERGE_TOOL_NAME, std::env::consts::EXE_SUFFIX)
}

/// Places a llama.cpp checkout or release keeps its binaries, relative to
/// the install folder.
fn binaries_in(dir: &Path) -> Vec<PathBuf> {
    let name = tool_file_name();
    vec![
        dir.join(&name),
        dir.join("bin").join(&name),
        dir.join("build").join("bin").join(&name),
        dir.join("build").join("bin").join("Release").join(&name),
    ]
}

fn common_install_dirs() -> Vec<PathBuf> {
    let mut found = Vec::new();
    if let Some(home) = dirs::home_dir() {
        found.push(home.join("llama.cpp"));
        found.push(home.join(".local"));
    }
    if cfg!(windows) {
        found.push(PathBuf::from(r"C:\llama.cpp"));
    } else {
        found.push(PathBuf::from("/usr/local"));
        found.push(PathBuf::from("/opt/homebrew"));
        found.push(PathBuf::from("/opt/llama.cpp"));
    }
    found
}

/// A located merge tool executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeTool {
    path: PathBuf,
}

impl MergeTool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Candidate locations for the tool, in search order, excluding the
    /// search path.
    pub fn candidates(configured: Option<&Path>) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(path) = configured {
            if path.is_file() {
                candidates.push(path.to_path_buf());
            } else {
                candidates.extend(binaries_in(path));
            }
        }
        for dir in common_install_dirs() {
            candidates.extend(binaries_in(&dir));
        }
        candidates
    }

    /// Check the configured path, then common install locations, then the
    /// search path. Fails with [`ToolfitError::MergeToolNotFound`].
    pub fn locate(configured: Option<&Path>) -> Result<Self> {
        if let Some(path) = configured {
            if !path.exists() {
                warn!("Configured merge tool path {} does not exist", path.display());
            }
        }

        let found = Self::candidates(configured)
            .iter()
            .find_map(|c| existing_file(c))
            .or_else(|| find_on_path(ModelConfig::MERGE_TOOL_NAME));

        match found {
            Some(path) => {
                debug!("Using merge tool at {}", path.display());
                Ok(Self::new(path))
            }
            None => Err(ToolfitError::MergeToolNotFound {
                tool: ModelConfig::MERGE_TOOL_NAME.to_string(),
            }),
        }
    }

    /// `--merge <first shard> <output>`
    pub fn command(&self, first_shard: &Path, output: &Path) -> CommandSpec {
        CommandSpec::new(&self.path)
            .arg("--merge")
            .arg(first_shard)
            .arg(output)
            .streamed()
    }
}

/// Warn when the destination volume looks too small for the merge.
///
/// Returns the available byte count when it is below the estimate. The
/// check is advisory; merging proceeds either way.
pub fn check_disk_space(dest_dir: &Path, shard_bytes: u64) -> Option<u64> {
    let required = shard_bytes.saturating_mul(DISK_SPACE_FACTOR);
    match fs2::available_space(dest_dir) {
        Ok(available) if available < required => {
            warn!(
                "Only {} free at {}; merging may need about {}",
                format_bytes(available),
                dest_dir.display(),
                format_bytes(required)
            );
            Some(available)
        }
        Ok(_) => None,
        Err(e) => {
            debug!("Could not query free space at {}: {}", dest_dir.display(), e);
            None
        }
    }
}

/// In-progress merge output, removed on drop unless committed.
///
/// Also removes the destination folder when the merge created it and it is
/// left empty, so a failed or interrupted merge leaves nothing behind.
struct PartialOutput {
    path: PathBuf,
    created_dir: Option<PathBuf>,
    committed: bool,
}

impl PartialOutput {
    fn for_output(output: &Path, created_dir: Option<PathBuf>) -> Self {
        let mut name = output.file_name().map(OsString::from).unwrap_or_default();
        name.push(".partial");
        Self {
            path: output.with_file_name(name),
            created_dir,
            committed: false,
        }
    }

    fn commit(mut self, output: &Path) -> Result<()> {
        std::fs::rename(&self.path, output)
            .map_err(|e| ToolfitError::io("moving merge output into place", output, e))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for PartialOutput {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed partial merge output {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.path.display(), e),
        }
        if let Some(dir) = &self.created_dir {
            // Only succeeds when empty.
            let _ = std::fs::remove_dir(dir);
        }
    }
}

/// Runs one merge of a complete shard set.
pub struct ShardMerger<'a> {
    runner: &'a dyn ProcessRunner,
    tool: &'a MergeTool,
}

impl<'a> ShardMerger<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, tool: &'a MergeTool) -> Self {
        Self { runner, tool }
    }

    /// Merge `set` into `output`.
    ///
    /// The set must be complete. The tool writes to `<output>.partial`, which
    /// is renamed to `output` only on success and removed otherwise,
    /// including when this future is dropped. A non-zero exit maps to
    /// [`ToolfitError::MergeFailed`]; a zero exit without an output file
    /// maps to [`ToolfitError::MergeOutputMissing`].
    pub async fn merge(&self, set: &ShardSet, output: &Path) -> Result<ResolvedArtifact> {
        set.ensure_complete()?;
        let first = set
            .first_shard()
            .ok_or_else(|| ToolfitError::IncompleteShardSet {
                base_name: set.base_name.clone(),
                total: 0,
                missing: Vec::new(),
            })?;

        let dest_dir = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let created_dir = (!dest_dir.exists()).then(|| dest_dir.to_path_buf());
        std::fs::create_dir_all(dest_dir)
            .map_err(|e| ToolfitError::io("creating merge directory", dest_dir, e))?;
        if output.exists() {
            debug!("Removing stale merge output {}", output.display());
            std::fs::remove_file(output)
                .map_err(|e| ToolfitError::io("removing stale merge output", output, e))?;
        }
        let partial = PartialOutput::for_output(output, created_dir);
        if partial.path.exists() {
            std::fs::remove_file(&partial.path)
                .map_err(|e| ToolfitError::io("removing stale merge output", &partial.path, e))?;
        }

        check_disk_space(dest_dir, set.total_size_bytes());

        info!(
            "Merging {} shards of {} into {}",
            set.len(),
            set.base_name,
            output.display()
        );
        let result = self
            .runner
            .run(&self.tool.command(first, &partial.path))
            .await?;
        if !result.success() {
            return Err(ToolfitError::MergeFailed {
                exit_code: result.exit_code,
                output: result.combined(),
            });
        }
        if !partial.path.is_file() {
            return Err(ToolfitError::MergeOutputMissing(output.to_path_buf()));
        }
        partial.commit(output)?;

        let artifact = ResolvedArtifact::from_path(output, true)?;
        info!("Merged model is {}", format_bytes(artifact.size_bytes));
        Ok(artifact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_locate_from_explicit_file() {
        let temp = TempDir::new().unwrap();
        let tool = temp.path().join("my-split");
        std::fs::write(&tool, b"").unwrap();

        let located = MergeTool::locate(Some(&tool)).unwrap();
        assert_eq!(located.path(), tool.as_path());
    }

    #[test]
    fn test_locate_from_install_folder() {
        let temp = TempDir::new().unwrap();
        let bin = temp.path().join("build").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let tool = bin.join(tool_file_name());
        std::fs::write(&tool, b"").unwrap();

        let located = MergeTool::locate(Some(temp.path())).unwrap();
        assert_eq!(located.path(), tool.as_path());
    }

    #[test]
    fn test_candidates_start_with_configured_folder() {
        let candidates = MergeTool::candidates(Some(Path::new("/opt/custom")));
        assert_eq!(
            candidates[0],
            Path::new("/opt/custom").join(tool_file_name())
        );
        assert_eq!(
            candidates[1],
            Path::new("/opt/custom").join("bin").join(tool_file_name())
        );
    }

    #[test]
    fn test_command_shape() {
        let tool = MergeTool::new("/usr/bin/llama-gguf-split");
        let spec = tool.command(Path::new("/m/a-00001-of-00002.gguf"), Path::new("/out/a.gguf"));
        assert_eq!(
            spec.args_lossy(),
            vec!["--merge", "/m/a-00001-of-00002.gguf", "/out/a.gguf"]
        );
        assert!(spec.stream_output);
    }

    #[test]
    fn test_disk_space_check_is_advisory() {
        let temp = TempDir::new().unwrap();
        assert!(check_disk_space(temp.path(), 0).is_none());
        assert!(check_disk_space(temp.path(), u64::MAX / 2).is_some());
    }
}
