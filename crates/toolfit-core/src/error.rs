//! Error types for toolfit.
//!
//! Every fatal pipeline failure maps to one variant of [`ToolfitError`] with a
//! message that tells the operator what to do next. Non-fatal outcomes are
//! collected as [`Advisory`] values and never abort a run.

use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the toolfit library.
#[derive(Debug, Error)]
pub enum ToolfitError {
    // Source resolution
    #[error(
        "Model source not found: '{reference}' is not a repository reference \
         or an existing path"
    )]
    SourceNotFound { reference: String },

    #[error("Download failed for {repo_id}: {message}")]
    DownloadFailed { repo_id: String, message: String },

    #[error(
        "No .{extension} files found after downloading {repo_id} (pattern '{pattern}'). \
         If this is a gated repo, run 'hf auth login' first"
    )]
    NoArtifactsFound {
        repo_id: String,
        pattern: String,
        extension: String,
    },

    // Sharding and merge
    #[error("Incomplete shard set '{base_name}': missing shard(s) {missing:?} of {total}")]
    IncompleteShardSet {
        base_name: String,
        total: usize,
        missing: Vec<usize>,
    },

    #[error("Shard set '{base_name}' is inconsistent: {reason}")]
    InconsistentShardSet { base_name: String, reason: String },

    #[error(
        "Merge tool '{tool}' not found. \
         Install llama.cpp and add it to PATH, or pass --merge-tool-path"
    )]
    MergeToolNotFound { tool: String },

    #[error("Merge failed (exit {exit_code}): {output}")]
    MergeFailed { exit_code: i32, output: String },

    #[error("Merge tool exited successfully but {0} was not created")]
    MergeOutputMissing(PathBuf),

    // Model runtime
    #[error(
        "Model runtime '{program}' not found on PATH. \
         Install Ollama and make sure it is running"
    )]
    RuntimeNotFound { program: String },

    #[error("Registering model '{model}' failed (exit {exit_code}): {output}")]
    RegistrationFailed {
        model: String,
        exit_code: i32,
        output: String,
    },

    #[error("Unsupported architecture: {name}. Supported: {supported}")]
    UnsupportedArchitecture { name: String, supported: String },

    // Subprocesses
    #[error("Failed to start '{program}': {source}")]
    ProcessSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Cancelled")]
    Cancelled,
}

/// Result type alias for toolfit operations.
pub type Result<T> = std::result::Result<T, ToolfitError>;

impl From<std::io::Error> for ToolfitError {
    fn from(err: std::io::Error) -> Self {
        ToolfitError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ToolfitError {
    fn from(err: serde_json::Error) -> Self {
        ToolfitError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl ToolfitError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        ToolfitError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create an IO error describing the action that failed.
    pub fn io(action: &str, path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        ToolfitError::Io {
            message: format!("{action}: {err}"),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Process exit code for this error.
    ///
    /// - 2: configuration or usage problems
    /// - 130: interrupted by the operator
    /// - 1: everything else
    pub fn exit_code(&self) -> i32 {
        match self {
            ToolfitError::Config { .. } | ToolfitError::UnsupportedArchitecture { .. } => 2,
            ToolfitError::Cancelled => 130,
            _ => 1,
        }
    }
}

/// A non-fatal outcome worth surfacing to the operator.
///
/// Advisories are logged as warnings and returned in the run report; the run
/// still counts as a success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    /// No detection rule matched; the fallback architecture was used.
    ArchitectureUnconfident { fallback: String },
    /// The runtime's model listing did not mention the registered name.
    VerificationInconclusive { model: String },
    /// The smoke-test prompt failed or produced an unusable answer.
    SmokeTestInconclusive { reason: String },
}

impl std::fmt::Display for Advisory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Advisory::ArchitectureUnconfident { fallback } => write!(
                f,
                "architecture could not be detected; using {fallback} \
                 (pass --architecture to override)"
            ),
            Advisory::VerificationInconclusive { model } => write!(
                f,
                "model '{model}' not found in the runtime's model list (this can be transient)"
            ),
            Advisory::SmokeTestInconclusive { reason } => {
                write!(f, "smoke test inconclusive: {reason}")
            }
        }
    }
}
