//! Model source classification.
//!
//! Turns the single user-supplied reference into a [`ModelSource`]. Remote
//! forms are matched by an ordered rule table; the first rule that matches
//! wins. Only when no remote rule matches is the reference checked against
//! the filesystem. No network access happens here.
//!
//! # Rule order
//!
//! 1. Hub URL: `https://huggingface.co/<owner>/<repo>[:QUANT][/...]`
//! 2. Host shorthand: `hf.co/<owner>/<repo>[:QUANT][/...]`
//! 3. Bare repo id: `<owner>/<repo>[:QUANT]`
//! 4. Existing local path
//!
//! A pasted runtime command (`ollama run <ref>` / `ollama pull <ref>`) is
//! unwrapped first, and only the first whitespace-separated token is used.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;
use url::Url;

use crate::{Result, ToolfitError};

/// Where the model comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Local,
    Remote,
}

/// A classified model reference. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSource {
    pub kind: SourceKind,
    /// The token that was classified (after unwrapping a pasted command).
    pub raw: String,
    /// `owner/repo` for remote sources.
    pub repo_id: Option<String>,
    /// Quantization filter embedded as a `:QUANT` suffix.
    pub quant_filter: Option<String>,
}

impl ModelSource {
    /// Local path of a [`SourceKind::Local`] source.
    pub fn local_path(&self) -> Option<PathBuf> {
        match self.kind {
            SourceKind::Local => Some(PathBuf::from(&self.raw)),
            SourceKind::Remote => None,
        }
    }

    /// Quant filter to apply: the embedded suffix wins over a separately
    /// supplied one.
    pub fn effective_quant(&self, supplied: Option<&str>) -> Option<String> {
        self.quant_filter
            .clone()
            .or_else(|| supplied.map(str::trim).filter(|q| !q.is_empty()).map(String::from))
    }
}

/// A remote match produced by one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RemoteRef {
    repo_id: String,
    quant_filter: Option<String>,
}

/// One entry of the classification table.
struct SourceRule {
    name: &'static str,
    matcher: fn(&str) -> Option<RemoteRef>,
}

/// Remote rules in priority order.
static SOURCE_RULES: &[SourceRule] = &[
    SourceRule {
        name: "hub-url",
        matcher: match_hub_url,
    },
    SourceRule {
        name: "hub-shorthand",
        matcher: match_hub_shorthand,
    },
    SourceRule {
        name: "owner-repo",
        matcher: match_owner_repo,
    },
];

static PASTED_COMMAND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*ollama\s+(?:run|pull)\s+(?P<rest>.+)$").unwrap());

static HUB_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^https?://(?:hf\.co|huggingface\.co)/").unwrap());

static HUB_SHORTHAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)^(?:hf\.co|huggingface\.co)/(?P<owner>[^/\s:]+)/(?P<repo>[^/\s:]+)",
        r"(?::(?P<quant>[^/\s]*))?(?:/\S*)?$",
    ))
    .unwrap()
});

static OWNER_REPO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<owner>[^/\\\s:]+)/(?P<repo>[^/\\\s:]+)(?::(?P<quant>[^/\\\s]*))?$").unwrap()
});

/// Classify a raw model reference.
pub fn classify(raw: &str) -> Result<ModelSource> {
    let token = primary_token(raw).ok_or_else(|| ToolfitError::SourceNotFound {
        reference: raw.to_string(),
    })?;

    for rule in SOURCE_RULES {
        if let Some(remote) = (rule.matcher)(&token) {
            debug!("Source '{}' matched rule {}", token, rule.name);
            return Ok(ModelSource {
                kind: SourceKind::Remote,
                raw: token,
                repo_id: Some(remote.repo_id),
                quant_filter: remote.quant_filter,
            });
        }
    }

    if Path::new(&token).exists() {
        debug!("Source '{}' is a local path", token);
        return Ok(ModelSource {
            kind: SourceKind::Local,
            raw: token,
            repo_id: None,
            quant_filter: None,
        });
    }

    Err(ToolfitError::SourceNotFound { reference: token })
}

/// Unwrap a pasted runtime command and keep the first token.
fn primary_token(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let rest = PASTED_COMMAND
        .captures(trimmed)
        .and_then(|caps| caps.name("rest"))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);
    rest.split_whitespace().next().map(String::from)
}

/// Split `repo:QUANT` into name and optional non-empty suffix.
fn split_quant(segment: &str) -> (&str, Option<String>) {
    match segment.split_once(':') {
        Some((name, suffix)) => {
            let suffix = suffix.trim();
            (name.trim(), (!suffix.is_empty()).then(|| suffix.to_string()))
        }
        None => (segment, None),
    }
}

fn match_hub_url(token: &str) -> Option<RemoteRef> {
    if !HUB_URL.is_match(token) {
        return None;
    }
    let url = Url::parse(token).ok()?;
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty());
    let owner = segments.next()?;
    let repo_segment = segments.next()?;
    let (repo, quant_filter) = split_quant(repo_segment);
    if repo.is_empty() {
        return None;
    }
    Some(RemoteRef {
        repo_id: format!("{owner}/{repo}"),
        quant_filter,
    })
}

fn match_hub_shorthand(token: &str) -> Option<RemoteRef> {
    let caps = HUB_SHORTHAND.captures(token)?;
    let quant_filter = caps
        .name("quant")
        .map(|m| m.as_str().trim())
        .filter(|q| !q.is_empty())
        .map(String::from);
    Some(RemoteRef {
        repo_id: format!("{}/{}", &caps["owner"], &caps["repo"]),
        quant_filter,
    })
}

fn match_owner_repo(token: &str) -> Option<RemoteRef> {
    let caps = OWNER_REPO.captures(token)?;
    let owner = &caps["owner"];
    let repo = &caps["repo"];

    // Relative paths such as `./model.gguf` or `models/x.gguf` share the
    // owner/repo shape; repo ids never carry a model file extension.
    if matches!(owner, "." | ".." | "~") || repo.to_ascii_lowercase().ends_with(".gguf") {
        return None;
    }

    let quant_filter = caps
        .name("quant")
        .map(|m| m.as_str().trim())
        .filter(|q| !q.is_empty())
        .map(String::from);
    Some(RemoteRef {
        repo_id: format!("{owner}/{repo}"),
        quant_filter,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_bare_repo_id() {
        let source = classify("unsloth/Llama-3.2-3B-Instruct-GGUF").unwrap();
        assert_eq!(source.kind, SourceKind::Remote);
        assert_eq!(
            source.repo_id.as_deref(),
            Some("unsloth/Llama-3.2-3B-Instruct-GGUF")
        );
        assert_eq!(source.quant_filter, None);
    }

    #[test]
    fn test_shorthand_with_quant() {
        let source = classify("hf.co/unsloth/Nemotron-3-Nano-30B-A3B-GGUF:Q4_0").unwrap();
        assert_eq!(source.kind, SourceKind::Remote);
        assert_eq!(
            source.repo_id.as_deref(),
            Some("unsloth/Nemotron-3-Nano-30B-A3B-GGUF")
        );
        assert_eq!(source.quant_filter.as_deref(), Some("Q4_0"));
    }

    #[test]
    fn test_shorthand_with_extra_segments() {
        let source =
            classify("huggingface.co/bartowski/Qwen2.5-7B-Instruct-GGUF/tree/main").unwrap();
        assert_eq!(source.kind, SourceKind::Remote);
        assert_eq!(
            source.repo_id.as_deref(),
            Some("bartowski/Qwen2.5-7B-Instruct-GGUF")
        );
        assert_eq!(source.quant_filter, None);

        let source = classify("hf.co/bartowski/Qwen2.5-7B-Instruct-GGUF:Q6_K/").unwrap();
        assert_eq!(source.quant_filter.as_deref(), Some("Q6_K"));
    }

    #[test]
    fn test_full_url() {
        let url = "https://huggingface.co/bartowski/Qwen2.5-7B-Instruct-GGUF/tree/main";
        let source = classify(url).unwrap();
        assert_eq!(
            source.repo_id.as_deref(),
            Some("bartowski/Qwen2.5-7B-Instruct-GGUF")
        );
        assert_eq!(source.quant_filter, None);

        let source = classify("https://hf.co/owner/repo:Q8_0").unwrap();
        assert_eq!(source.repo_id.as_deref(), Some("owner/repo"));
        assert_eq!(source.quant_filter.as_deref(), Some("Q8_0"));
    }

    #[test]
    fn test_pasted_command_is_unwrapped() {
        let source = classify("ollama run hf.co/owner/repo:IQ2_XXS --verbose").unwrap();
        assert_eq!(source.raw, "hf.co/owner/repo:IQ2_XXS");
        assert_eq!(source.repo_id.as_deref(), Some("owner/repo"));
        assert_eq!(source.quant_filter.as_deref(), Some("IQ2_XXS"));
    }

    #[test]
    fn test_empty_suffix_is_no_filter() {
        let source = classify("hf.co/owner/repo:").unwrap();
        assert_eq!(source.quant_filter, None);
    }

    #[test]
    fn test_embedded_quant_wins() {
        let source = classify("owner/repo:Q4_K_M").unwrap();
        assert_eq!(source.effective_quant(Some("Q8_0")).as_deref(), Some("Q4_K_M"));

        let source = classify("owner/repo").unwrap();
        assert_eq!(source.effective_quant(Some("Q8_0")).as_deref(), Some("Q8_0"));
        assert_eq!(source.effective_quant(Some("  ")), None);
    }

    #[test]
    fn test_local_path() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("model.gguf");
        std::fs::write(&file, b"GGUF").unwrap();

        let source = classify(file.to_str().unwrap()).unwrap();
        assert_eq!(source.kind, SourceKind::Local);
        assert_eq!(source.local_path(), Some(file));
        assert!(source.repo_id.is_none());
    }

    #[test]
    fn test_relative_model_file_is_not_a_repo() {
        let result = classify("models/does-not-exist.gguf");
        assert!(matches!(result, Err(ToolfitError::SourceNotFound { .. })));

        let result = classify("./missing");
        assert!(matches!(result, Err(ToolfitError::SourceNotFound { .. })));
    }

    #[test]
    fn test_missing_source() {
        assert!(matches!(
            classify("/no/such/dir/model.gguf"),
            Err(ToolfitError::SourceNotFound { .. })
        ));
        assert!(matches!(
            classify("   "),
            Err(ToolfitError::SourceNotFound { .. })
        ));
    }
}
