//! Ollama model naming helpers.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::ModelConfig;

static SHARD_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)-\d+-of-\d+$|-part-?\d+$|\.part\d+$").unwrap());

/// Normalise a user-supplied name into an Ollama-friendly model name.
///
/// Lowercases, replaces anything outside `[a-z0-9._-]` with hyphens,
/// and collapses consecutive hyphens.
pub fn sanitize_model_name(name: &str) -> String {
    let name: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    let mut result = String::with_capacity(name.len());
    let mut last_was_hyphen = false;
    for c in name.chars() {
        if c == '-' {
            if !last_was_hyphen && !result.is_empty() {
                result.push('-');
            }
            last_was_hyphen = true;
        } else {
            result.push(c);
            last_was_hyphen = false;
        }
    }

    result.trim_end_matches('-').to_string()
}

/// Derive a model name from an artifact file name.
///
/// The extension and any shard suffix are removed before sanitising; an
/// empty result falls back to [`ModelConfig::FALLBACK_MODEL_NAME`].
pub fn derive_model_name(artifact: &Path) -> String {
    let stem = artifact
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = SHARD_SUFFIX.replace(&stem, "");

    let name = sanitize_model_name(&stem);
    if name.is_empty() {
        ModelConfig::FALLBACK_MODEL_NAME.to_string()
    } else {
        name
    }
}
