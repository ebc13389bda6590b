//! Chat-template family detection.
//!
//! Two ordered rule tables are evaluated, first match wins:
//!
//! 1. **Content**: the first [`ModelConfig::SNIFF_BYTES`] of the file, ASCII
//!    bytes only, lower-cased. GGUF headers carry `general.architecture` and
//!    `general.name`, which is usually enough.
//! 2. **File name**: the same family names against the lower-cased file
//!    name. Nemotron files use the llama3 tool grammar.
//!
//! When neither table matches the result is [`Architecture::FALLBACK`] with
//! [`DetectionSource::Fallback`]; detection itself never fails.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::debug;

use crate::config::ModelConfig;
use crate::ToolfitError;

/// Supported chat-template families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Llama3,
    Mistral,
    Phi3,
    Gemma2,
    Qwen,
}

impl Architecture {
    /// Every supported architecture, in catalog order.
    pub const ALL: [Architecture; 5] = [
        Architecture::Gemma2,
        Architecture::Llama3,
        Architecture::Mistral,
        Architecture::Phi3,
        Architecture::Qwen,
    ];

    /// Used when no detection rule matches.
    pub const FALLBACK: Architecture = Architecture::Llama3;

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Llama3 => "llama3",
            Architecture::Mistral => "mistral",
            Architecture::Phi3 => "phi3",
            Architecture::Gemma2 => "gemma2",
            Architecture::Qwen => "qwen",
        }
    }

    /// Comma-separated list of supported names.
    pub fn supported_names() -> String {
        Self::ALL
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl FromStr for Architecture {
    type Err = ToolfitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ToolfitError::UnsupportedArchitecture {
                name: s.to_string(),
                supported: Self::supported_names(),
            })
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which tier produced a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSource {
    Content,
    Filename,
    Fallback,
}

/// Outcome of architecture detection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchitectureDetection {
    pub architecture: Architecture,
    pub source: DetectionSource,
    /// Name of the rule that matched (`"fallback"` when none did).
    pub rule: &'static str,
}

impl ArchitectureDetection {
    /// False when the fallback was used.
    pub fn is_confident(&self) -> bool {
        self.source != DetectionSource::Fallback
    }
}

/// One ordered detection rule.
pub struct ArchitectureRule {
    pub name: &'static str,
    pub pattern: Regex,
    pub architecture: Architecture,
}

impl ArchitectureRule {
    fn new(name: &'static str, pattern: &str, architecture: Architecture) -> Self {
        Self {
            name,
            pattern: Regex::new(pattern).unwrap(),
            architecture,
        }
    }
}

/// Content rules, highest priority first. Bare family names come last so
/// version-specific rules get the first chance.
pub static CONTENT_RULES: LazyLock<Vec<ArchitectureRule>> = LazyLock::new(|| {
    vec![
        ArchitectureRule::new(
            "llama3-versioned",
            r"llama.*3\.[0-9]|llama3|llama-3",
            Architecture::Llama3,
        ),
        ArchitectureRule::new("mistral-family", r"mistral|mixtral", Architecture::Mistral),
        ArchitectureRule::new("phi-versioned", r"phi-3|phi3|phi-4|phi4", Architecture::Phi3),
        ArchitectureRule::new("gemma2-versioned", r"gemma.*2|gemma-2", Architecture::Gemma2),
        ArchitectureRule::new("qwen-versioned", r"qwen.*2|qwen-2", Architecture::Qwen),
        ArchitectureRule::new("llama-name", r"llama", Architecture::Llama3),
        ArchitectureRule::new("gemma-name", r"gemma", Architecture::Gemma2),
        ArchitectureRule::new("qwen-name", r"qwen", Architecture::Qwen),
    ]
});

/// File name rules, highest priority first.
pub static FILENAME_RULES: LazyLock<Vec<ArchitectureRule>> = LazyLock::new(|| {
    vec![
        ArchitectureRule::new("nemotron-alias", r"nemotron", Architecture::Llama3),
        ArchitectureRule::new("llama3-name", r"llama.*3", Architecture::Llama3),
        ArchitectureRule::new("mistral-name", r"mistral|mixtral", Architecture::Mistral),
        ArchitectureRule::new("phi-name", r"phi", Architecture::Phi3),
        ArchitectureRule::new("gemma-name", r"gemma", Architecture::Gemma2),
        ArchitectureRule::new("qwen-name", r"qwen", Architecture::Qwen),
    ]
});

fn lookup(rules: &[ArchitectureRule], text: &str) -> Option<(Architecture, &'static str)> {
    rules
        .iter()
        .find(|rule| rule.pattern.is_match(text))
        .map(|rule| (rule.architecture, rule.name))
}

/// Keep ASCII bytes, drop everything else, lower-case.
fn sniff_text(prefix: &[u8]) -> String {
    prefix
        .iter()
        .filter(|b| b.is_ascii())
        .map(|b| (*b as char).to_ascii_lowercase())
        .collect()
}

/// Detect from an in-memory prefix and file name.
pub fn detect_from(prefix: &[u8], filename: &str) -> ArchitectureDetection {
    let content = sniff_text(prefix);
    if let Some((architecture, rule)) = lookup(&CONTENT_RULES, &content) {
        return ArchitectureDetection {
            architecture,
            source: DetectionSource::Content,
            rule,
        };
    }

    if let Some((architecture, rule)) = lookup(&FILENAME_RULES, &filename.to_lowercase()) {
        return ArchitectureDetection {
            architecture,
            source: DetectionSource::Filename,
            rule,
        };
    }

    ArchitectureDetection {
        architecture: Architecture::FALLBACK,
        source: DetectionSource::Fallback,
        rule: "fallback",
    }
}

/// Detect the architecture of the model file at `path`.
///
/// An unreadable file is treated as empty content.
pub fn detect(path: &Path) -> ArchitectureDetection {
    let prefix = read_prefix(path, ModelConfig::SNIFF_BYTES).unwrap_or_else(|e| {
        debug!("Could not read {} for sniffing: {}", path.display(), e);
        Vec::new()
    });
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let detection = detect_from(&prefix, &filename);
    debug!(
        "Architecture of {}: {} via {:?} rule '{}'",
        path.display(),
        detection.architecture,
        detection.source,
        detection.rule
    );
    detection
}

fn read_prefix(path: &Path, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(limit);
    File::open(path)?
        .take(limit as u64)
        .read_to_end(&mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn gguf_like(name_fragment: &str) -> Vec<u8> {
        let mut bytes = b"GGUF\x03\x00\x00\x00\x00\x01\xff\xfe".to_vec();
        bytes.extend_from_slice(b"general.architecture\x00\x08");
        bytes.extend_from_slice(name_fragment.as_bytes());
        bytes.extend_from_slice(&[0x00, 0x9f, 0x92, 0x96]);
        bytes
    }

    #[test]
    fn test_gemma2_from_content_regardless_of_name() {
        let detection = detect_from(&gguf_like("gemma-2"), "llama-3-8b.gguf");
        assert_eq!(detection.architecture, Architecture::Gemma2);
        assert_eq!(detection.source, DetectionSource::Content);
    }

    #[test]
    fn test_content_rule_order() {
        assert_eq!(
            detect_from(b"Meta-Llama-3.1-8B", "x.gguf").architecture,
            Architecture::Llama3
        );
        assert_eq!(
            detect_from(b"mixtral-8x7b", "x.gguf").architecture,
            Architecture::Mistral
        );
        assert_eq!(
            detect_from(b"phi-4-mini", "x.gguf").architecture,
            Architecture::Phi3
        );
        assert_eq!(
            detect_from(b"qwen2.5-coder", "x.gguf").architecture,
            Architecture::Qwen
        );
    }

    #[test]
    fn test_generic_family_name_is_lowest_priority() {
        let detection = detect_from(b"general.architecture=llama", "x.gguf");
        assert_eq!(detection.architecture, Architecture::Llama3);
        assert_eq!(detection.rule, "llama-name");

        let detection = detect_from(b"arch=gemma", "x.gguf");
        assert_eq!(detection.architecture, Architecture::Gemma2);
        assert_eq!(detection.rule, "gemma-name");
    }

    #[test]
    fn test_filename_tier() {
        let detection = detect_from(b"\x00\x01\x02", "Nemotron-3-Nano-30B-A3B-Q4_0.gguf");
        assert_eq!(detection.architecture, Architecture::Llama3);
        assert_eq!(detection.source, DetectionSource::Filename);
        assert_eq!(detection.rule, "nemotron-alias");

        assert_eq!(
            detect_from(b"", "Phi-3.5-mini.gguf").architecture,
            Architecture::Phi3
        );
    }

    #[test]
    fn test_fallback_is_unconfident() {
        let detection = detect_from(b"", "mystery.gguf");
        assert_eq!(detection.architecture, Architecture::FALLBACK);
        assert!(!detection.is_confident());
    }

    #[test]
    fn test_empty_and_missing_files() {
        let temp = TempDir::new().unwrap();
        let empty = temp.path().join("empty.gguf");
        std::fs::write(&empty, b"").unwrap();

        let detection = detect(&empty);
        assert!(Architecture::ALL.contains(&detection.architecture));

        let detection = detect(&temp.path().join("absent.gguf"));
        assert_eq!(detection.architecture, Architecture::FALLBACK);
    }

    #[test]
    fn test_only_prefix_is_read() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("model.gguf");
        let mut bytes = vec![0u8; ModelConfig::SNIFF_BYTES];
        bytes.extend_from_slice(b"mistral");
        std::fs::write(&path, bytes).unwrap();

        assert_eq!(detect(&path).source, DetectionSource::Fallback);
    }

    #[test]
    fn test_from_str() {
        assert_eq!("QWEN".parse::<Architecture>().unwrap(), Architecture::Qwen);
        assert!(matches!(
            "falcon".parse::<Architecture>(),
            Err(ToolfitError::UnsupportedArchitecture { .. })
        ));
        for arch in Architecture::ALL {
            assert_eq!(arch.as_str().parse::<Architecture>().unwrap(), arch);
        }
    }
}
