//! Sharded model detection and validation.
//!
//! Large GGUF models are distributed as several shard files that must be
//! merged before the runtime can load them. Given any one file, this module
//! finds its siblings, orders them by the numeric index in the file name and
//! checks the set for gaps.
//!
//! # Supported Patterns (case-insensitive)
//!
//! 1. **With total count**: `model-00001-of-00005.gguf`
//! 2. **Dash part**: `model-part-1.gguf`
//! 3. **Dot part**: `model.part1.gguf`
//!
//! A file without a shard suffix still belongs to a set when siblings with
//! the same base name carry one (a renamed first shard); it then takes
//! index 1 if no sibling claims it.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::UNIX_EPOCH;
use tracing::debug;

use crate::{Result, ToolfitError};

/// Pattern 1: model-00001-of-00005.gguf
static PATTERN_WITH_TOTAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<base>.+)-(?P<index>\d+)-of-(?P<total>\d+)\.(?P<ext>[^.]+)$").unwrap()
});

/// Pattern 2: model-part-1.gguf
static PATTERN_DASH_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<base>.+)-part-(?P<index>\d+)\.(?P<ext>[^.]+)$").unwrap()
});

/// Pattern 3: model.part1.gguf
static PATTERN_DOT_PART: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(?P<base>.+)\.part(?P<index>\d+)\.(?P<ext>[^.]+)$").unwrap()
});

/// Which naming scheme a shard file follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardFamily {
    WithTotal,
    DashPart,
    DotPart,
}

/// Shard information parsed from a single file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardName {
    pub base: String,
    pub index: usize,
    pub total: Option<usize>,
    pub extension: String,
    pub family: ShardFamily,
}

/// Parse a file name against the shard patterns.
///
/// Returns `None` for names that don't carry a shard suffix.
pub fn parse_shard_name(filename: &str) -> Option<ShardName> {
    let patterns: [(&LazyLock<Regex>, ShardFamily); 3] = [
        (&PATTERN_WITH_TOTAL, ShardFamily::WithTotal),
        (&PATTERN_DASH_PART, ShardFamily::DashPart),
        (&PATTERN_DOT_PART, ShardFamily::DotPart),
    ];

    for (pattern, family) in patterns {
        if let Some(caps) = pattern.captures(filename) {
            let index: usize = caps["index"].parse().ok()?;
            let total = caps
                .name("total")
                .and_then(|m| m.as_str().parse::<usize>().ok());
            return Some(ShardName {
                base: caps["base"].to_string(),
                index,
                total,
                extension: caps["ext"].to_string(),
                family,
            });
        }
    }
    None
}

/// Result of shard completeness validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardValidation {
    /// Whether indices 1..=total are all present
    pub is_complete: bool,
    /// Expected number of shards (declared `-of-N`, else highest index seen)
    pub total_shards: usize,
    /// Indices that were found, ascending
    pub found_shards: Vec<usize>,
    /// Indices that are missing, ascending
    pub missing_shards: Vec<usize>,
    /// Set when the file names disagree about the total or repeat an index
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

/// One member of a shard set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardMember {
    pub path: PathBuf,
    /// 1-based index parsed from the file name.
    pub index: usize,
}

/// An ordered set of sibling shards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSet {
    pub base_name: String,
    pub directory: PathBuf,
    pub extension: String,
    pub family: ShardFamily,
    /// Sorted by numeric index, never by file name.
    pub members: Vec<ShardMember>,
    pub validation: ShardValidation,
}

impl ShardSet {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.validation.is_complete
    }

    /// The shard the merge tool must be pointed at.
    pub fn first_shard(&self) -> Option<&Path> {
        self.members.first().map(|m| m.path.as_path())
    }

    /// Combined on-disk size of all members; unreadable files count as zero.
    pub fn total_size_bytes(&self) -> u64 {
        self.members
            .iter()
            .filter_map(|m| std::fs::metadata(&m.path).ok())
            .map(|meta| meta.len())
            .sum()
    }

    /// Identity of the set's current contents: the first shard's path, then
    /// `index:name:size:mtime` for every member in order.
    ///
    /// Replacing or rewriting any shard changes the signature.
    pub fn signature(&self) -> String {
        let mut signature = self
            .first_shard()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        for member in &self.members {
            let name = member
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (size, modified) = match std::fs::metadata(&member.path) {
                Ok(meta) => {
                    let modified = meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_nanos())
                        .unwrap_or(0);
                    (meta.len(), modified)
                }
                Err(_) => (0, 0),
            };
            signature.push_str(&format!("\n{}:{}:{}:{}", member.index, name, size, modified));
        }
        signature
    }

    /// Fail when indices are missing ([`ToolfitError::IncompleteShardSet`])
    /// or the names contradict each other ([`ToolfitError::InconsistentShardSet`]).
    pub fn ensure_complete(&self) -> Result<()> {
        if self.is_complete() {
            return Ok(());
        }
        if !self.validation.error.is_empty() {
            return Err(ToolfitError::InconsistentShardSet {
                base_name: self.base_name.clone(),
                reason: self.validation.error.clone(),
            });
        }
        Err(ToolfitError::IncompleteShardSet {
            base_name: self.base_name.clone(),
            total: self.validation.total_shards,
            missing: self.validation.missing_shards.clone(),
        })
    }
}

/// Check whether `path` is one shard of a multi-file artifact.
pub fn is_sharded(path: &Path) -> Result<bool> {
    Ok(detect(path)?.is_some())
}

/// Detect the shard set `path` belongs to.
///
/// Returns `Ok(None)` for standalone files. A set with missing indices is
/// still returned; check [`ShardSet::is_complete`] before merging.
pub fn detect(path: &Path) -> Result<Option<ShardSet>> {
    let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
        return Ok(None);
    };
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let own = parse_shard_name(filename);
    let (base, extension) = match &own {
        Some(info) => (info.base.clone(), info.extension.clone()),
        None => match split_extension(filename) {
            Some((stem, ext)) => (stem.to_string(), ext.to_string()),
            None => return Ok(None),
        },
    };

    let siblings = scan_siblings(&directory, &base, &extension)?;
    let family = match &own {
        Some(info) => info.family,
        None => match dominant_family(&siblings) {
            Some(family) => family,
            None => return Ok(None),
        },
    };

    let mut members: Vec<(ShardMember, Option<usize>)> = siblings
        .into_iter()
        .filter(|(_, info)| info.family == family)
        .map(|(path, info)| {
            (
                ShardMember {
                    path,
                    index: info.index,
                },
                info.total,
            )
        })
        .collect();

    if own.is_none() && !members.iter().any(|(m, _)| m.index == 1) && !members.is_empty() {
        debug!(
            "Treating unsuffixed {} as shard 1 of '{}'",
            filename, base
        );
        members.push((
            ShardMember {
                path: path.to_path_buf(),
                index: 1,
            },
            None,
        ));
    }

    if members.len() < 2 {
        return Ok(None);
    }

    members.sort_by(|(a, _), (b, _)| a.index.cmp(&b.index).then_with(|| a.path.cmp(&b.path)));

    let declared_totals: Vec<usize> = members.iter().filter_map(|(_, total)| *total).collect();
    let members: Vec<ShardMember> = members.into_iter().map(|(m, _)| m).collect();
    let validation = validate(&members, &declared_totals);

    debug!(
        "Detected {} shard(s) for '{}' in {} (complete: {})",
        members.len(),
        base,
        directory.display(),
        validation.is_complete
    );

    Ok(Some(ShardSet {
        base_name: base,
        directory,
        extension,
        family,
        members,
        validation,
    }))
}

/// Validate that indices 1..=N are all present.
fn validate(members: &[ShardMember], declared_totals: &[usize]) -> ShardValidation {
    let found: BTreeSet<usize> = members.iter().map(|m| m.index).collect();
    let found_shards: Vec<usize> = found.iter().copied().collect();
    let highest = found_shards.last().copied().unwrap_or(0);

    let duplicated: Vec<usize> = found
        .iter()
        .copied()
        .filter(|i| members.iter().filter(|m| m.index == *i).count() > 1)
        .collect();
    if !duplicated.is_empty() {
        return ShardValidation {
            is_complete: false,
            total_shards: highest,
            found_shards,
            missing_shards: Vec::new(),
            error: format!("Shard index appears more than once: {duplicated:?}"),
        };
    }

    let distinct_totals: BTreeSet<usize> = declared_totals.iter().copied().collect();
    if distinct_totals.len() > 1 {
        return ShardValidation {
            is_complete: false,
            total_shards: distinct_totals.iter().copied().max().unwrap_or(highest),
            found_shards,
            missing_shards: Vec::new(),
            error: "Inconsistent shard counts in filenames".to_string(),
        };
    }

    let total_shards = distinct_totals
        .into_iter()
        .next()
        .unwrap_or(highest)
        .max(highest);
    let missing_shards: Vec<usize> = (1..=total_shards).filter(|i| !found.contains(i)).collect();

    ShardValidation {
        is_complete: missing_shards.is_empty(),
        total_shards,
        found_shards,
        missing_shards,
        error: String::new(),
    }
}

/// Files in `directory` whose shard base and extension match.
fn scan_siblings(
    directory: &Path,
    base: &str,
    extension: &str,
) -> Result<Vec<(PathBuf, ShardName)>> {
    let entries = std::fs::read_dir(directory)
        .map_err(|e| ToolfitError::io("reading shard directory", directory, e))?;

    let mut siblings = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ToolfitError::io("reading shard directory", directory, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(info) = parse_shard_name(name) {
            if info.base.eq_ignore_ascii_case(base)
                && info.extension.eq_ignore_ascii_case(extension)
            {
                siblings.push((path, info));
            }
        }
    }
    Ok(siblings)
}

/// The naming scheme shared by the most siblings.
fn dominant_family(siblings: &[(PathBuf, ShardName)]) -> Option<ShardFamily> {
    [ShardFamily::WithTotal, ShardFamily::DashPart, ShardFamily::DotPart]
        .into_iter()
        .map(|family| {
            let count = siblings.iter().filter(|(_, s)| s.family == family).count();
            (family, count)
        })
        .filter(|(_, count)| *count > 0)
        .fold(None, |best: Option<(ShardFamily, usize)>, candidate| match best {
            Some(b) if b.1 >= candidate.1 => Some(b),
            _ => Some(candidate),
        })
        .map(|(family, _)| family)
}

fn split_extension(filename: &str) -> Option<(&str, &str)> {
    let (stem, ext) = filename.rsplit_once('.')?;
    (!stem.is_empty() && !ext.is_empty()).then_some((stem, ext))
}
