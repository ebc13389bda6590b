//! Modelfile composition.
//!
//! Combines a resolved artifact path, an architecture and the run parameters
//! into the text document handed to `ollama create`. Composition is pure: the
//! generation timestamp in the header is the only input that varies between
//! otherwise identical calls, and [`compose_at`] takes it explicitly.

use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt::Write as _;
use std::path::Path;

use crate::architecture::Architecture;
use crate::template::{template_for, CATALOG_VERSION};

/// System preamble used for every model unless a compatibility profile
/// replaces it.
pub const DEFAULT_SYSTEM_MESSAGE: &str =
    "You are a helpful AI assistant with tool calling capabilities. \
     You can help with code, answer questions, and use tools when needed.";

/// Stricter preamble for Nemotron models, which tend to print tool-call
/// markup as plain text.
pub const NEMOTRON_SYSTEM_MESSAGE: &str =
    "You are a helpful AI assistant with tool calling capabilities. \
     Use tools when needed. Do not emit tool-call markup as plain text. \
     When calling a tool, use the tool calling mechanism only.";

/// Turn markers Nemotron GGUFs leak into their output.
pub const NEMOTRON_EXTRA_STOPS: &[&str] = &["<|start_of_turn|>", "<|end_of_turn|>"];

/// Numeric and textual parameters of one Modelfile.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelfileParams {
    /// `None` leaves the context window to the runtime default.
    pub context_length: Option<u32>,
    pub temperature: f64,
    /// Appended after the template's own stop sequences.
    pub extra_stops: Vec<String>,
    pub system_message: String,
}

impl ModelfileParams {
    pub fn new(context_length: Option<u32>, temperature: f64) -> Self {
        Self {
            context_length,
            temperature,
            extra_stops: Vec::new(),
            system_message: DEFAULT_SYSTEM_MESSAGE.to_string(),
        }
    }

    /// Apply model-specific compatibility tweaks based on a free-form hint
    /// (repository id and artifact file name).
    pub fn with_compatibility_for(mut self, source_hint: &str) -> Self {
        if needs_nemotron_tweaks(source_hint) {
            for stop in NEMOTRON_EXTRA_STOPS {
                if !self.extra_stops.iter().any(|s| s == stop) {
                    self.extra_stops.push((*stop).to_string());
                }
            }
            self.system_message = NEMOTRON_SYSTEM_MESSAGE.to_string();
        }
        self
    }
}

/// Whether the hint names a Nemotron model.
pub fn needs_nemotron_tweaks(source_hint: &str) -> bool {
    source_hint.to_lowercase().contains("nemotron")
}

/// Compose the Modelfile text with the current time in the header.
pub fn compose(model_path: &Path, architecture: Architecture, params: &ModelfileParams) -> String {
    compose_at(model_path, architecture, params, Utc::now())
}

/// Compose the Modelfile text with an explicit generation time.
///
/// `model_path` is written verbatim and should be absolute.
pub fn compose_at(
    model_path: &Path,
    architecture: Architecture,
    params: &ModelfileParams,
    generated_at: DateTime<Utc>,
) -> String {
    let template = template_for(architecture);
    let mut out = String::new();

    // Writing into a String cannot fail.
    let _ = writeln!(out, "# Auto-generated Modelfile with tool calling support");
    let _ = writeln!(out, "# Architecture: {architecture}");
    let _ = writeln!(out, "# Template catalog: v{CATALOG_VERSION}");
    let _ = writeln!(
        out,
        "# Generated: {}",
        generated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    );
    out.push('\n');

    let _ = writeln!(out, "FROM {}", model_path.display());
    out.push('\n');

    let _ = writeln!(out, "TEMPLATE \"\"\"{}\"\"\"", template.body);
    out.push('\n');

    let stops = template
        .stop_sequences
        .iter()
        .copied()
        .chain(params.extra_stops.iter().map(String::as_str));
    for stop in stops {
        let _ = writeln!(out, "PARAMETER stop \"{}\"", escape_quoted(stop));
    }
    out.push('\n');

    let _ = writeln!(out, "PARAMETER temperature {}", params.temperature);
    if let Some(context_length) = params.context_length {
        let _ = writeln!(out, "PARAMETER num_ctx {context_length}");
    }
    let _ = writeln!(out, "PARAMETER num_predict -1");
    out.push('\n');

    let _ = writeln!(out, "SYSTEM \"\"\"{}\"\"\"", params.system_message);
    out
}

fn escape_quoted(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
