//! Toolfit Core - Headless library that turns a model reference into a
//! tool-capable Ollama model.
//!
//! A reference (local GGUF, one shard of a split GGUF, hub repository id or
//! URL) is classified, downloaded if remote, merged if sharded, matched to a
//! chat-template family and registered with a generated Modelfile. Downloads
//! and merges are cached so repeated runs are cheap.
//!
//! External tools (`hf`, `llama-gguf-split`, `ollama`) are driven through the
//! [`ProcessRunner`] trait and never through a shell.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use toolfit_core::{load_settings, Orchestrator, RunParameters, TokioProcessRunner};
//!
//! #[tokio::main]
//! async fn main() -> toolfit_core::Result<()> {
//!     let settings = load_settings(None, None)?;
//!     let orchestrator = Orchestrator::new(settings, Arc::new(TokioProcessRunner));
//!
//!     let mut params = RunParameters::new("hf.co/unsloth/Nemotron-3-Nano-30B-A3B-GGUF:Q4_0");
//!     params.context_length = Some(32768);
//!     let report = orchestrator.run(&params).await?;
//!     println!("Registered {}", report.model_name);
//!     Ok(())
//! }
//! ```

pub mod architecture;
pub mod cache;
pub mod config;
pub mod download;
pub mod error;
pub mod merge;
pub mod modelfile;
pub mod naming;
pub mod pipeline;
pub mod process;
pub mod runtime;
pub mod shard;
pub mod source;
pub mod template;

mod persist;

// Re-export commonly used types
pub use architecture::{Architecture, ArchitectureDetection, DetectionSource};
pub use cache::{
    format_bytes, CacheArea, CacheEntry, CacheInfo, CacheStore, ClearSummary, ResolvedArtifact,
};
pub use config::{load_settings, ResolvedSettings, Settings};
pub use error::{Advisory, Result, ToolfitError};
pub use modelfile::ModelfileParams;
pub use pipeline::{Orchestrator, RunParameters, RunReport, Stage};
pub use process::{CommandSpec, ProcessOutput, ProcessRunner, TokioProcessRunner};
pub use shard::{ShardSet, ShardValidation};
pub use source::{ModelSource, SourceKind};
pub use template::{ModelTemplate, TemplateShape};
