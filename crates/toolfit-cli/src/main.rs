//! Toolfit - turn a model reference into a tool-capable Ollama model.
//!
//! Thin command-line front end over `toolfit-core`.

mod commands;

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use toolfit_core::{Architecture, ToolfitError};
use tracing::Level;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "toolfit", version)]
#[command(about = "Set up GGUF models as tool-capable Ollama models")]
struct Cli {
    /// Config file (defaults to $TOOLFIT_CONFIG or the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache root, overriding the config file
    #[arg(long, global = true)]
    cache_root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve, merge if needed, and register a model
    Setup(SetupArgs),

    /// Inspect or clear the download and merge cache
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Args, Debug)]
struct SetupArgs {
    /// Local GGUF file or shard, hub repo id (owner/repo[:QUANT]) or hub URL
    source: String,

    /// Name to register the model under
    #[arg(short, long)]
    name: Option<String>,

    /// Chat template family
    #[arg(short, long, value_enum, default_value_t = ArchitectureArg::Auto)]
    architecture: ArchitectureArg,

    /// Context window (num_ctx); the runtime default applies when omitted
    #[arg(short = 'c', long)]
    context_length: Option<u32>,

    /// Sampling temperature
    #[arg(short, long, default_value_t = toolfit_core::config::ModelConfig::DEFAULT_TEMPERATURE)]
    temperature: f64,

    /// Quantization to download (e.g. Q4_K_M); a :QUANT suffix on the source wins
    #[arg(short, long)]
    quant: Option<String>,

    /// Path to llama-gguf-split or the directory containing it
    #[arg(long)]
    merge_tool_path: Option<PathBuf>,

    /// Keep the per-run working directory
    #[arg(long)]
    keep_artifacts: bool,

    /// Skip the final test prompt
    #[arg(long)]
    skip_smoke_test: bool,
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
    /// Show cache location and sizes
    Info,

    /// Remove cached files
    Clear(ClearArgs),
}

#[derive(Args, Debug)]
struct ClearArgs {
    #[arg(long)]
    downloads: bool,

    #[arg(long)]
    merged: bool,

    #[arg(long)]
    work: bool,

    /// Clear every area (the default when no area is named)
    #[arg(long)]
    all: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ArchitectureArg {
    Auto,
    Llama3,
    Mistral,
    Phi3,
    Gemma2,
    Qwen,
}

impl ArchitectureArg {
    fn fixed(self) -> Option<Architecture> {
        match self {
            ArchitectureArg::Auto => None,
            ArchitectureArg::Llama3 => Some(Architecture::Llama3),
            ArchitectureArg::Mistral => Some(Architecture::Mistral),
            ArchitectureArg::Phi3 => Some(Architecture::Phi3),
            ArchitectureArg::Gemma2 => Some(Architecture::Gemma2),
            ArchitectureArg::Qwen => Some(Architecture::Qwen),
        }
    }
}

fn init_logging(debug: bool) {
    let builder = FmtSubscriber::builder()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .compact();

    // RUST_LOG takes precedence over --debug.
    match EnvFilter::try_from_default_env() {
        Ok(filter) => builder.with_env_filter(filter).init(),
        Err(_) => {
            let level = if debug { Level::DEBUG } else { Level::INFO };
            builder.with_max_level(level).init()
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let loaded = toolfit_core::load_settings(cli.config.as_deref(), cli.cache_root.as_deref());
    let settings = match loaded {
        Ok(settings) => settings,
        Err(e) => return fail(&anyhow::Error::from(e)),
    };

    let result = match cli.command {
        Command::Setup(args) => commands::setup(settings, args).await,
        Command::Cache(CacheCommand::Info) => commands::cache_info(&settings),
        Command::Cache(CacheCommand::Clear(args)) => commands::cache_clear(&settings, &args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => fail(&e),
    }
}

fn fail(err: &anyhow::Error) -> ExitCode {
    eprintln!("Error: {err:#}");
    ExitCode::from(exit_code_for(err))
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<ToolfitError>()
        .map(ToolfitError::exit_code)
        .and_then(|code| u8::try_from(code).ok())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setup() {
        let cli = Cli::try_parse_from([
            "toolfit",
            "setup",
            "unsloth/Qwen2.5-Coder-7B-Instruct-GGUF",
            "--quant",
            "Q4_K_M",
            "-a",
            "qwen",
            "--context-length",
            "32768",
            "--skip-smoke-test",
        ])
        .unwrap();

        let Command::Setup(args) = cli.command else {
            panic!("expected setup");
        };
        assert_eq!(args.architecture.fixed(), Some(Architecture::Qwen));
        assert_eq!(args.context_length, Some(32768));
        assert_eq!(args.quant.as_deref(), Some("Q4_K_M"));
        assert_eq!(args.temperature, 0.7);
        assert!(args.skip_smoke_test);
        assert!(!args.keep_artifacts);
    }

    #[test]
    fn test_parse_defaults_to_auto() {
        let cli = Cli::try_parse_from(["toolfit", "--debug", "setup", "./model.gguf"]).unwrap();
        assert!(cli.debug);
        let Command::Setup(args) = cli.command else {
            panic!("expected setup");
        };
        assert_eq!(args.architecture, ArchitectureArg::Auto);
        assert_eq!(args.architecture.fixed(), None);
    }

    #[test]
    fn test_rejects_unknown_architecture() {
        assert!(Cli::try_parse_from(["toolfit", "setup", "x.gguf", "-a", "falcon"]).is_err());
    }

    #[test]
    fn test_parse_cache_clear() {
        let cli = Cli::try_parse_from([
            "toolfit",
            "cache",
            "clear",
            "--merged",
            "--cache-root",
            "/tmp/c",
        ])
        .unwrap();
        assert_eq!(cli.cache_root, Some(PathBuf::from("/tmp/c")));
        let Command::Cache(CacheCommand::Clear(args)) = cli.command else {
            panic!("expected cache clear");
        };
        assert!(args.merged && !args.downloads && !args.work && !args.all);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&ToolfitError::Cancelled.into()), 130);
        let config = ToolfitError::Config {
            message: "bad".to_string(),
        };
        assert_eq!(exit_code_for(&config.into()), 2);
        assert_eq!(exit_code_for(&anyhow::anyhow!("boom")), 1);
    }
}
