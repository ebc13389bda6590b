//! Subcommand handlers.

use anyhow::Result;
use std::sync::Arc;
use toolfit_core::{
    format_bytes, CacheArea, CacheStore, Orchestrator, ResolvedSettings, RunParameters, RunReport,
    TokioProcessRunner,
};
use tracing::info;

use crate::{ClearArgs, SetupArgs};

pub async fn setup(settings: ResolvedSettings, args: SetupArgs) -> Result<()> {
    info!("Config: {}", settings.config_path.display());
    let orchestrator = Orchestrator::new(settings, Arc::new(TokioProcessRunner));

    let mut params = RunParameters::new(args.source);
    params.model_name = args.name;
    params.architecture = args.architecture.fixed();
    params.context_length = args.context_length;
    params.temperature = args.temperature;
    params.quant_filter = args.quant;
    params.merge_tool_path = args.merge_tool_path;
    params.keep_artifacts = args.keep_artifacts;
    params.skip_smoke_test = args.skip_smoke_test;

    let report = orchestrator.run_until(&params, interrupted()).await?;
    print_report(&report);
    Ok(())
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn interrupted() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn print_report(report: &RunReport) {
    println!();
    println!("Model '{}' is ready for tool calling", report.model_name);
    println!("  Architecture: {}", report.architecture);
    println!(
        "  Artifact:     {} ({})",
        report.artifact.path.display(),
        format_bytes(report.artifact.size_bytes)
    );
    if report.cache_hit {
        println!("  Cache:        hit");
    }
    if let Some(dir) = &report.work_dir {
        println!("  Work dir:     {}", dir.display());
    }
    for advisory in &report.advisories {
        println!("  Note:         {}", advisory);
    }
    println!();
    println!("Use it with: ollama run {}", report.model_name);
}

pub fn cache_info(settings: &ResolvedSettings) -> Result<()> {
    let info = CacheStore::new(&settings.cache_root).info();

    println!("Cache root: {}", info.root.display());
    for area in &info.areas {
        println!(
            "  {:<10} {:>10}  {}",
            area.area,
            format_bytes(area.size_bytes),
            area.path.display()
        );
    }
    println!("  {:<10} {:>10}", "total", format_bytes(info.total_bytes()));
    println!(
        "Index: {} entries ({})",
        info.entry_count,
        format_bytes(info.entries_size_bytes)
    );
    Ok(())
}

/// Areas named on the command line, or all of them.
pub fn selected_areas(args: &ClearArgs) -> Vec<CacheArea> {
    let named: Vec<CacheArea> = [
        (args.downloads, CacheArea::Downloads),
        (args.merged, CacheArea::Merged),
        (args.work, CacheArea::Work),
    ]
    .into_iter()
    .filter_map(|(on, area)| on.then_some(area))
    .collect();

    if args.all || named.is_empty() {
        CacheArea::ALL.to_vec()
    } else {
        named
    }
}

pub fn cache_clear(settings: &ResolvedSettings, args: &ClearArgs) -> Result<()> {
    let areas = selected_areas(args);
    let summary = CacheStore::new(&settings.cache_root).clear(&areas)?;

    let names: Vec<String> = areas.iter().map(ToString::to_string).collect();
    println!(
        "Cleared {} ({} index entries, {} freed)",
        names.join(", "),
        summary.entries_removed,
        format_bytes(summary.bytes_freed)
    );
    Ok(())
}
