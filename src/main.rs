use anyhow::{Context, Result};
use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use expo_recoder::catalog::{self, Catalog};
use expo_recoder::{BatchProcessor, Config, FfprobeProber, ToolPaths};

#[tokio::main]
async fn main() -> Result<()> {
    let matches = Command::new("Expo Recoder")
        .version("0.1.0")
        .author("TigreRoll")
        .about("Normalize exhibition images and videos to the delivery spec")
        .arg(
            Arg::new("source-dir")
                .short('s')
                .long("source-dir")
                .value_name("DIR")
                .help("Directory containing the assets to check")
                .required_unless_present("reconcile-only"),
        )
        .arg(
            Arg::new("dest-dir")
                .short('d')
                .long("dest-dir")
                .value_name("DIR")
                .help("Directory receiving copied and recoded assets")
                .required(true),
        )
        .arg(
            Arg::new("catalog")
                .short('c')
                .long("catalog")
                .value_name("CSV")
                .help("Exhibition catalog with a FILE_NAME column")
                .required(true),
        )
        .arg(
            Arg::new("report")
                .short('r')
                .long("report")
                .value_name("CSV")
                .help("Reconciled report to (re)write")
                .required(true),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("TOML")
                .help("Configuration file"),
        )
        .arg(
            Arg::new("workers")
                .short('w')
                .long("workers")
                .value_name("NUM")
                .help("Number of parallel workers (default: cores - 1, at most 4)")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("reconcile-only")
                .long("reconcile-only")
                .help("Skip processing and only refresh the report from the destination")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("build-catalog")
                .long("build-catalog")
                .help("Probe the source directory into a new catalog when none exists")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let path_arg = |name: &str| matches.get_one::<String>(name).map(PathBuf::from);
    let dest_dir = path_arg("dest-dir").context("--dest-dir is required")?;
    let catalog_path = path_arg("catalog").context("--catalog is required")?;
    let report = path_arg("report").context("--report is required")?;
    let verbose = matches.get_flag("verbose");

    // Load configuration
    let mut config = Config::load(path_arg("config").as_deref())?;
    if let Some(workers) = matches.get_one::<usize>("workers") {
        config.performance.max_workers = Some(*workers);
    }

    // Initialize logging
    let default_filter = if verbose {
        "expo_recoder=debug,warn".to_string()
    } else {
        format!("expo_recoder={},warn", config.output.log_level)
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    config.validate().context("Invalid configuration")?;
    info!("🚀 Expo Recoder starting...");
    info!("{}", config.summary());

    if matches.get_flag("reconcile-only") {
        let processor = BatchProcessor::from_config(&config).await?;
        let summary = processor.reconcile_only(&dest_dir, &catalog_path, &report).await?;
        info!("📊 Report refreshed: {}/{} rows processed", summary.processed, summary.rows);
        return Ok(());
    }

    let source_dir = path_arg("source-dir").context("--source-dir is required")?;
    if !source_dir.is_dir() {
        error!("Source directory does not exist: {}", source_dir.display());
        return Err(anyhow::anyhow!("Source directory not found"));
    }

    if matches.get_flag("build-catalog") {
        if catalog_path.exists() {
            warn!("Catalog {} already exists, not rebuilding it", catalog_path.display());
        } else {
            let tools = ToolPaths::discover(&config.tools)?;
            let prober = FfprobeProber::new(tools.ffprobe);
            let built: Catalog = catalog::build_from_directory(&source_dir, &prober).await?;
            built.write(&catalog_path)?;
            info!("📒 Catalog written: {} ({} assets)", catalog_path.display(), built.len());
        }
    }

    let processor = BatchProcessor::from_config(&config).await?;
    let summary = processor
        .process_directory(&source_dir, &dest_dir, &catalog_path, &report)
        .await?;

    // Print results
    info!("🎉 Processing completed in {:.2}s", summary.elapsed.as_secs_f64());
    info!("✅ Done: {}", summary.done);
    info!("❌ Failed: {}", summary.failed);
    for failure in &summary.failures {
        error!("   {} - {}", failure.asset, failure.diagnostic);
    }
    if let Some(report_summary) = &summary.report {
        info!(
            "📊 Report: {}/{} catalog rows processed",
            report_summary.processed, report_summary.rows
        );
    }

    Ok(())
}
