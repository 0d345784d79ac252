use anyhow::Result;
use clap::Parser;
use expo_recoder::{Config, ProgressMonitor, ProgressStore, RunWatch};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "expo-progress")]
#[command(about = "Stream recoding progress as JSON lines")]
struct Cli {
    /// Progress file written by expo-recoder (defaults to the configured one)
    #[arg(long)]
    file: Option<PathBuf>,

    /// Configuration file shared with expo-recoder
    #[arg(long)]
    config: Option<PathBuf>,

    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    interval_ms: u64,

    /// Keep polling after the run finished
    #[arg(long)]
    follow: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter("expo_progress=info,warn")
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let file = cli.file.unwrap_or_else(|| config.progress.file.clone());
    let store = ProgressStore::at(file.clone(), &config.progress);
    let mut monitor = ProgressMonitor::spawn(store.clone(), Duration::from_millis(cli.interval_ms.max(10)));
    let mut run = RunWatch::default();

    info!("👀 Watching {}", file.display());

    loop {
        tokio::select! {
            update = monitor.next() => {
                let Some(update) = update else { break };
                let finished = run.observe(store.exists());
                if !finished {
                    println!("{}", serde_json::to_string(&update)?);
                }
                if finished && !cli.follow {
                    info!("🏁 Run finished");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    monitor.stop().await;
    Ok(())
}
