use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::catalog::Catalog;
use crate::compliance::{evaluate, ComplianceSpec, ProcessingDecision};
use crate::config::{Config, OutputConfig};
use crate::encoder::{EncoderProfile, ToolPaths};
use crate::error::MediaError;
use crate::media::{discover_media, file_name_of, MediaKind};
use crate::probe::{FfprobeProber, MediaProber};
use crate::progress::ProgressStore;
use crate::reconcile::{ReconcileSummary, Reconciler};
use crate::transcode::{
    copy_unchanged, processed_name, ImageTranscoder, TranscodeAction, TranscodeOutput, VideoTranscoder,
};

/// Lifecycle of one asset inside a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssetState {
    Pending,
    Evaluating,
    Compliant,
    Copying,
    NonCompliant,
    Transcoding,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Done,
    Failed,
}

/// Processing result for a single asset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub asset: String,
    pub source: PathBuf,
    pub output: Option<PathBuf>,
    pub outcome: Outcome,
    pub action: Option<TranscodeAction>,
    pub diagnostic: Option<String>,
    pub decision: Option<ProcessingDecision>,
    pub stages: Vec<AssetState>,
    pub elapsed: Duration,
}

impl ProcessingResult {
    fn pending(source: &Path) -> Self {
        Self {
            asset: file_name_of(source),
            source: source.to_path_buf(),
            output: None,
            outcome: Outcome::Failed,
            action: None,
            diagnostic: None,
            decision: None,
            stages: vec![AssetState::Pending],
            elapsed: Duration::ZERO,
        }
    }

    fn enter(&mut self, state: AssetState) {
        self.stages.push(state);
    }

    pub fn state(&self) -> AssetState {
        self.stages.last().copied().unwrap_or(AssetState::Pending)
    }

    fn finish(mut self, output: TranscodeOutput, started: Instant) -> Self {
        self.enter(AssetState::Done);
        self.outcome = Outcome::Done;
        self.output = Some(output.output);
        self.action = Some(output.action);
        self.elapsed = started.elapsed();
        self
    }

    fn fail(mut self, diagnostic: String, started: Instant) -> Self {
        self.enter(AssetState::Failed);
        self.outcome = Outcome::Failed;
        self.diagnostic = Some(diagnostic);
        self.elapsed = started.elapsed();
        self
    }

    pub fn is_done(&self) -> bool {
        self.outcome == Outcome::Done
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub asset: String,
    pub diagnostic: String,
}

/// Overall batch processing results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub failures: Vec<FailureRecord>,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub encoder: Option<String>,
    pub report: Option<ReconcileSummary>,
    pub results: Vec<ProcessingResult>,
}

impl RunSummary {
    pub fn from_results(results: Vec<ProcessingResult>, started_at: DateTime<Utc>, elapsed: Duration) -> Self {
        let failures: Vec<FailureRecord> = results
            .iter()
            .filter(|r| !r.is_done())
            .map(|r| FailureRecord {
                asset: r.asset.clone(),
                diagnostic: r.diagnostic.clone().unwrap_or_default(),
            })
            .collect();

        Self {
            total: results.len(),
            done: results.len() - failures.len(),
            failed: failures.len(),
            failures,
            started_at,
            elapsed,
            encoder: None,
            report: None,
            results,
        }
    }

    /// Source name -> produced file, for every asset that finished
    pub fn output_map(&self) -> HashMap<String, PathBuf> {
        self.results
            .iter()
            .filter_map(|r| r.output.clone().map(|o| (r.asset.clone(), o)))
            .collect()
    }
}

/// Everything a worker needs, shared across tasks
struct WorkerContext {
    spec: ComplianceSpec,
    prober: Arc<dyn MediaProber>,
    images: ImageTranscoder,
    videos: VideoTranscoder,
    progress: ProgressStore,
}

impl WorkerContext {
    /// Run one asset through evaluate -> copy | transcode
    async fn process_asset(&self, source: &Path, dest_dir: &Path) -> ProcessingResult {
        let started = Instant::now();
        let mut result = ProcessingResult::pending(source);
        self.progress.record(&result.asset, 0).await;

        result.enter(AssetState::Evaluating);
        let asset = match self.prober.probe(source).await {
            Ok(asset) => asset,
            Err(e) => return result.fail(e.to_string(), started),
        };

        let decision = evaluate(&asset, &self.spec);
        let compliant = decision.compliant;
        if !compliant {
            debug!("🔎 {} needs recoding: {}", asset.name, decision.reasons());
        }
        result.decision = Some(decision);

        let produced = if compliant {
            result.enter(AssetState::Compliant);
            result.enter(AssetState::Copying);
            copy_unchanged(&asset, dest_dir).await
        } else {
            result.enter(AssetState::NonCompliant);
            result.enter(AssetState::Transcoding);
            match asset.kind {
                MediaKind::Image => {
                    let images = self.images.clone();
                    let blocking_asset = asset.clone();
                    let dest = dest_dir.to_path_buf();
                    tokio::task::spawn_blocking(move || images.transcode(&blocking_asset, &dest))
                        .await
                        .unwrap_or_else(|e| {
                            Err(MediaError::Encode {
                                path: asset.path.clone(),
                                status: "image worker aborted".to_string(),
                                diagnostic: e.to_string(),
                            })
                        })
                }
                MediaKind::Video => self.videos.transcode(&asset, dest_dir, &self.progress).await,
            }
        };

        match produced {
            Ok(output) => {
                self.progress.record(&asset.name, 100).await;
                result.finish(output, started)
            }
            Err(e) => result.fail(e.to_string(), started),
        }
    }
}

/// Bounded worker pool that fans one unit of work out per asset
pub struct BatchProcessor {
    ctx: Arc<WorkerContext>,
    output: OutputConfig,
    processed_suffix: String,
    worker_semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl BatchProcessor {
    pub fn new(config: &Config, prober: Arc<dyn MediaProber>, videos: VideoTranscoder) -> Self {
        let max_workers = config.performance.worker_count();
        info!("🔧 Initializing BatchProcessor with {} workers", max_workers);

        let ctx = WorkerContext {
            spec: config.compliance.clone(),
            prober,
            images: ImageTranscoder::new(config.compliance.clone(), &config.encoding),
            videos,
            progress: ProgressStore::new(&config.progress),
        };

        Self {
            ctx: Arc::new(ctx),
            output: config.output.clone(),
            processed_suffix: config.encoding.processed_suffix.clone(),
            worker_semaphore: Arc::new(Semaphore::new(max_workers)),
            max_concurrent: max_workers,
        }
    }

    /// Locate ffmpeg/ffprobe, pick the HEVC encoder once and build the pool
    pub async fn from_config(config: &Config) -> Result<Self> {
        let tools = ToolPaths::discover(&config.tools).context("ffmpeg and ffprobe are required")?;
        let profile = EncoderProfile::detect(&tools.ffmpeg, &config.encoding).await;
        let videos = VideoTranscoder::new(
            tools.ffmpeg,
            profile,
            config.compliance.clone(),
            config.encoding.clone(),
            config.performance.worker_count(),
        );
        Ok(Self::new(config, Arc::new(FfprobeProber::new(tools.ffprobe)), videos))
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.ctx.progress
    }

    /// Full run: clean, dispatch every source asset, reconcile the catalog
    /// into `report`, then drop the progress store whatever happened.
    pub async fn process_directory(
        &self,
        source_dir: &Path,
        dest_dir: &Path,
        catalog_path: &Path,
        report: &Path,
    ) -> Result<RunSummary> {
        info!("🚀 Starting batch processing...");
        info!("📁 Input: {}", source_dir.display());
        info!("📂 Output: {}", dest_dir.display());

        let mut catalog = Catalog::from_path(catalog_path)
            .with_context(|| format!("Cannot read catalog {}", catalog_path.display()))?;
        let sources = discover_media(source_dir)
            .await
            .with_context(|| format!("Cannot list source directory {}", source_dir.display()))?;

        tokio::fs::create_dir_all(dest_dir)
            .await
            .with_context(|| format!("Cannot create destination {}", dest_dir.display()))?;
        if same_directory(source_dir, dest_dir) {
            bail!(
                "Destination {} is the source directory; refusing to clean it",
                dest_dir.display()
            );
        }
        if self.output.clean_destination {
            let keep = [canonical(catalog_path), canonical(report)];
            let removed = clean_directory(dest_dir, &keep).await?;
            if removed > 0 {
                info!("🧹 Removed {} stale files from {}", removed, dest_dir.display());
            }
        }

        self.ctx
            .progress
            .create()
            .await
            .with_context(|| format!("Cannot create progress store {}", self.ctx.progress.path().display()))?;

        let run = self.dispatch_and_reconcile(sources, dest_dir, &mut catalog, report).await;

        if let Err(e) = self.ctx.progress.clear().await {
            warn!("Could not remove progress store: {}", e);
        }

        let mut summary = run?;
        summary.encoder = Some(self.ctx.videos.profile().encoder.clone());

        let summary_path = report
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .join(&self.output.summary_file);
        let json_data = serde_json::to_vec_pretty(&summary)?;
        crate::atomic::write_atomic(&summary_path, &json_data)?;
        info!("💾 Results saved to: {}", summary_path.display());

        Ok(summary)
    }

    async fn dispatch_and_reconcile(
        &self,
        sources: Vec<PathBuf>,
        dest_dir: &Path,
        catalog: &mut Catalog,
        report: &Path,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let start_time = Instant::now();

        if sources.is_empty() {
            warn!("No media found to process");
        } else {
            info!("🎞️ Found {} assets to process", sources.len());
        }

        let results = self.process_paths(sources, dest_dir).await;
        let mut summary = RunSummary::from_results(results, started_at, start_time.elapsed());

        let reconciler = Reconciler::new(self.ctx.prober.as_ref(), self.processed_suffix.clone());
        let report_summary = reconciler.reconcile(catalog, dest_dir, &summary.output_map()).await?;
        catalog
            .write(report)
            .with_context(|| format!("Cannot write report {}", report.display()))?;
        info!("📊 Report written: {}", report.display());
        summary.report = Some(report_summary);

        Ok(summary)
    }

    /// Process assets in parallel with controlled concurrency.
    ///
    /// One result per input path; a panicking unit is reported as failed.
    pub async fn process_paths(&self, paths: Vec<PathBuf>, dest_dir: &Path) -> Vec<ProcessingResult> {
        let total = paths.len();
        let mut collisions = output_collisions(&paths, &self.processed_suffix);
        let mut handles = Vec::with_capacity(total);

        for (index, path) in paths.into_iter().enumerate() {
            let ctx = Arc::clone(&self.ctx);
            let semaphore = Arc::clone(&self.worker_semaphore);
            let dest_dir = dest_dir.to_path_buf();
            let task_path = path.clone();
            let collision = collisions.remove(&index);

            let handle = tokio::spawn(async move {
                if let Some(diagnostic) = collision {
                    return ProcessingResult::pending(&task_path).fail(diagnostic, Instant::now());
                }
                let _permit = semaphore.acquire_owned().await.ok();
                info!("🎯 Processing asset {}/{}: {}", index + 1, total, task_path.display());
                ctx.process_asset(&task_path, &dest_dir).await
            });
            handles.push((path, handle));
        }

        let (paths, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let joined = futures::future::join_all(handles).await;

        let mut results = Vec::with_capacity(total);
        for (path, joined) in paths.into_iter().zip(joined) {
            let result = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!("Worker for {} aborted: {}", path.display(), e);
                    ProcessingResult::pending(&path).fail(format!("worker panicked: {}", e), Instant::now())
                }
            };

            match result.outcome {
                Outcome::Done => info!(
                    "✅ Completed: {} in {:.2}s",
                    result.asset,
                    result.elapsed.as_secs_f64()
                ),
                Outcome::Failed => warn!(
                    "❌ Failed: {} - {}",
                    result.asset,
                    result.diagnostic.as_deref().unwrap_or("Unknown error")
                ),
            }
            results.push(result);
        }

        results
    }

    /// Refresh the report from the destination as it is now
    pub async fn reconcile_only(&self, dest_dir: &Path, catalog_path: &Path, report: &Path) -> Result<ReconcileSummary> {
        let reconciler = Reconciler::new(self.ctx.prober.as_ref(), self.processed_suffix.clone());
        let summary = reconciler
            .run(catalog_path, report, dest_dir, &HashMap::new())
            .await
            .with_context(|| format!("Cannot reconcile {}", catalog_path.display()))?;
        Ok(summary)
    }

    /// Get processing statistics
    pub fn get_stats(&self) -> ProcessingStats {
        ProcessingStats {
            max_workers: self.max_concurrent,
            available_permits: self.worker_semaphore.available_permits(),
        }
    }
}

/// Names an asset may occupy in the destination: unchanged when copied,
/// `<stem><suffix>.<ext>` when transcoded
fn candidate_outputs(path: &Path, suffix: &str) -> Vec<String> {
    let name = file_name_of(path);
    let mut names = vec![name.clone()];
    match MediaKind::from_path(path) {
        Some(MediaKind::Image) => names.push(processed_name(&name, suffix, "jpg")),
        Some(MediaKind::Video) => names.push(processed_name(&name, suffix, "mp4")),
        None => {}
    }
    names
}

/// Index -> diagnostic for every asset whose possible output names overlap
/// an earlier asset's. The first claimant keeps the name.
fn output_collisions(paths: &[PathBuf], suffix: &str) -> HashMap<usize, String> {
    let mut owners: HashMap<String, String> = HashMap::new();
    let mut collisions = HashMap::new();

    for (index, path) in paths.iter().enumerate() {
        let names = candidate_outputs(path, suffix);
        let clash = names.iter().find_map(|n| owners.get(n).map(|owner| (n.clone(), owner.clone())));
        match clash {
            Some((name, owner)) => {
                warn!("⚠️ {} would overwrite output {} of {}", file_name_of(path), name, owner);
                collisions.insert(
                    index,
                    format!("output name {} collides with source {}; rename one of them", name, owner),
                );
            }
            None => {
                let owner = file_name_of(path);
                for name in names {
                    owners.insert(name, owner.clone());
                }
            }
        }
    }
    collisions
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

fn same_directory(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Delete the regular files directly inside `dir`, except those in `keep`
async fn clean_directory(dir: &Path, keep: &[PathBuf]) -> Result<usize> {
    let keep: HashSet<&PathBuf> = keep.iter().collect();
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            if keep.contains(&canonical(&entry.path())) {
                continue;
            }
            tokio::fs::remove_file(entry.path())
                .await
                .with_context(|| format!("Cannot remove {}", entry.path().display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[derive(Debug, Clone)]
pub struct ProcessingStats {
    pub max_workers: usize,
    pub available_permits: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compliance::Resolution;
    use crate::config::ConfigBuilder;
    use image::{Rgb, RgbImage};
    use tempfile::TempDir;

    fn processor(dir: &TempDir, workers: usize) -> BatchProcessor {
        let mut config = ConfigBuilder::new()
            .with_workers(workers)
            .with_canonical(Resolution::new(64, 36), Resolution::new(36, 64))
            .with_progress_file(dir.path().join("progress.json"))
            .build();
        config.progress.backoff_ms = 1;
        let videos = VideoTranscoder::new(
            PathBuf::from("/nonexistent/ffmpeg_xyz_12345"),
            EncoderProfile::software("libx265"),
            config.compliance.clone(),
            config.encoding.clone(),
            1,
        );
        BatchProcessor::new(&config, Arc::new(FfprobeProber::new(PathBuf::from("ffprobe"))), videos)
    }

    #[test]
    fn test_batch_processor_creation() {
        let dir = TempDir::new().unwrap();
        let stats = processor(&dir, 4).get_stats();
        assert_eq!(stats.max_workers, 4);
        assert_eq!(stats.available_permits, 4);
    }

    #[tokio::test]
    async fn test_mixed_images_resolve_independently() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dest = dir.path().join("dest");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&dest).unwrap();

        RgbImage::from_pixel(64, 36, Rgb([1, 1, 1])).save(src.join("E1_P001_ok.png")).unwrap();
        RgbImage::from_pixel(100, 80, Rgb([1, 1, 1])).save(src.join("E1_P002_big.png")).unwrap();
        std::fs::write(src.join("E1_P003_broken.jpg"), b"not an image").unwrap();

        let p = processor(&dir, 2);
        p.progress().create().await.unwrap();
        let paths = discover_media(&src).await.unwrap();
        let results = p.process_paths(paths, &dest).await;

        assert_eq!(results.len(), 3);
        let by_name: HashMap<_, _> = results.iter().map(|r| (r.asset.as_str(), r)).collect();

        let ok = by_name["E1_P001_ok.png"];
        assert_eq!(ok.action, Some(TranscodeAction::Copied));
        assert_eq!(
            ok.stages,
            vec![AssetState::Pending, AssetState::Evaluating, AssetState::Compliant, AssetState::Copying, AssetState::Done]
        );
        assert_eq!(
            std::fs::read(src.join("E1_P001_ok.png")).unwrap(),
            std::fs::read(dest.join("E1_P001_ok.png")).unwrap()
        );

        let big = by_name["E1_P002_big.png"];
        assert_eq!(big.action, Some(TranscodeAction::Transcoded));
        assert_eq!(big.output.as_deref(), Some(dest.join("E1_P002_big-processed.jpg").as_path()));

        let broken = by_name["E1_P003_broken.jpg"];
        assert_eq!(broken.outcome, Outcome::Failed);
        assert_eq!(broken.state(), AssetState::Failed);
        assert!(broken.diagnostic.is_some());

        let snapshot = p.progress().snapshot().await.unwrap();
        assert_eq!(snapshot["E1_P001_ok.png"], 100);
        assert_eq!(snapshot["E1_P002_big.png"], 100);
        assert_eq!(p.get_stats().available_permits, 2);
    }

    #[test]
    fn test_summary_counts_failures() {
        let now = Utc::now();
        let dir = TempDir::new().unwrap();
        let ok = ProcessingResult::pending(Path::new("a.png")).finish(
            TranscodeOutput {
                source: "a.png".to_string(),
                output: dir.path().join("a.png"),
                action: TranscodeAction::Copied,
            },
            Instant::now(),
        );
        let bad = ProcessingResult::pending(Path::new("b.mp4")).fail("encoder exited".to_string(), Instant::now());

        let summary = RunSummary::from_results(vec![ok, bad], now, Duration::from_secs(1));
        assert_eq!((summary.total, summary.done, summary.failed), (2, 1, 1));
        assert_eq!(summary.failures[0].asset, "b.mp4");
        assert_eq!(summary.output_map().len(), 1);
    }

    #[tokio::test]
    async fn test_clean_directory_keeps_subdirectories() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("stale-processed.jpg"), b"x").unwrap();
        std::fs::create_dir(dir.path().join("keep")).unwrap();
        assert_eq!(clean_directory(dir.path(), &[]).await.unwrap(), 1);
        assert!(dir.path().join("keep").exists());
    }

    #[tokio::test]
    async fn test_clean_directory_spares_listed_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("old.jpg"), b"x").unwrap();
        std::fs::write(dir.path().join("catalog.csv"), b"FILE_NAME\n").unwrap();
        let keep = [canonical(&dir.path().join("catalog.csv"))];

        assert_eq!(clean_directory(dir.path(), &keep).await.unwrap(), 1);
        assert!(dir.path().join("catalog.csv").exists());
        assert!(!dir.path().join("old.jpg").exists());
    }

    #[test]
    fn test_output_collisions_flag_later_sources() {
        let paths = vec![
            PathBuf::from("/src/E1_P001_art.jpg"),
            PathBuf::from("/src/E1_P001_art.png"),
            PathBuf::from("/src/clip.mov"),
            PathBuf::from("/src/clip.mp4"),
            PathBuf::from("/src/clip.png"),
        ];
        let collisions = output_collisions(&paths, "-processed");

        assert_eq!(collisions.len(), 2);
        assert!(collisions[&1].contains("E1_P001_art-processed.jpg"));
        assert!(collisions[&1].contains("E1_P001_art.jpg"));
        assert!(collisions[&3].contains("clip-processed.mp4"));
        assert!(!collisions.contains_key(&4));
    }

    #[tokio::test]
    async fn test_same_stem_sources_do_not_share_an_output() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dest = dir.path().join("dest");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        RgbImage::from_pixel(100, 80, Rgb([1, 1, 1])).save(src.join("E1_P001_art.png")).unwrap();
        RgbImage::from_pixel(90, 70, Rgb([1, 1, 1])).save(src.join("E1_P001_art.jpg")).unwrap();

        let p = processor(&dir, 2);
        p.progress().create().await.unwrap();
        let results = p.process_paths(discover_media(&src).await.unwrap(), &dest).await;

        let done: Vec<_> = results.iter().filter(|r| r.is_done()).collect();
        let failed: Vec<_> = results.iter().filter(|r| !r.is_done()).collect();
        assert_eq!((done.len(), failed.len()), (1, 1));
        assert!(failed[0].diagnostic.as_deref().unwrap().contains("collides"));
        assert_eq!(std::fs::read_dir(&dest).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_destination_equal_to_source_is_refused() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(&src).unwrap();
        RgbImage::from_pixel(64, 36, Rgb([1, 1, 1])).save(src.join("E1_P001_ok.png")).unwrap();
        let catalog = dir.path().join("catalog.csv");
        std::fs::write(&catalog, "FILE_NAME\nE1_P001_ok.png\n").unwrap();

        let p = processor(&dir, 1);
        let same = src.join(".");
        let result = p
            .process_directory(&src, &same, &catalog, &dir.path().join("report.csv"))
            .await;

        assert!(result.is_err());
        assert!(src.join("E1_P001_ok.png").exists());
        assert!(!dir.path().join("progress.json").exists());
    }
}
