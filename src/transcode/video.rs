use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{processed_name, TranscodeAction, TranscodeOutput};
use crate::atomic::remove_if_exists;
use crate::compliance::ComplianceSpec;
use crate::config::EncodingConfig;
use crate::encoder::EncoderProfile;
use crate::error::{MediaError, Result};
use crate::media::MediaAsset;
use crate::progress::ProgressStore;

/// Lines of encoder stderr kept for failure diagnostics
const DIAGNOSTIC_LINES: usize = 40;

/// Heuristic progress never reaches this before a successful exit
const HEURISTIC_CEILING: u8 = 95;

/// Re-encodes non-compliant videos to canonical HEVC with ffmpeg
#[derive(Debug, Clone)]
pub struct VideoTranscoder {
    ffmpeg: PathBuf,
    profile: EncoderProfile,
    spec: ComplianceSpec,
    encoding: EncodingConfig,
    encoder_threads: usize,
    heuristic_tick: Duration,
}

impl VideoTranscoder {
    pub fn new(
        ffmpeg: PathBuf,
        profile: EncoderProfile,
        spec: ComplianceSpec,
        encoding: EncodingConfig,
        encoder_threads: usize,
    ) -> Self {
        Self {
            ffmpeg,
            profile,
            spec,
            encoding,
            encoder_threads: encoder_threads.max(1),
            heuristic_tick: Duration::from_secs(2),
        }
    }

    /// How often the wall-clock fallback is consulted when ffmpeg is silent
    pub fn with_heuristic_tick(mut self, tick: Duration) -> Self {
        self.heuristic_tick = tick;
        self
    }

    pub fn profile(&self) -> &EncoderProfile {
        &self.profile
    }

    pub fn output_path(&self, asset: &MediaAsset, dest_dir: &Path) -> PathBuf {
        dest_dir.join(processed_name(&asset.name, &self.encoding.processed_suffix, "mp4"))
    }

    /// ffmpeg arguments for one transcode
    pub fn build_args(&self, asset: &MediaAsset, output: &Path) -> Vec<String> {
        let target = self.spec.canonical_for(asset.width, asset.height);
        let enc = &self.encoding;

        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-i".into(),
            asset.path.to_string_lossy().to_string(),
            "-vf".into(),
            format!(
                "fps={},scale={}:{}:flags=bicubic",
                enc.frame_rate, target.width, target.height
            ),
            "-c:v".into(),
            self.profile.encoder.clone(),
        ];

        if self.profile.is_hardware() {
            if self.profile.encoder.contains("videotoolbox") {
                args.extend(["-allow_sw".to_string(), "1".to_string()]);
            }
        } else {
            args.extend([
                "-preset".into(),
                enc.software_preset.clone(),
                "-x265-params".into(),
                format!("pools=*:frame-threads={}", self.encoder_threads),
            ]);
        }

        args.extend([
            "-b:v".into(),
            enc.video_bitrate.clone(),
            "-maxrate".into(),
            enc.video_maxrate.clone(),
            "-bufsize".into(),
            enc.video_bufsize.clone(),
            "-tag:v".into(),
            "hvc1".into(),
            "-c:a".into(),
            enc.audio_codec.clone(),
            "-movflags".into(),
            "+faststart".into(),
            "-progress".into(),
            "pipe:1".into(),
            "-nostats".into(),
            output.to_string_lossy().to_string(),
        ]);

        args
    }

    /// Run ffmpeg, streaming its progress into `progress` under the asset name.
    ///
    /// On a nonzero exit the partial output is deleted and the tail of the
    /// encoder's stderr is returned in [`MediaError::Encode`].
    pub async fn transcode(
        &self,
        asset: &MediaAsset,
        dest_dir: &Path,
        progress: &ProgressStore,
    ) -> Result<TranscodeOutput> {
        let output = self.output_path(asset, dest_dir);
        let args = self.build_args(asset, &output);
        debug!("🎬 {} {}", self.ffmpeg.display(), args.join(" "));

        let mut child = Command::new(&self.ffmpeg)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MediaError::Encode {
                path: asset.path.clone(),
                status: "spawn failure".to_string(),
                diagnostic: e.to_string(),
            })?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(DIAGNOSTIC_LINES);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tail.len() == DIAGNOSTIC_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail.into_iter().collect::<Vec<_>>().join("\n")
            })
        });

        let mut tracker = ProgressTracker::new(asset.duration);

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            let mut ticker = tokio::time::interval(self.heuristic_tick);
            ticker.tick().await;

            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                if let Some(pct) = tracker.observe_line(&line) {
                                    progress.record(&asset.name, pct).await;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("Lost ffmpeg progress stream for {}: {}", asset.name, e);
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if let Some(pct) = tracker.observe_clock(Instant::now()) {
                            progress.record(&asset.name, pct).await;
                        }
                    }
                }
            }
        }

        let status = match child.wait().await {
            Ok(status) => status,
            Err(e) => {
                let error = discard_partial(&output, &asset.path, "wait failure".to_string(), e.to_string()).await;
                return Err(error);
            }
        };
        let diagnostic = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(discard_partial(&output, &asset.path, status.to_string(), diagnostic).await);
        }

        progress.record(&asset.name, 100).await;
        info!("🎞️ Video processed: {} -> {}", asset.name, output.display());

        Ok(TranscodeOutput {
            source: asset.name.clone(),
            output,
            action: TranscodeAction::Transcoded,
        })
    }
}

/// Delete whatever the encoder left at `output` and describe the failure
async fn discard_partial(output: &Path, source: &Path, status: String, diagnostic: String) -> MediaError {
    if let Err(e) = remove_if_exists(output).await {
        warn!("Could not remove partial output {}: {}", output.display(), e);
    }
    MediaError::Encode {
        path: source.to_path_buf(),
        status,
        diagnostic,
    }
}

/// Elapsed media time carried by one `-progress` line, in seconds.
///
/// ffmpeg's `out_time_ms` is in microseconds despite the name.
pub fn parse_progress_line(line: &str) -> Option<f64> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => {
            let micros: i64 = value.trim().parse().ok()?;
            (micros >= 0).then(|| micros as f64 / 1_000_000.0)
        }
        "out_time" => parse_clock(value.trim()),
        _ => None,
    }
}

/// `HH:MM:SS.ffffff` to seconds
fn parse_clock(value: &str) -> Option<f64> {
    let mut parts = value.split(':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || !(0.0..60.0).contains(&seconds) {
        return None;
    }
    Some((hours * 3600 + minutes * 60) as f64 + seconds)
}

/// Turns encoder output into a non-decreasing percent
#[derive(Debug)]
pub struct ProgressTracker {
    duration: Option<f64>,
    started: Instant,
    last: u8,
    parsed: bool,
}

impl ProgressTracker {
    pub fn new(duration: Option<f64>) -> Self {
        Self {
            duration: duration.filter(|d| *d > 0.0),
            started: Instant::now(),
            last: 0,
            parsed: false,
        }
    }

    pub fn last(&self) -> u8 {
        self.last
    }

    /// min(100, elapsed / duration * 100) when the line carries a time marker
    pub fn observe_line(&mut self, line: &str) -> Option<u8> {
        let elapsed = parse_progress_line(line)?;
        let duration = self.duration?;
        self.parsed = true;
        let pct = ((elapsed / duration) * 100.0).floor().clamp(0.0, 100.0) as u8;
        self.advance(pct)
    }

    /// Wall-clock estimate, only used while no time marker has been parsed.
    ///
    /// Assumes roughly real-time encoding (one minute when the duration is
    /// unknown) and stays below [`HEURISTIC_CEILING`].
    pub fn observe_clock(&mut self, now: Instant) -> Option<u8> {
        if self.parsed {
            return None;
        }
        let expected = self.duration.unwrap_or(60.0);
        let elapsed = now.saturating_duration_since(self.started).as_secs_f64();
        let pct = ((elapsed / expected) * 100.0).floor().min(HEURISTIC_CEILING as f64) as u8;
        self.advance(pct)
    }

    fn advance(&mut self, pct: u8) -> Option<u8> {
        if pct > self.last {
            self.last = pct;
            Some(pct)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProgressConfig;
    use crate::media::MediaKind;
    use tempfile::TempDir;

    fn hd_asset(path: PathBuf, duration: Option<f64>) -> MediaAsset {
        MediaAsset {
            name: "E1_P004_clip.mp4".to_string(),
            path,
            kind: MediaKind::Video,
            width: 1920,
            height: 1080,
            format: "mp4".to_string(),
            color_mode: None,
            codec: Some("h264".to_string()),
            bitrate: Some(40_000_000),
            duration,
            frame_rate: Some(25.0),
            size_bytes: 1024,
        }
    }

    #[tokio::test]
    async fn test_discard_partial_removes_output() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("E1_P004_clip-processed.mp4");
        std::fs::write(&output, b"half a moov").unwrap();

        let source = Path::new("E1_P004_clip.mp4");
        let error = discard_partial(&output, source, "wait failure".to_string(), "EINTR".to_string()).await;

        assert!(!output.exists());
        match error {
            MediaError::Encode { status, diagnostic, .. } => {
                assert_eq!(status, "wait failure");
                assert_eq!(diagnostic, "EINTR");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        // Nothing left to remove is not an error
        discard_partial(&output, source, "exit 1".to_string(), String::new()).await;
    }

    fn transcoder(ffmpeg: PathBuf) -> VideoTranscoder {
        VideoTranscoder::new(
            ffmpeg,
            EncoderProfile::software("libx265"),
            ComplianceSpec::default(),
            EncodingConfig::default(),
            3,
        )
    }

    fn store(dir: &TempDir) -> ProgressStore {
        ProgressStore::new(&ProgressConfig {
            file: dir.path().join("progress.json"),
            backoff_ms: 1,
            ..ProgressConfig::default()
        })
    }

    #[test]
    fn test_parse_progress_lines() {
        assert_eq!(parse_progress_line("out_time_us=2500000"), Some(2.5));
        assert_eq!(parse_progress_line("out_time_ms=1000000"), Some(1.0));
        assert_eq!(parse_progress_line("out_time=00:01:05.500000"), Some(65.5));
        assert_eq!(parse_progress_line("out_time=-577014:32:22.77"), None);
        assert_eq!(parse_progress_line("out_time_us=N/A"), None);
        assert_eq!(parse_progress_line("out_time_us=-9223372036854775807"), None);
        assert_eq!(parse_progress_line("frame=120"), None);
        assert_eq!(parse_progress_line("progress=continue"), None);
    }

    #[test]
    fn test_tracker_is_monotonic_and_capped() {
        let mut tracker = ProgressTracker::new(Some(10.0));
        assert_eq!(tracker.observe_line("out_time_us=2000000"), Some(20));
        assert_eq!(tracker.observe_line("out_time_ms=2000000"), None);
        assert_eq!(tracker.observe_line("out_time_us=1000000"), None);
        assert_eq!(tracker.observe_line("out_time_us=12000000"), Some(100));
        assert_eq!(tracker.last(), 100);
    }

    #[test]
    fn test_tracker_without_duration_uses_clock_below_ceiling() {
        let mut tracker = ProgressTracker::new(None);
        let start = tracker.started;
        assert_eq!(tracker.observe_line("out_time_us=5000000"), None);
        assert_eq!(tracker.observe_clock(start + Duration::from_secs(30)), Some(50));
        assert_eq!(tracker.observe_clock(start + Duration::from_secs(3600)), Some(HEURISTIC_CEILING));
        assert_eq!(tracker.observe_clock(start + Duration::from_secs(7200)), None);
    }

    #[test]
    fn test_clock_ignored_once_markers_parse() {
        let mut tracker = ProgressTracker::new(Some(100.0));
        let start = tracker.started;
        assert_eq!(tracker.observe_line("out_time_us=10000000"), Some(10));
        assert_eq!(tracker.observe_clock(start + Duration::from_secs(90)), None);
    }

    #[test]
    fn test_build_args_software() {
        let t = transcoder(PathBuf::from("ffmpeg"));
        let asset = hd_asset(PathBuf::from("/src/E1_P004_clip.mp4"), Some(10.0));
        let args = t.build_args(&asset, Path::new("/dst/E1_P004_clip-processed.mp4"));
        let joined = args.join(" ");

        assert!(joined.contains("-vf fps=30,scale=3840:2160:flags=bicubic"));
        assert!(joined.contains("-c:v libx265 -preset medium -x265-params pools=*:frame-threads=3"));
        assert!(joined.contains("-b:v 45M -maxrate 60M -bufsize 60M"));
        assert!(joined.contains("-tag:v hvc1"));
        assert!(joined.contains("-c:a aac"));
        assert!(joined.contains("-movflags +faststart"));
        assert!(joined.contains("-progress pipe:1"));
        assert_eq!(args.last().unwrap(), "/dst/E1_P004_clip-processed.mp4");
    }

    #[test]
    fn test_build_args_hardware_portrait() {
        let t = VideoTranscoder::new(
            PathBuf::from("ffmpeg"),
            EncoderProfile {
                backend: crate::encoder::EncoderBackend::Hardware,
                encoder: "hevc_videotoolbox".to_string(),
            },
            ComplianceSpec::default(),
            EncodingConfig::default(),
            2,
        );
        let mut asset = hd_asset(PathBuf::from("v.mp4"), None);
        asset.width = 1080;
        asset.height = 1920;
        let joined = t.build_args(&asset, Path::new("o.mp4")).join(" ");
        assert!(joined.contains("scale=2160:3840"));
        assert!(joined.contains("-c:v hevc_videotoolbox -allow_sw 1"));
        assert!(!joined.contains("x265-params"));
    }

    #[test]
    fn test_output_path_uses_processed_marker() {
        let t = transcoder(PathBuf::from("ffmpeg"));
        let asset = hd_asset(PathBuf::from("/src/E1_P004_clip.mov"), None);
        assert_eq!(
            t.output_path(&asset, Path::new("/dst")),
            PathBuf::from("/dst/E1_P004_clip-processed.mp4")
        );
    }

    #[tokio::test]
    async fn test_missing_encoder_is_encode_error() {
        let dir = TempDir::new().unwrap();
        let t = transcoder(PathBuf::from("/nonexistent/ffmpeg_xyz_12345"));
        let asset = hd_asset(dir.path().join("in.mp4"), Some(1.0));
        let result = t.transcode(&asset, dir.path(), &store(&dir)).await;
        assert!(matches!(result, Err(MediaError::Encode { .. })));
    }

    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-ffmpeg.sh");
        std::fs::write(&path, format!("#!/bin/sh\nfor last; do :; done\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_encode_removes_partial_output() {
        let dir = TempDir::new().unwrap();
        let ffmpeg = fake_ffmpeg(
            dir.path(),
            "echo partial > \"$last\"\necho 'Invalid data found when processing input' >&2\nexit 3",
        );
        let out_dir = dir.path().join("out");
        std::fs::create_dir(&out_dir).unwrap();
        let progress = store(&dir);
        progress.create().await.unwrap();

        let asset = hd_asset(dir.path().join("in.mp4"), Some(1.0));
        let result = transcoder(ffmpeg).transcode(&asset, &out_dir, &progress).await;

        match result {
            Err(MediaError::Encode { diagnostic, .. }) => {
                assert!(diagnostic.contains("Invalid data found"), "diagnostic: {}", diagnostic);
            }
            other => panic!("expected encode error, got {:?}", other),
        }
        assert!(!out_dir.join("E1_P004_clip-processed.mp4").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_encode_reports_progress_to_100() {
        let dir = TempDir::new().unwrap();
        let ffmpeg = fake_ffmpeg(
            dir.path(),
            "printf 'out_time_us=500000\\nprogress=continue\\nout_time_us=1000000\\nprogress=end\\n'\necho encoded > \"$last\"\nexit 0",
        );
        let out_dir = dir.path().join("out");
        std::fs::create_dir(&out_dir).unwrap();
        let progress = store(&dir);
        progress.create().await.unwrap();

        let asset = hd_asset(dir.path().join("in.mp4"), Some(2.0));
        let out = transcoder(ffmpeg).transcode(&asset, &out_dir, &progress).await.unwrap();

        assert_eq!(out.action, TranscodeAction::Transcoded);
        assert!(out.output.exists());
        assert_eq!(progress.snapshot().await.unwrap()["E1_P004_clip.mp4"], 100);
    }

    #[tokio::test]
    async fn test_real_ffmpeg_scales_to_canonical() {
        let (Ok(ffmpeg), Ok(ffprobe)) = (which::which("ffmpeg"), which::which("ffprobe")) else {
            return;
        };
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("E1_P005_hd.mp4");
        let status = std::process::Command::new(&ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-f", "lavfi", "-i", "testsrc=size=320x180:rate=25:duration=1"])
            .args(["-c:v", "libx264", "-pix_fmt", "yuv420p", "-y"])
            .arg(&src)
            .status()
            .unwrap();
        if !status.success() {
            return;
        }

        use crate::compliance::Resolution;
        use crate::probe::{FfprobeProber, MediaProber};
        let spec = ComplianceSpec {
            landscape: Resolution::new(128, 72),
            portrait: Resolution::new(72, 128),
            ..ComplianceSpec::default()
        };
        let encoding = EncodingConfig {
            software_encoder: "libx265".to_string(),
            ..EncodingConfig::default()
        };
        let prober = FfprobeProber::new(ffprobe);
        let asset = prober.probe(&src).await.unwrap();
        assert_eq!(asset.codec.as_deref(), Some("h264"));

        let t = VideoTranscoder::new(ffmpeg, EncoderProfile::software("libx265"), spec, encoding, 1);
        let out_dir = dir.path().join("out");
        std::fs::create_dir(&out_dir).unwrap();
        let progress = store(&dir);
        progress.create().await.unwrap();

        let Ok(out) = t.transcode(&asset, &out_dir, &progress).await else {
            // ffmpeg built without libx265
            return;
        };
        let encoded = prober.probe(&out.output).await.unwrap();
        assert_eq!((encoded.width, encoded.height), (128, 72));
        assert_eq!(encoded.codec.as_deref(), Some("hevc"));
        assert!((encoded.frame_rate.unwrap() - 30.0).abs() < 0.01);
    }
}
