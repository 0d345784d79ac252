use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::compliance::{ComplianceSpec, Resolution};

/// Configuration for the exhibition recoder
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Delivery spec every asset is checked against
    pub compliance: ComplianceSpec,

    /// Encoder parameters for non-compliant assets
    pub encoding: EncodingConfig,

    /// Worker pool sizing
    pub performance: PerformanceConfig,

    /// Shared progress store settings
    pub progress: ProgressConfig,

    /// External tool locations
    pub tools: ToolsConfig,

    /// Output and report settings
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodingConfig {
    /// JPEG quality for re-encoded images (1-100)
    pub jpeg_quality: u8,

    /// Density written into re-encoded JPEGs
    pub jpeg_dpi: u16,

    /// Marker inserted before the extension of transcoded outputs
    pub processed_suffix: String,

    /// Output frame rate for re-encoded videos
    pub frame_rate: u32,

    /// ffmpeg `-b:v`
    pub video_bitrate: String,

    /// ffmpeg `-maxrate`
    pub video_maxrate: String,

    /// ffmpeg `-bufsize`
    pub video_bufsize: String,

    /// Audio codec for re-encoded videos
    pub audio_codec: String,

    /// Software HEVC encoder used when no hardware encoder passes the probe
    pub software_encoder: String,

    /// Preset passed to the software encoder
    pub software_preset: String,

    /// Hardware HEVC encoders to try, in order of preference
    pub hardware_encoders: Vec<String>,

    /// Try hardware encoders at startup
    pub prefer_hardware: bool,
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            jpeg_quality: 85,
            jpeg_dpi: 72,
            processed_suffix: "-processed".to_string(),
            frame_rate: 30,
            video_bitrate: "45M".to_string(),
            video_maxrate: "60M".to_string(),
            video_bufsize: "60M".to_string(),
            audio_codec: "aac".to_string(),
            software_encoder: "libx265".to_string(),
            software_preset: "medium".to_string(),
            hardware_encoders: vec![
                "hevc_videotoolbox".to_string(),
                "hevc_nvenc".to_string(),
            ],
            prefer_hardware: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceConfig {
    /// Fixed worker count; computed from the host when unset
    pub max_workers: Option<usize>,

    /// Upper bound for the computed worker count
    pub worker_cap: usize,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            worker_cap: 4,
        }
    }
}

impl PerformanceConfig {
    /// max(1, min(cores - 1, cap)) unless a fixed count is configured
    pub fn worker_count(&self) -> usize {
        match self.max_workers {
            Some(n) => n.max(1),
            None => compute_workers(num_cpus::get(), self.worker_cap),
        }
    }
}

pub fn compute_workers(cores: usize, cap: usize) -> usize {
    cores.saturating_sub(1).min(cap).max(1)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Location of the shared progress file
    pub file: PathBuf,

    /// Attempts per read-modify-write before the update is dropped
    pub max_attempts: u32,

    /// Base backoff between attempts, doubled each retry
    pub backoff_ms: u64,

    /// Lock files older than this are treated as abandoned
    pub stale_lock_secs: u64,

    /// Monitor poll interval
    pub poll_interval_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("progress.json"),
            max_attempts: 6,
            backoff_ms: 10,
            stale_lock_secs: 10,
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Remove files left in the destination before a processing run
    pub clean_destination: bool,

    /// Log level for the crate
    pub log_level: String,

    /// JSON run summary written next to the report
    pub summary_file: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            clean_destination: true,
            log_level: "info".to_string(),
            summary_file: "processing_results.json".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from an explicit file or the default locations
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let config_str = std::fs::read_to_string(path)
                .map_err(|e| anyhow!("Cannot read config {}: {}", path.display(), e))?;
            let mut config: Config = toml::from_str(&config_str)
                .map_err(|e| anyhow!("Failed to parse config {}: {}", path.display(), e))?;
            config.apply_env();
            tracing::info!("📄 Loaded configuration from: {}", path.display());
            return Ok(config);
        }

        let config_paths = ["expo-recoder.toml", "config/expo-recoder.toml"];

        for path in &config_paths {
            if let Ok(config_str) = std::fs::read_to_string(path) {
                match toml::from_str::<Config>(&config_str) {
                    Ok(mut config) => {
                        config.apply_env();
                        tracing::info!("📄 Loaded configuration from: {}", path);
                        return Ok(config);
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse config file {}: {}", path, e);
                    }
                }
            }
        }

        Ok(Self::from_env())
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(workers) = std::env::var("EXPO_RECODER_WORKERS") {
            match workers.parse() {
                Ok(n) => self.performance.max_workers = Some(n),
                Err(_) => tracing::warn!("Ignoring EXPO_RECODER_WORKERS={}", workers),
            }
        }

        if let Ok(file) = std::env::var("EXPO_RECODER_PROGRESS_FILE") {
            self.progress.file = PathBuf::from(file);
        }

        if let Ok(level) = std::env::var("EXPO_RECODER_LOG_LEVEL") {
            self.output.log_level = level;
        }

        if let Ok(ffmpeg) = std::env::var("EXPO_RECODER_FFMPEG") {
            self.tools.ffmpeg_path = Some(PathBuf::from(ffmpeg));
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.performance.max_workers == Some(0) {
            return Err(anyhow!("max_workers must be greater than 0"));
        }
        if self.performance.worker_cap == 0 {
            return Err(anyhow!("worker_cap must be greater than 0"));
        }

        if !(1..=100).contains(&self.encoding.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be within 1..=100"));
        }
        if self.encoding.processed_suffix.is_empty() {
            return Err(anyhow!("processed_suffix must not be empty"));
        }
        if self.encoding.frame_rate == 0 {
            return Err(anyhow!("frame_rate must be greater than 0"));
        }

        let spec = &self.compliance;
        if spec.min_bitrate > spec.max_bitrate {
            return Err(anyhow!(
                "bitrate window is empty: {} > {}",
                spec.min_bitrate,
                spec.max_bitrate
            ));
        }
        check_pair("landscape", spec.landscape, |r| r.width >= r.height)?;
        check_pair("portrait", spec.portrait, |r| r.height >= r.width)?;

        if self.progress.max_attempts == 0 {
            return Err(anyhow!("progress.max_attempts must be greater than 0"));
        }

        Ok(())
    }

    /// Get runtime configuration summary
    pub fn summary(&self) -> String {
        format!(
            "Expo Recoder Configuration:\n\
            - Workers: {}\n\
            - Canonical: {} / {}\n\
            - Video bitrate window: {}-{} bps\n\
            - JPEG quality: {}\n\
            - Progress file: {}\n\
            - Clean destination: {}",
            self.performance.worker_count(),
            self.compliance.landscape,
            self.compliance.portrait,
            self.compliance.min_bitrate,
            self.compliance.max_bitrate,
            self.encoding.jpeg_quality,
            self.progress.file.display(),
            self.output.clean_destination
        )
    }
}

fn check_pair(label: &str, res: Resolution, ok: impl Fn(&Resolution) -> bool) -> Result<()> {
    if res.width == 0 || res.height == 0 || !ok(&res) {
        return Err(anyhow!("{} canonical resolution {} is not {}", label, res, label));
    }
    Ok(())
}

/// Configuration builder for programmatic config creation
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.config.performance.max_workers = Some(workers);
        self
    }

    pub fn with_compliance(mut self, spec: ComplianceSpec) -> Self {
        self.config.compliance = spec;
        self
    }

    pub fn with_canonical(mut self, landscape: Resolution, portrait: Resolution) -> Self {
        self.config.compliance.landscape = landscape;
        self.config.compliance.portrait = portrait;
        self
    }

    pub fn with_progress_file(mut self, file: PathBuf) -> Self {
        self.config.progress.file = file;
        self
    }

    pub fn with_ffmpeg(mut self, path: PathBuf) -> Self {
        self.config.tools.ffmpeg_path = Some(path);
        self
    }

    pub fn prefer_hardware(mut self, enable: bool) -> Self {
        self.config.encoding.prefer_hardware = enable;
        self
    }

    pub fn clean_destination(mut self, enable: bool) -> Self {
        self.config.output.clean_destination = enable;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
