//! External tool discovery and one-shot HEVC encoder selection.
//!
//! The encoder is chosen once per process by [`EncoderProfile::detect`] and
//! then handed to the video transcoder as plain configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{debug, info, warn};

use crate::config::{EncodingConfig, ToolsConfig};
use crate::error::{MediaError, Result};

/// Resolved locations of ffmpeg and ffprobe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolPaths {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl ToolPaths {
    /// Use configured paths when they exist, otherwise search `PATH`
    pub fn discover(tools: &ToolsConfig) -> Result<Self> {
        Ok(Self {
            ffmpeg: resolve("ffmpeg", tools.ffmpeg_path.as_deref())?,
            ffprobe: resolve("ffprobe", tools.ffprobe_path.as_deref())?,
        })
    }
}

fn resolve(name: &str, custom: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = custom {
        if p.exists() {
            return Ok(p.to_path_buf());
        }
        warn!("Configured {} path {} does not exist, searching PATH", name, p.display());
    }
    which::which(name).map_err(|_| MediaError::ToolMissing(name.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncoderBackend {
    Hardware,
    Software,
}

/// The HEVC encoder every video transcode in this run will use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncoderProfile {
    pub backend: EncoderBackend,
    pub encoder: String,
}

impl EncoderProfile {
    pub fn software(encoder: &str) -> Self {
        Self {
            backend: EncoderBackend::Software,
            encoder: encoder.to_string(),
        }
    }

    /// Probe the hardware candidates in order and fall back to software.
    ///
    /// A candidate must be listed by `ffmpeg -encoders` and survive a tiny
    /// trial encode; listing alone says nothing about the host GPU.
    pub async fn detect(ffmpeg: &Path, encoding: &EncodingConfig) -> Self {
        if !encoding.prefer_hardware || encoding.hardware_encoders.is_empty() {
            return Self::software(&encoding.software_encoder);
        }

        let listing = match list_encoders(ffmpeg).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!("Could not list ffmpeg encoders, using {}: {}", encoding.software_encoder, e);
                return Self::software(&encoding.software_encoder);
            }
        };

        for candidate in &encoding.hardware_encoders {
            if !encoder_listed(&listing, candidate) {
                debug!("Encoder {} not built into ffmpeg", candidate);
                continue;
            }
            if trial_encode(ffmpeg, candidate).await {
                info!("⚡ Hardware encoder selected: {}", candidate);
                return Self {
                    backend: EncoderBackend::Hardware,
                    encoder: candidate.clone(),
                };
            }
            debug!("Encoder {} failed the trial encode", candidate);
        }

        info!("🖥️ Using software encoder: {}", encoding.software_encoder);
        Self::software(&encoding.software_encoder)
    }

    pub fn is_hardware(&self) -> bool {
        self.backend == EncoderBackend::Hardware
    }
}

async fn list_encoders(ffmpeg: &Path) -> std::io::Result<String> {
    let output = tokio::process::Command::new(ffmpeg)
        .args(["-hide_banner", "-encoders"])
        .stdin(Stdio::null())
        .output()
        .await?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Match an encoder name against the second column of `ffmpeg -encoders`
pub fn encoder_listed(listing: &str, name: &str) -> bool {
    listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|n| n == name)
}

async fn trial_encode(ffmpeg: &Path, encoder: &str) -> bool {
    let status = tokio::process::Command::new(ffmpeg)
        .args([
            "-hide_banner",
            "-loglevel", "error",
            "-f", "lavfi",
            "-i", "color=c=black:s=256x256:d=0.1",
            "-c:v", encoder,
            "-f", "null",
            "-",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
    matches!(status, Ok(s) if s.success())
}
