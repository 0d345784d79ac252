use async_trait::async_trait;
use image::{ColorType, ImageFormat, ImageReader};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::debug;

use crate::error::{MediaError, Result};
use crate::media::{file_name_of, parse_frame_rate, MediaAsset, MediaKind};

/// Media inspection capability
#[async_trait]
pub trait MediaProber: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<MediaAsset>;
}

/// Probes videos with ffprobe and images with the `image` decoders
#[derive(Debug, Clone)]
pub struct FfprobeProber {
    ffprobe: PathBuf,
}

impl FfprobeProber {
    pub fn new(ffprobe: PathBuf) -> Self {
        Self { ffprobe }
    }

    async fn probe_video(&self, path: &Path) -> Result<MediaAsset> {
        let output = tokio::process::Command::new(&self.ffprobe)
            .arg("-v")
            .arg("quiet")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg("-show_streams")
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| MediaError::probe(path, format!("cannot run ffprobe: {}", e)))?;

        if !output.status.success() {
            return Err(MediaError::probe(path, format!("ffprobe exited with {}", output.status)));
        }

        let size_bytes = tokio::fs::metadata(path).await?.len();
        let json_str = String::from_utf8_lossy(&output.stdout);
        parse_ffprobe_output(path, &json_str, size_bytes)
    }
}

#[async_trait]
impl MediaProber for FfprobeProber {
    async fn probe(&self, path: &Path) -> Result<MediaAsset> {
        match MediaKind::from_path(path) {
            Some(MediaKind::Video) => self.probe_video(path).await,
            Some(MediaKind::Image) => {
                let owned = path.to_path_buf();
                tokio::task::spawn_blocking(move || probe_image(&owned))
                    .await
                    .map_err(|e| MediaError::decode(path, format!("probe task failed: {}", e)))?
            }
            None => Err(MediaError::probe(path, "unsupported file type")),
        }
    }
}

/// Read dimensions, container and color mode of an image file
pub fn probe_image(path: &Path) -> Result<MediaAsset> {
    let size_bytes = std::fs::metadata(path)?.len();
    let reader = ImageReader::open(path)?
        .with_guessed_format()
        .map_err(|e| MediaError::decode(path, e))?;
    let format = reader
        .format()
        .ok_or_else(|| MediaError::decode(path, "unrecognized image format"))?;
    let img = reader.decode().map_err(|e| MediaError::decode(path, e))?;

    let asset = MediaAsset {
        name: file_name_of(path),
        path: path.to_path_buf(),
        kind: MediaKind::Image,
        width: img.width(),
        height: img.height(),
        format: format_name(format),
        color_mode: Some(color_mode_name(img.color()).to_string()),
        codec: None,
        bitrate: None,
        duration: None,
        frame_rate: None,
        size_bytes,
    };

    debug!(
        "🖼️ Probed image: {} ({}x{}, {}, {})",
        asset.name,
        asset.width,
        asset.height,
        asset.format,
        asset.color_mode.as_deref().unwrap_or("?")
    );
    Ok(asset)
}

pub fn format_name(format: ImageFormat) -> String {
    match format {
        ImageFormat::Jpeg => "JPEG".to_string(),
        ImageFormat::Png => "PNG".to_string(),
        other => other
            .extensions_str()
            .first()
            .map(|ext| ext.to_ascii_uppercase())
            .unwrap_or_else(|| format!("{:?}", other).to_ascii_uppercase()),
    }
}

pub fn color_mode_name(color: ColorType) -> &'static str {
    match color {
        ColorType::L8 | ColorType::L16 => "L",
        ColorType::La8 | ColorType::La16 => "LA",
        ColorType::Rgb8 | ColorType::Rgb16 | ColorType::Rgb32F => "RGB",
        ColorType::Rgba8 | ColorType::Rgba16 | ColorType::Rgba32F => "RGBA",
        _ => "OTHER",
    }
}

/// Build a video asset from `ffprobe -show_format -show_streams` JSON.
///
/// Width and height are mandatory; an unreadable document or a file without
/// a video stream is a probe error rather than a guess.
pub fn parse_ffprobe_output(path: &Path, json_str: &str, size_bytes: u64) -> Result<MediaAsset> {
    let data: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| MediaError::probe(path, format!("unparseable ffprobe output: {}", e)))?;

    let format = &data["format"];
    let streams = data["streams"]
        .as_array()
        .ok_or_else(|| MediaError::probe(path, "no streams in ffprobe output"))?;

    let video_stream = streams
        .iter()
        .find(|s| s["codec_type"] == "video")
        .ok_or_else(|| MediaError::probe(path, "no video stream found"))?;

    let dimension = |key: &str| -> Result<u32> {
        video_stream[key]
            .as_u64()
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
            .ok_or_else(|| MediaError::probe(path, format!("missing {}", key)))
    };

    let width = dimension("width")?;
    let height = dimension("height")?;

    let frame_rate = video_stream["r_frame_rate"]
        .as_str()
        .and_then(parse_frame_rate)
        .filter(|fps| *fps > 0.0);

    let codec = video_stream["codec_name"].as_str().map(str::to_string);

    let bitrate = numeric_field(&format["bit_rate"])
        .or_else(|| numeric_field(&video_stream["bit_rate"]))
        .map(|b| b as u64);

    let duration = numeric_field(&format["duration"])
        .or_else(|| numeric_field(&video_stream["duration"]))
        .filter(|d| *d > 0.0);

    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    Ok(MediaAsset {
        name: file_name_of(path),
        path: path.to_path_buf(),
        kind: MediaKind::Video,
        width,
        height,
        format: extension,
        color_mode: None,
        codec,
        bitrate,
        duration,
        frame_rate,
        size_bytes,
    })
}

/// ffprobe reports numbers as strings, sometimes as `N/A`
fn numeric_field(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.trim().parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
