use serde::{Deserialize, Serialize};
use std::fmt;

use crate::media::{MediaAsset, MediaKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Delivery parameters every exhibited asset must meet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceSpec {
    /// Canonical landscape resolution
    pub landscape: Resolution,

    /// Canonical portrait resolution
    pub portrait: Resolution,

    /// Accepted image containers (compared case-insensitively)
    pub image_formats: Vec<String>,

    /// Required image color mode
    pub color_mode: String,

    /// Maximum image file size in bytes
    pub max_image_bytes: u64,

    /// Maximum video frame rate
    pub max_frame_rate: f64,

    /// Accepted video codecs, ffprobe naming
    pub video_codecs: Vec<String>,

    /// Inclusive bitrate window in bits per second
    pub min_bitrate: u64,
    pub max_bitrate: u64,
}

impl Default for ComplianceSpec {
    fn default() -> Self {
        Self {
            landscape: Resolution::new(3840, 2160),
            portrait: Resolution::new(2160, 3840),
            image_formats: vec!["JPEG".to_string(), "PNG".to_string()],
            color_mode: "RGB".to_string(),
            max_image_bytes: 10 * 1024 * 1024,
            max_frame_rate: 30.0,
            video_codecs: vec!["hevc".to_string(), "h264".to_string()],
            min_bitrate: 30_000_000,
            max_bitrate: 60_000_000,
        }
    }
}

impl ComplianceSpec {
    /// Target resolution for a source: landscape pair iff width >= height
    pub fn canonical_for(&self, width: u32, height: u32) -> Resolution {
        if width >= height {
            self.landscape
        } else {
            self.portrait
        }
    }

    pub fn is_canonical(&self, width: u32, height: u32) -> bool {
        let res = Resolution::new(width, height);
        res == self.landscape || res == self.portrait
    }

    fn accepts_format(&self, format: &str) -> bool {
        let format = normalize_format(format);
        self.image_formats
            .iter()
            .any(|f| normalize_format(f) == format)
    }

    fn accepts_codec(&self, codec: &str) -> bool {
        self.video_codecs
            .iter()
            .any(|c| c.eq_ignore_ascii_case(codec))
    }
}

fn normalize_format(format: &str) -> String {
    let upper = format.trim().to_ascii_uppercase();
    if upper == "JPG" {
        "JPEG".to_string()
    } else {
        upper
    }
}

/// One unmet delivery constraint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Violation {
    Resolution { width: u32, height: u32 },
    Container(String),
    ColorMode(String),
    FileSize { bytes: u64, max: u64 },
    FrameRate(f64),
    FrameRateUnknown,
    Codec(String),
    CodecUnknown,
    Bitrate(u64),
    BitrateUnknown,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolution { width, height } => write!(f, "resolution {}x{}", width, height),
            Self::Container(c) => write!(f, "container {}", c),
            Self::ColorMode(m) => write!(f, "color mode {}", m),
            Self::FileSize { bytes, max } => {
                write!(f, "size {:.2}KB over {:.2}KB", *bytes as f64 / 1024.0, *max as f64 / 1024.0)
            }
            Self::FrameRate(fps) => write!(f, "frame rate {:.2}", fps),
            Self::FrameRateUnknown => f.write_str("frame rate unknown"),
            Self::Codec(c) => write!(f, "codec {}", c),
            Self::CodecUnknown => f.write_str("codec unknown"),
            Self::Bitrate(b) => write!(f, "bitrate {} bps", b),
            Self::BitrateUnknown => f.write_str("bitrate unknown"),
        }
    }
}

/// Outcome of checking one asset against a `ComplianceSpec`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingDecision {
    pub compliant: bool,
    pub violations: Vec<Violation>,
}

impl ProcessingDecision {
    fn from_violations(violations: Vec<Violation>) -> Self {
        Self {
            compliant: violations.is_empty(),
            violations,
        }
    }

    pub fn reasons(&self) -> String {
        self.violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Decide whether an asset can ship as-is.
///
/// Violations are reported in a fixed order: resolution, container, color
/// mode, size, frame rate, codec, bitrate.
pub fn evaluate(asset: &MediaAsset, spec: &ComplianceSpec) -> ProcessingDecision {
    let mut violations = Vec::new();

    if !spec.is_canonical(asset.width, asset.height) {
        violations.push(Violation::Resolution {
            width: asset.width,
            height: asset.height,
        });
    }

    match asset.kind {
        MediaKind::Image => {
            if !spec.accepts_format(&asset.format) {
                violations.push(Violation::Container(asset.format.clone()));
            }
            let mode = asset.color_mode.as_deref().unwrap_or("unknown");
            if mode != spec.color_mode {
                violations.push(Violation::ColorMode(mode.to_string()));
            }
            if asset.size_bytes > spec.max_image_bytes {
                violations.push(Violation::FileSize {
                    bytes: asset.size_bytes,
                    max: spec.max_image_bytes,
                });
            }
        }
        MediaKind::Video => {
            match asset.frame_rate {
                Some(fps) if fps > spec.max_frame_rate => violations.push(Violation::FrameRate(fps)),
                Some(_) => {}
                None => violations.push(Violation::FrameRateUnknown),
            }
            match asset.codec.as_deref() {
                Some(codec) if !spec.accepts_codec(codec) => {
                    violations.push(Violation::Codec(codec.to_string()))
                }
                Some(_) => {}
                None => violations.push(Violation::CodecUnknown),
            }
            match asset.bitrate {
                Some(b) if b < spec.min_bitrate || b > spec.max_bitrate => {
                    violations.push(Violation::Bitrate(b))
                }
                Some(_) => {}
                None => violations.push(Violation::BitrateUnknown),
            }
        }
    }

    ProcessingDecision::from_violations(violations)
}
