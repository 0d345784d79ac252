use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Image extensions picked up from the source directory
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

/// Video extensions picked up from the source directory
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mov", "m4v"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classify a path by its extension, `None` for anything we don't handle
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else {
            None
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Orientation {
    Landscape,
    Portrait,
}

impl Orientation {
    /// Orientation as recorded in reports: landscape iff strictly wider than tall
    pub fn of(width: u32, height: u32) -> Self {
        if width > height {
            Self::Landscape
        } else {
            Self::Portrait
        }
    }

    /// Single-letter code used in the catalog columns
    pub fn code(&self) -> &'static str {
        match self {
            Self::Landscape => "H",
            Self::Portrait => "V",
        }
    }
}

/// Measured attributes of one probed file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub name: String,
    pub path: PathBuf,
    pub kind: MediaKind,
    pub width: u32,
    pub height: u32,
    /// Container: `JPEG`/`PNG`/... for images, the file extension for videos
    pub format: String,
    /// Pixel layout reported by the decoder (images only)
    pub color_mode: Option<String>,
    /// Video stream codec name as reported by ffprobe
    pub codec: Option<String>,
    /// Overall bitrate in bits per second
    pub bitrate: Option<u64>,
    /// Duration in seconds
    pub duration: Option<f64>,
    pub frame_rate: Option<f64>,
    pub size_bytes: u64,
}

impl MediaAsset {
    pub fn orientation(&self) -> Orientation {
        Orientation::of(self.width, self.height)
    }

    pub fn size_mb(&self) -> f64 {
        self.size_bytes as f64 / (1024.0 * 1024.0)
    }
}

/// Parse an ffprobe rational such as `30000/1001` or a plain decimal.
///
/// Returns `None` for malformed input and for a zero denominator.
pub fn parse_frame_rate(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    match raw.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            if den == 0.0 {
                None
            } else {
                Some(num / den)
            }
        }
        None => raw.parse().ok().filter(|v: &f64| v.is_finite()),
    }
}

/// File name of a path as an owned string
pub fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}

/// Images and videos directly inside `dir`, sorted by file name.
///
/// Subdirectories, hidden files and unknown extensions are skipped.
pub async fn discover_media(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if file_name_of(&path).starts_with('.') {
            continue;
        }
        if MediaKind::from_path(&path).is_some() {
            found.push(path);
        } else {
            tracing::debug!("Skipping unsupported file: {}", path.display());
        }
    }

    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rate_parsing() {
        assert_eq!(parse_frame_rate("25/1"), Some(25.0));
        assert_eq!(parse_frame_rate("30"), Some(30.0));
        let ntsc = parse_frame_rate("30000/1001").unwrap();
        assert!((ntsc - 29.97).abs() < 0.01);
        assert_eq!(parse_frame_rate("0/0"), None);
        assert_eq!(parse_frame_rate("__import__('os')"), None);
        assert_eq!(parse_frame_rate(""), None);
    }

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(MediaKind::from_path(Path::new("a/E1_P001_x.JPG")), Some(MediaKind::Image));
        assert_eq!(MediaKind::from_path(Path::new("clip.mp4")), Some(MediaKind::Video));
        assert_eq!(MediaKind::from_path(Path::new("notes.txt")), None);
        assert_eq!(MediaKind::from_path(Path::new("README")), None);
    }

    #[test]
    fn test_orientation() {
        assert_eq!(Orientation::of(3840, 2160), Orientation::Landscape);
        assert_eq!(Orientation::of(2160, 3840), Orientation::Portrait);
        assert_eq!(Orientation::of(100, 100), Orientation::Portrait);
        assert_eq!(Orientation::Landscape.code(), "H");
    }

    #[tokio::test]
    async fn test_discover_media_is_flat_and_sorted() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in ["E1_P002_b.mp4", "E1_P001_a.PNG", "notes.txt", ".hidden.jpg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.jpg")).unwrap();

        let found = discover_media(dir.path()).await.unwrap();
        let names: Vec<String> = found.iter().map(|p| file_name_of(p)).collect();
        assert_eq!(names, vec!["E1_P001_a.PNG", "E1_P002_b.mp4"]);
    }
}
