//! Per-asset output production: byte copies for compliant assets, encoder
//! runs for the rest. Every path returns the output location explicitly so
//! reconciliation never has to guess file names.

pub mod image;
pub mod video;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::Result;
use crate::media::MediaAsset;

pub use self::image::ImageTranscoder;
pub use self::video::VideoTranscoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TranscodeAction {
    Copied,
    Transcoded,
}

/// Where an asset ended up in the destination directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscodeOutput {
    pub source: String,
    pub output: PathBuf,
    pub action: TranscodeAction,
}

/// `<stem><suffix>.<extension>` for a transcoded output
pub fn processed_name(name: &str, suffix: &str, extension: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string());
    format!("{}{}.{}", stem, suffix, extension)
}

/// Copy a compliant asset byte for byte under its unchanged name
pub async fn copy_unchanged(asset: &MediaAsset, dest_dir: &Path) -> Result<TranscodeOutput> {
    let output = dest_dir.join(&asset.name);
    tokio::fs::copy(&asset.path, &output).await?;
    info!("📋 Copied unchanged: {}", asset.name);
    Ok(TranscodeOutput {
        source: asset.name.clone(),
        output,
        action: TranscodeAction::Copied,
    })
}
