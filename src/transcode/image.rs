use ::image::imageops::{self, FilterType};
use jpeg_encoder::{ColorType, Density, Encoder};
use std::path::{Path, PathBuf};
use tracing::info;

use super::{processed_name, TranscodeAction, TranscodeOutput};
use crate::atomic::write_atomic;
use crate::compliance::ComplianceSpec;
use crate::config::EncodingConfig;
use crate::error::{MediaError, Result};
use crate::media::MediaAsset;

/// Re-encodes non-compliant images to canonical-size progressive JPEG
#[derive(Debug, Clone)]
pub struct ImageTranscoder {
    spec: ComplianceSpec,
    quality: u8,
    dpi: u16,
    suffix: String,
}

impl ImageTranscoder {
    pub fn new(spec: ComplianceSpec, encoding: &EncodingConfig) -> Self {
        Self {
            spec,
            quality: encoding.jpeg_quality,
            dpi: encoding.jpeg_dpi,
            suffix: encoding.processed_suffix.clone(),
        }
    }

    pub fn output_path(&self, asset: &MediaAsset, dest_dir: &Path) -> PathBuf {
        dest_dir.join(processed_name(&asset.name, &self.suffix, "jpg"))
    }

    /// Convert to RGB, resize to the orientation-matched canonical pair and
    /// write `<stem>-processed.jpg`. Blocking; run it off the async workers.
    pub fn transcode(&self, asset: &MediaAsset, dest_dir: &Path) -> Result<TranscodeOutput> {
        let img = ::image::open(&asset.path).map_err(|e| MediaError::decode(&asset.path, e))?;
        let rgb = img.to_rgb8();

        let target = self.spec.canonical_for(rgb.width(), rgb.height());
        let rgb = if (rgb.width(), rgb.height()) == (target.width, target.height) {
            rgb
        } else {
            imageops::resize(&rgb, target.width, target.height, FilterType::Lanczos3)
        };

        let output = self.output_path(asset, dest_dir);
        let encode_error = |message: String| MediaError::Encode {
            path: output.clone(),
            status: "jpeg encoder".to_string(),
            diagnostic: message,
        };

        let width = u16::try_from(rgb.width()).map_err(|_| encode_error("width exceeds JPEG limit".into()))?;
        let height = u16::try_from(rgb.height()).map_err(|_| encode_error("height exceeds JPEG limit".into()))?;

        let mut buf = Vec::new();
        let mut encoder = Encoder::new(&mut buf, self.quality);
        encoder.set_progressive(true);
        encoder.set_optimized_huffman_tables(true);
        encoder.set_density(Density::Inch {
            x: self.dpi,
            y: self.dpi,
        });
        encoder
            .encode(rgb.as_raw(), width, height, ColorType::Rgb)
            .map_err(|e| encode_error(e.to_string()))?;

        write_atomic(&output, &buf)?;

        info!("🖼️ Image processed: {} -> {} ({})", asset.name, output.display(), target);
        Ok(TranscodeOutput {
            source: asset.name.clone(),
            output,
            action: TranscodeAction::Transcoded,
        })
    }
}
