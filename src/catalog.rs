//! The tabular asset catalog and the report derived from it.
//!
//! A catalog is an ordered CSV table keyed by the `FILE_NAME` column. Every
//! other column is carried through untouched, whatever its name.

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::atomic::write_atomic;
use crate::error::{MediaError, Result};
use crate::media::MediaAsset;
use crate::probe::MediaProber;

pub const FILE_NAME: &str = "FILE_NAME";
pub const KIND: &str = "KIND";
pub const SCREEN_NUMBER: &str = "SCREEN_NUMBER";
pub const PROCESSED: &str = "PROCESSED";
pub const RECODED_SUFFIX: &str = "_RECODED";

/// Measured attribute columns, in report order
pub const ATTRIBUTE_COLUMNS: [&str; 10] = [
    "WIDTH",
    "HEIGHT",
    "ORIENTATION",
    "FORMAT",
    "SIZE_MB",
    "DURATION_SEC",
    "FPS",
    "BITRATE",
    "VIDEO_CODEC",
    "COLOR_MODE",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Catalog {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    /// Read a catalog; it must have a `FILE_NAME` column
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| MediaError::Catalog(format!("cannot open {}: {}", path.display(), e)))?;

        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();
        let mut catalog = Self::new(headers);
        if catalog.column(FILE_NAME).is_none() {
            return Err(MediaError::Catalog(format!(
                "{} has no {} column",
                path.display(),
                FILE_NAME
            )));
        }

        for record in reader.records() {
            let record = record?;
            catalog.push_row(record.iter().map(str::to_string).collect());
        }

        info!("📒 Catalog loaded: {} rows from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    /// Rewrite the whole table at `path` in one rename
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| MediaError::Catalog(format!("cannot serialize catalog: {}", e)))?;
        write_atomic(path, &bytes)
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Index of `name`, appending an empty column when missing
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column(name) {
            return idx;
        }
        self.headers.push(name.to_string());
        for row in &mut self.rows {
            row.push(String::new());
        }
        self.headers.len() - 1
    }

    /// Append a row, padded or truncated to the header width
    pub fn push_row(&mut self, mut row: Vec<String>) {
        if row.len() > self.headers.len() {
            warn!("Catalog row has {} fields, dropping extras beyond {}", row.len(), self.headers.len());
        }
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
    }

    pub fn get(&self, row: usize, column: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn set(&mut self, row: usize, column: usize, value: impl Into<String>) {
        if let Some(cell) = self.rows.get_mut(row).and_then(|r| r.get_mut(column)) {
            *cell = value.into();
        }
    }

    /// Value of `column` in `row` by header name
    pub fn value(&self, row: usize, column: &str) -> Option<&str> {
        self.column(column).map(|c| self.get(row, c))
    }

    /// File name of each row, in table order
    pub fn file_names(&self) -> Vec<String> {
        match self.column(FILE_NAME) {
            Some(c) => (0..self.rows.len()).map(|r| self.get(r, c).trim().to_string()).collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn rows_mut(&mut self) -> &mut Vec<Vec<String>> {
        &mut self.rows
    }

    /// Initial catalog describing freshly probed assets
    pub fn from_assets(assets: &[MediaAsset]) -> Self {
        let mut headers = vec![FILE_NAME.to_string(), KIND.to_string()];
        headers.extend(ATTRIBUTE_COLUMNS.iter().map(|c| c.to_string()));
        headers.push(SCREEN_NUMBER.to_string());

        let mut catalog = Self::new(headers);
        for asset in assets {
            let mut row = vec![asset.name.clone(), asset.kind.label().to_string()];
            row.extend(attribute_values(asset).into_iter().map(|(_, v)| v));
            row.push(slot_number(&asset.name).map(|n| n.to_string()).unwrap_or_default());
            catalog.push_row(row);
        }
        catalog
    }
}

/// Probe every media file in `dir` into a bootstrap catalog.
///
/// Files that cannot be probed are skipped with a warning.
pub async fn build_from_directory(dir: &Path, prober: &dyn MediaProber) -> Result<Catalog> {
    let paths = crate::media::discover_media(dir).await?;
    let mut assets = Vec::with_capacity(paths.len());
    for path in &paths {
        match prober.probe(path).await {
            Ok(asset) => assets.push(asset),
            Err(e) => warn!("⚠️ Leaving {} out of the catalog: {}", path.display(), e),
        }
    }
    Ok(Catalog::from_assets(&assets))
}

/// Attribute values as written into the catalog and `_RECODED` columns
pub fn attribute_values(asset: &MediaAsset) -> Vec<(&'static str, String)> {
    let opt_f64 = |v: Option<f64>| v.map(|v| format!("{:.2}", v)).unwrap_or_default();
    let values = [
        asset.width.to_string(),
        asset.height.to_string(),
        asset.orientation().code().to_string(),
        asset.format.clone(),
        format!("{:.2}", asset.size_mb()),
        opt_f64(asset.duration),
        opt_f64(asset.frame_rate),
        asset.bitrate.map(|b| b.to_string()).unwrap_or_default(),
        asset.codec.clone().unwrap_or_default(),
        asset.color_mode.clone().unwrap_or_default(),
    ];
    ATTRIBUTE_COLUMNS.iter().copied().zip(values).collect()
}

/// Screen slot encoded in a file name as `_P<three digits>_`
pub fn slot_number(name: &str) -> Option<u32> {
    static SLOT: OnceLock<Option<Regex>> = OnceLock::new();
    let re = SLOT.get_or_init(|| Regex::new(r"_P(\d{3})_").ok()).as_ref()?;
    re.captures(name)?.get(1)?.as_str().parse().ok()
}
