//! Merges what actually landed in the destination directory back into the
//! catalog, producing the delivery report.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::catalog::{attribute_values, slot_number, Catalog, ATTRIBUTE_COLUMNS, FILE_NAME, PROCESSED, RECODED_SUFFIX};
use crate::error::Result;
use crate::media::{discover_media, file_name_of, MediaAsset};
use crate::probe::MediaProber;

pub const PROCESSED_YES: &str = "yes";
pub const PROCESSED_NO: &str = "no";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub rows: usize,
    pub processed: usize,
    /// Catalog rows without a matching output
    pub missing: Vec<String>,
}

/// Re-probes a destination directory and annotates catalog rows
pub struct Reconciler<'a> {
    prober: &'a dyn MediaProber,
    suffix: String,
}

/// Destination files, indexed for the two name lookups. A file that could
/// not be re-probed is still present, with no measurements.
struct DestinationIndex {
    by_name: HashMap<String, Option<MediaAsset>>,
    /// Original stem -> file name, for `<stem><suffix>.<ext>` outputs
    by_source_stem: HashMap<String, String>,
    /// Files another row produced explicitly; name fallbacks skip them
    claimed: HashSet<String>,
}

impl DestinationIndex {
    fn lookup(&self, source: &str, explicit: Option<&PathBuf>) -> Option<&Option<MediaAsset>> {
        if let Some(path) = explicit {
            if let Some(entry) = self.by_name.get(&file_name_of(path)) {
                return Some(entry);
            }
        }
        let fallback = |name: &str| {
            if self.claimed.contains(name) {
                None
            } else {
                self.by_name.get(name)
            }
        };
        if let Some(entry) = fallback(source) {
            return Some(entry);
        }
        self.by_source_stem.get(&stem_of(source)).and_then(|name| fallback(name.as_str()))
    }
}

impl<'a> Reconciler<'a> {
    pub fn new(prober: &'a dyn MediaProber, suffix: impl Into<String>) -> Self {
        Self {
            prober,
            suffix: suffix.into(),
        }
    }

    /// Load the catalog, reconcile it against `dest_dir` and rewrite `report`
    pub async fn run(
        &self,
        catalog_path: &Path,
        report: &Path,
        dest_dir: &Path,
        outputs: &HashMap<String, PathBuf>,
    ) -> Result<ReconcileSummary> {
        let mut catalog = Catalog::from_path(catalog_path)?;
        let summary = self.reconcile(&mut catalog, dest_dir, outputs).await?;
        catalog.write(report)?;
        info!(
            "📊 Report written: {} ({}/{} processed)",
            report.display(),
            summary.processed,
            summary.rows
        );
        Ok(summary)
    }

    /// Annotate `catalog` in place.
    ///
    /// `outputs` maps source names to the file a transcoder produced; rows
    /// not in it fall back to the unchanged name, then to the processed
    /// marker with any extension.
    pub async fn reconcile(
        &self,
        catalog: &mut Catalog,
        dest_dir: &Path,
        outputs: &HashMap<String, PathBuf>,
    ) -> Result<ReconcileSummary> {
        let mut index = self.index_destination(dest_dir).await?;
        index.claimed = outputs.values().map(|path| file_name_of(path)).collect();

        let file_col = catalog.ensure_column(FILE_NAME);
        let processed_col = catalog.ensure_column(PROCESSED);
        let recoded_cols: Vec<usize> = ATTRIBUTE_COLUMNS
            .iter()
            .map(|attr| catalog.ensure_column(&format!("{}{}", attr, RECODED_SUFFIX)))
            .collect();

        let mut summary = ReconcileSummary {
            rows: catalog.len(),
            ..ReconcileSummary::default()
        };

        for row in 0..catalog.len() {
            let source = catalog.get(row, file_col).trim().to_string();
            match index.lookup(&source, outputs.get(&source)) {
                Some(Some(asset)) => {
                    catalog.set(row, processed_col, PROCESSED_YES);
                    for (col, (_, value)) in recoded_cols.iter().zip(attribute_values(asset)) {
                        catalog.set(row, *col, value);
                    }
                    summary.processed += 1;
                }
                Some(None) => {
                    catalog.set(row, processed_col, PROCESSED_YES);
                    for col in &recoded_cols {
                        catalog.set(row, *col, "");
                    }
                    summary.processed += 1;
                }
                None => {
                    catalog.set(row, processed_col, PROCESSED_NO);
                    for col in &recoded_cols {
                        catalog.set(row, *col, "");
                    }
                    summary.missing.push(source);
                }
            }
        }

        sort_by_slot(catalog, file_col);

        if !summary.missing.is_empty() {
            warn!("⚠️ {} catalog rows have no output: {}", summary.missing.len(), summary.missing.join(", "));
        }
        Ok(summary)
    }

    async fn index_destination(&self, dest_dir: &Path) -> Result<DestinationIndex> {
        let mut index = DestinationIndex {
            by_name: HashMap::new(),
            by_source_stem: HashMap::new(),
            claimed: HashSet::new(),
        };

        for path in discover_media(dest_dir).await? {
            let name = file_name_of(&path);
            let asset = match self.prober.probe(&path).await {
                Ok(asset) => {
                    debug!("Re-probed output {}", name);
                    Some(asset)
                }
                Err(e) => {
                    warn!("Cannot re-probe {}, recoded attributes left empty: {}", path.display(), e);
                    None
                }
            };
            if let Some(source_stem) = stem_of(&name).strip_suffix(self.suffix.as_str()) {
                index.by_source_stem.insert(source_stem.to_string(), name.clone());
            }
            index.by_name.insert(name, asset);
        }

        Ok(index)
    }
}

fn stem_of(name: &str) -> String {
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| name.to_string())
}

/// Stable order by screen slot; rows without one go last in their prior order
fn sort_by_slot(catalog: &mut Catalog, file_col: usize) {
    catalog.rows_mut().sort_by_key(|row| {
        let slot = row.get(file_col).and_then(|name| slot_number(name));
        (slot.is_none(), slot.unwrap_or(0))
    });
}
