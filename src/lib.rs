//! Expo Recoder - exhibition media normalizer
//!
//! Checks every image and video of an exhibition batch against a fixed
//! delivery spec, recodes only what misses it, and reconciles the result
//! into the exhibition catalog.

pub mod atomic;
pub mod catalog;
pub mod compliance;
pub mod config;
pub mod encoder;
pub mod error;
pub mod media;
pub mod probe;
pub mod processing;
pub mod progress;
pub mod reconcile;
pub mod transcode;

// Re-export main types for easy access
pub use crate::catalog::Catalog;
pub use crate::compliance::{evaluate, ComplianceSpec, ProcessingDecision, Resolution, Violation};
pub use crate::config::{Config, ConfigBuilder};
pub use crate::encoder::{EncoderBackend, EncoderProfile, ToolPaths};
pub use crate::error::{MediaError, Result};
pub use crate::media::{MediaAsset, MediaKind, Orientation};
pub use crate::probe::{FfprobeProber, MediaProber};
pub use crate::processing::{AssetState, BatchProcessor, Outcome, ProcessingResult, RunSummary};
pub use crate::progress::{ProgressMonitor, ProgressSnapshot, ProgressStore, ProgressUpdate, RunWatch};
pub use crate::reconcile::{ReconcileSummary, Reconciler};
pub use crate::transcode::{ImageTranscoder, TranscodeAction, TranscodeOutput, VideoTranscoder};
