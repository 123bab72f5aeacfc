//! Snapshot rows.
//!
//! One row per admitted frame. Written once, either directly or when the
//! spool is drained; afterwards only the text, embedding and storage
//! location columns change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bridge::{AppIdentity, TextBox};
use crate::sensing::PerceptualHash;
use crate::settings::SnapshotFormat;

/// Which path a row came in through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestSource {
    Direct,
    Spool,
}

impl IngestSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestSource::Direct => "direct",
            IngestSource::Spool => "spool",
        }
    }
}

/// Where a snapshot's files live, relative to the snapshot directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBlobs {
    pub image_path: String,
    pub thumbnail_path: Option<String>,
    pub encrypted: bool,
}

/// A snapshot about to be inserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSnapshot {
    pub captured_at: DateTime<Utc>,
    pub app: Option<AppIdentity>,
    pub byte_size: u64,
    pub width: u32,
    pub height: u32,
    pub format: SnapshotFormat,
    pub phash: PerceptualHash,
    pub blobs: StoredBlobs,
    pub source: IngestSource,
    /// Text recovered before insertion (spooled records carry it along).
    pub extracted_text: Option<String>,
    pub text_boxes: Vec<TextBox>,
    pub ocr_confidence: Option<f64>,
    pub ocr_word_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub id: i64,
    pub captured_at: DateTime<Utc>,
    pub app: Option<AppIdentity>,
    pub byte_size: u64,
    pub width: u32,
    pub height: u32,
    pub format: SnapshotFormat,
    pub phash: PerceptualHash,
    pub blobs: StoredBlobs,
    pub source: IngestSource,
    pub extracted_text: Option<String>,
    pub text_boxes: Vec<TextBox>,
    pub ocr_confidence: Option<f64>,
    pub ocr_word_count: Option<u64>,
    pub embedding_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}
