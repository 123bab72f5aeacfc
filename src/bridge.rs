//! Capabilities supplied by the host platform.
//!
//! The core never captures pixels, runs OCR or reads sensors itself; it talks
//! to these traits. Implementations must be cheap to share across tasks.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::sensing::{Frame, ThermalLevel};
use crate::settings::SnapshotFormat;

/// The frontmost application at the time a frame arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppIdentity {
    pub bundle_id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeParams {
    pub format: SnapshotFormat,
    pub quality: u8,
    pub max_dimension: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: SnapshotFormat,
}

impl EncodedImage {
    pub fn mime(&self) -> &'static str {
        mime_for(self.format)
    }
}

pub fn mime_for(format: SnapshotFormat) -> &'static str {
    match format {
        SnapshotFormat::Png => "image/png",
        SnapshotFormat::Jpeg => "image/jpeg",
    }
}

pub fn format_for_mime(mime: &str) -> Option<SnapshotFormat> {
    match mime {
        "image/png" => Some(SnapshotFormat::Png),
        "image/jpeg" => Some(SnapshotFormat::Jpeg),
        _ => None,
    }
}

/// A positioned run of recognized text, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextBox {
    pub text: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextExtraction {
    pub text: String,
    pub confidence: f64,
    pub word_count: u64,
    pub boxes: Vec<TextBox>,
}

/// Turns a raw frame into a compressed image.
pub trait ImageEncoder: Send + Sync {
    fn encode(&self, frame: &Frame, params: &EncodeParams) -> Result<EncodedImage>;

    fn thumbnail(&self, frame: &Frame, max_dimension: u32) -> Result<EncodedImage>;
}

pub trait TextExtractor: Send + Sync {
    fn extract(&self, frame: &Frame) -> Result<TextExtraction>;
}

/// Answers "which app is in front right now" without looking at pixels.
pub trait ForegroundProbe: Send + Sync {
    fn frontmost_app(&self) -> Option<AppIdentity>;
}

/// Coarse system heat-pressure signal.
pub trait ThermalSource: Send + Sync {
    fn current_level(&self) -> ThermalLevel;
}

/// Probe for hosts that cannot report the frontmost app.
pub struct NoForegroundProbe;

impl ForegroundProbe for NoForegroundProbe {
    fn frontmost_app(&self) -> Option<AppIdentity> {
        None
    }
}
