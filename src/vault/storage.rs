//! Snapshot image and thumbnail files.
//!
//! Plain files carry their format's extension; sealed files are `TSE1`
//! envelopes with a `.tse` extension. Paths handed to the store are relative
//! to the snapshot directory.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::bridge::{format_for_mime, mime_for, EncodedImage};
use crate::settings::SnapshotFormat;
use crate::utils::fs::write_atomic;

use super::envelope::{self, ContentKeyUnwrapper, ContentType, KekPublic};

pub const SEALED_EXTENSION: &str = "tse";

/// How new files are written. Chosen once per frame.
#[derive(Debug, Clone)]
pub enum StorageMode {
    Plain,
    Sealed(KekPublic),
}

impl StorageMode {
    pub fn is_sealed(&self) -> bool {
        matches!(self, StorageMode::Sealed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobRole {
    Image,
    Thumbnail,
}

#[derive(Debug, Clone)]
pub struct SnapshotFiles {
    root: PathBuf,
}

impl SnapshotFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Unique, time-sortable stem shared by a snapshot's image and thumbnail.
    pub fn new_stem(captured_at: DateTime<Utc>) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", captured_at.format("%Y%m%dT%H%M%S%.3fZ"), &suffix[..8])
    }

    /// Writes `image` atomically and returns its relative path.
    pub fn write(
        &self,
        stem: &str,
        role: BlobRole,
        image: &EncodedImage,
        mode: &StorageMode,
    ) -> Result<String> {
        let base = match role {
            BlobRole::Image => stem.to_string(),
            BlobRole::Thumbnail => format!("{stem}-thumb"),
        };
        self.write_named(&base, image, mode)
    }

    /// Re-stores an existing file under `mode`, keeping its base name.
    /// Returns the new relative path; the old file is left in place.
    pub fn rewrite(
        &self,
        relative: &str,
        mode: &StorageMode,
        keys: Option<&(dyn ContentKeyUnwrapper + Send + Sync)>,
    ) -> Result<String> {
        let image = self.read(relative, keys)?;
        let base = Path::new(relative)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| anyhow!("{relative} has no file stem"))?;
        self.write_named(base, &image, mode)
    }

    fn write_named(&self, base: &str, image: &EncodedImage, mode: &StorageMode) -> Result<String> {
        let (relative, bytes) = match mode {
            StorageMode::Plain => (
                format!("{base}.{}", extension_for(image.format)),
                image.bytes.clone(),
            ),
            StorageMode::Sealed(public) => {
                let content = ContentType::Image {
                    mime: image.mime().to_string(),
                    width: image.width,
                    height: image.height,
                };
                let sealed = envelope::seal(&image.bytes, content, public)
                    .context("failed to seal snapshot image")?;
                (format!("{base}.{SEALED_EXTENSION}"), sealed.to_bytes())
            }
        };

        write_atomic(&self.absolute(&relative), &bytes)?;
        Ok(relative)
    }

    /// Reads a file back to encoded image bytes, decrypting sealed files with
    /// `keys`.
    pub fn read(
        &self,
        relative: &str,
        keys: Option<&(dyn ContentKeyUnwrapper + Send + Sync)>,
    ) -> Result<EncodedImage> {
        let path = self.absolute(relative);
        let bytes = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;

        if !is_sealed_path(relative) {
            let format = format_for_extension(relative)
                .ok_or_else(|| anyhow!("unrecognized snapshot file {relative}"))?;
            let (width, height) = image::image_dimensions(&path)
                .with_context(|| format!("failed to probe {}", path.display()))?;
            return Ok(EncodedImage {
                bytes,
                width,
                height,
                format,
            });
        }

        let keys = keys.ok_or_else(|| anyhow!("{relative} is sealed and the vault is locked"))?;
        let (header, plain) = envelope::open(&bytes, keys)?;
        match header.content {
            ContentType::Image { mime, width, height } => Ok(EncodedImage {
                bytes: plain,
                width,
                height,
                format: format_for_mime(&mime).ok_or_else(|| anyhow!("unknown mime {mime}"))?,
            }),
            ContentType::Payload { payload_type } => {
                bail!("{relative} holds a {payload_type} payload, not an image")
            }
        }
    }

    /// Missing files are not an error.
    pub fn remove(&self, relative: &str) -> Result<()> {
        let path = self.absolute(relative);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}

pub fn is_sealed_path(relative: &str) -> bool {
    Path::new(relative).extension().and_then(|ext| ext.to_str()) == Some(SEALED_EXTENSION)
}

fn extension_for(format: SnapshotFormat) -> &'static str {
    match format {
        SnapshotFormat::Png => "png",
        SnapshotFormat::Jpeg => "jpg",
    }
}

fn format_for_extension(relative: &str) -> Option<SnapshotFormat> {
    match Path::new(relative).extension()?.to_str()? {
        "png" => Some(SnapshotFormat::Png),
        "jpg" | "jpeg" => Some(SnapshotFormat::Jpeg),
        _ => None,
    }
}

/// Mime type of a plain file, for callers that only have the path.
pub fn mime_for_path(relative: &str) -> Option<&'static str> {
    format_for_extension(relative).map(mime_for)
}
