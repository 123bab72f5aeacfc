//! The single write path into the searchable store.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Instant,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use crate::bridge::{AppIdentity, EncodedImage, TextExtraction, TextExtractor};
use crate::db::{Database, IngestSource, PendingSnapshot, SnapshotRecord, StoredBlobs};
use crate::metrics::MetricsCollector;
use crate::sensing::{CooldownGate, Frame, PerceptualHash};
use crate::vault::{
    envelope::ContentKeyUnwrapper,
    spool::{QueueRecord, RecordSink},
    storage::{BlobRole, SnapshotFiles, StorageMode},
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_warn};

const THUMBNAIL_CACHE_CAPACITY: usize = 256;

/// Metadata of an admitted frame.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    pub captured_at: DateTime<Utc>,
    pub app: Option<AppIdentity>,
    pub phash: PerceptualHash,
    pub source: IngestSource,
    /// Text already extracted (spooled records).
    pub extraction: Option<TextExtraction>,
}

#[derive(Debug, Clone)]
pub struct SnapshotContent {
    pub image: EncodedImage,
    pub thumbnail: Option<EncodedImage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    Extracted { word_count: u64 },
    /// A thermal cooldown was active. Not retried.
    SkippedCooldown,
}

/// Decrypted thumbnails, kept only while the vault is unlocked.
pub struct ThumbnailCache {
    entries: Mutex<CacheEntries>,
    capacity: usize,
}

#[derive(Default)]
struct CacheEntries {
    images: HashMap<i64, Arc<EncodedImage>>,
    order: VecDeque<i64>,
    /// Bumped by `clear`.
    generation: u64,
}

impl ThumbnailCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(CacheEntries::default()),
            capacity,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheEntries> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn get(&self, id: i64) -> Option<Arc<EncodedImage>> {
        self.lock().images.get(&id).cloned()
    }

    /// Token for `insert_if_current`; take it before starting a decrypt.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Inserts unless `clear` ran since `generation` was read. Returns
    /// whether the image was cached.
    pub fn insert_if_current(&self, id: i64, image: Arc<EncodedImage>, generation: u64) -> bool {
        let mut entries = self.lock();
        if entries.generation != generation {
            return false;
        }
        self.insert_locked(&mut entries, id, image);
        true
    }

    /// Evicts the oldest entry once full.
    pub fn insert(&self, id: i64, image: Arc<EncodedImage>) {
        let mut entries = self.lock();
        self.insert_locked(&mut entries, id, image);
    }

    fn insert_locked(&self, entries: &mut CacheEntries, id: i64, image: Arc<EncodedImage>) {
        if entries.images.insert(id, image).is_none() {
            entries.order.push_back(id);
        }
        while entries.order.len() > self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.images.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.images.clear();
        entries.order.clear();
        entries.generation = entries.generation.wrapping_add(1);
    }
}

#[derive(Clone)]
pub struct Indexer {
    db: Database,
    files: SnapshotFiles,
    extractor: Arc<dyn TextExtractor>,
    cooldown: Arc<CooldownGate>,
    thumbnails: Arc<ThumbnailCache>,
    metrics: MetricsCollector,
}

impl Indexer {
    pub fn new(
        db: Database,
        files: SnapshotFiles,
        extractor: Arc<dyn TextExtractor>,
        cooldown: Arc<CooldownGate>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            db,
            files,
            extractor,
            cooldown,
            thumbnails: Arc::new(ThumbnailCache::new(THUMBNAIL_CACHE_CAPACITY)),
            metrics,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn files(&self) -> &SnapshotFiles {
        &self.files
    }

    pub fn thumbnail_cache(&self) -> &ThumbnailCache {
        &self.thumbnails
    }

    /// Writes the snapshot's files, then inserts its row. Each call produces
    /// exactly one row; if the insert fails the files are removed again.
    pub async fn persist(
        &self,
        snapshot: NewSnapshot,
        content: SnapshotContent,
        mode: &StorageMode,
    ) -> Result<i64> {
        let stem = SnapshotFiles::new_stem(snapshot.captured_at);
        let image_path = self
            .files
            .write(&stem, BlobRole::Image, &content.image, mode)
            .context("failed to store snapshot image")?;

        let thumbnail_path = match &content.thumbnail {
            Some(thumbnail) => match self.files.write(&stem, BlobRole::Thumbnail, thumbnail, mode) {
                Ok(path) => Some(path),
                Err(err) => {
                    self.discard_files(&image_path, None);
                    return Err(err.context("failed to store thumbnail"));
                }
            },
            None => None,
        };

        let extraction = snapshot.extraction;
        let pending = PendingSnapshot {
            captured_at: snapshot.captured_at,
            app: snapshot.app,
            byte_size: content.image.bytes.len() as u64,
            width: content.image.width,
            height: content.image.height,
            format: content.image.format,
            phash: snapshot.phash,
            blobs: StoredBlobs {
                image_path: image_path.clone(),
                thumbnail_path: thumbnail_path.clone(),
                encrypted: mode.is_sealed(),
            },
            source: snapshot.source,
            extracted_text: extraction.as_ref().map(|e| e.text.clone()),
            ocr_confidence: extraction.as_ref().map(|e| e.confidence),
            ocr_word_count: extraction.as_ref().map(|e| e.word_count),
            text_boxes: extraction.map(|e| e.boxes).unwrap_or_default(),
        };

        match self.db.insert_snapshot(&pending).await {
            Ok(id) => {
                log_debug!("persisted snapshot {} ({:?})", id, pending.source);
                Ok(id)
            }
            Err(err) => {
                self.discard_files(&image_path, thumbnail_path.as_deref());
                Err(err)
            }
        }
    }

    fn discard_files(&self, image: &str, thumbnail: Option<&str>) {
        for path in std::iter::once(image).chain(thumbnail) {
            if let Err(err) = self.files.remove(path) {
                log_warn!("failed to remove orphaned {}: {err:#}", path);
            }
        }
    }

    /// Runs text extraction unless a thermal cooldown is active.
    pub async fn extract(&self, frame: Frame) -> Result<Option<TextExtraction>> {
        self.extract_at(frame, Instant::now()).await
    }

    pub async fn extract_at(&self, frame: Frame, now: Instant) -> Result<Option<TextExtraction>> {
        let indexer = self.clone();
        tokio::task::spawn_blocking(move || indexer.extract_blocking(&frame, now))
            .await
            .context("text extraction worker join failed")?
    }

    /// Synchronous form for callers already on a blocking thread.
    pub fn extract_blocking(&self, frame: &Frame, now: Instant) -> Result<Option<TextExtraction>> {
        if self.cooldown.is_active_at(now) {
            self.metrics.record_extraction(false);
            log_debug!("text extraction skipped: thermal cooldown");
            return Ok(None);
        }

        let extraction = self.extractor.extract(frame)?;
        self.metrics.record_extraction(true);
        Ok(Some(extraction))
    }

    /// Attaches extracted text to an existing row.
    pub async fn complete_text_extraction(&self, id: i64, frame: Frame) -> Result<ExtractionOutcome> {
        self.complete_text_extraction_at(id, frame, Instant::now())
            .await
    }

    pub async fn complete_text_extraction_at(
        &self,
        id: i64,
        frame: Frame,
        now: Instant,
    ) -> Result<ExtractionOutcome> {
        match self.extract_at(frame, now).await? {
            Some(extraction) => {
                self.db.update_extracted_text(id, &extraction).await?;
                Ok(ExtractionOutcome::Extracted {
                    word_count: extraction.word_count,
                })
            }
            None => Ok(ExtractionOutcome::SkippedCooldown),
        }
    }

    pub async fn attach_embedding(&self, id: i64, reference: &str) -> Result<()> {
        self.db.attach_embedding(id, reference).await
    }

    pub async fn snapshot(&self, id: i64) -> Result<Option<SnapshotRecord>> {
        self.db.get_snapshot(id).await
    }

    /// Full image of a snapshot. Sealed images need `keys`.
    pub async fn load_image(
        &self,
        id: i64,
        keys: Option<&(dyn ContentKeyUnwrapper + Send + Sync)>,
    ) -> Result<Option<EncodedImage>> {
        match self.db.get_snapshot(id).await? {
            Some(record) => self.files.read(&record.blobs.image_path, keys).map(Some),
            None => Ok(None),
        }
    }

    /// Thumbnail of a snapshot, served from the cache when possible. Only
    /// images decrypted with `keys` are cached.
    pub async fn thumbnail(
        &self,
        id: i64,
        keys: Option<&(dyn ContentKeyUnwrapper + Send + Sync)>,
    ) -> Result<Option<Arc<EncodedImage>>> {
        if let Some(hit) = self.thumbnails.get(id) {
            return Ok(Some(hit));
        }
        // A lock that clears the cache while we decrypt wins.
        let generation = self.thumbnails.generation();

        let record = match self.db.get_snapshot(id).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        let path = match record.blobs.thumbnail_path {
            Some(path) => path,
            None => return Ok(None),
        };

        let image = Arc::new(self.files.read(&path, keys)?);
        if record.blobs.encrypted {
            self.thumbnails
                .insert_if_current(id, Arc::clone(&image), generation);
        }
        Ok(Some(image))
    }
}

/// Replays drained spool records through `Indexer::persist`.
pub struct SpoolIngest {
    indexer: Indexer,
    mode: StorageMode,
}

impl SpoolIngest {
    pub fn new(indexer: Indexer, mode: StorageMode) -> Self {
        Self { indexer, mode }
    }
}

impl RecordSink for SpoolIngest {
    async fn ingest(&self, record: QueueRecord) -> Result<i64> {
        let snapshot = NewSnapshot {
            captured_at: record.captured_at,
            app: record.app,
            phash: record.phash,
            source: IngestSource::Spool,
            extraction: record.extraction,
        };
        let content = SnapshotContent {
            image: record.image.into(),
            thumbnail: record.thumbnail.map(Into::into),
        };
        self.indexer.persist(snapshot, content, &self.mode).await
    }
}
