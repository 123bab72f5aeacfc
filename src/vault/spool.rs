//! Durable queue of snapshots captured while the vault is locked.
//!
//! Each pending record is one sealed `TSE1` file. Writers only need the
//! public key; draining needs the unlocked private keys. A file is visible
//! under its final name only once it is complete, so a crash leaves either
//! nothing or a whole record behind.

use std::{
    collections::HashSet,
    fs,
    future::Future,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::sync::watch;
use uuid::Uuid;

use crate::bridge::{AppIdentity, EncodedImage, TextExtraction};
use crate::sensing::PerceptualHash;
use crate::settings::SnapshotFormat;
use crate::utils::fs::{is_partial, remove_partials, write_atomic};

use super::envelope::{self, ContentKeyUnwrapper, ContentType, KekPublic};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

/// Extension of a pending ingest record.
pub const SPOOL_EXTENSION: &str = "tsq";
pub const QUARANTINE_DIR: &str = "quarantine";
const QUEUE_RECORD_PAYLOAD: &str = "queue-record";

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpooledImage {
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: SnapshotFormat,
}

impl From<EncodedImage> for SpooledImage {
    fn from(image: EncodedImage) -> Self {
        Self {
            bytes: image.bytes,
            width: image.width,
            height: image.height,
            format: image.format,
        }
    }
}

impl From<SpooledImage> for EncodedImage {
    fn from(image: SpooledImage) -> Self {
        Self {
            bytes: image.bytes,
            width: image.width,
            height: image.height,
            format: image.format,
        }
    }
}

/// Everything needed to insert a snapshot later: metadata, the encoded
/// image and whatever text was extracted before spooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueRecord {
    pub captured_at: DateTime<Utc>,
    pub app: Option<AppIdentity>,
    pub phash: PerceptualHash,
    pub image: SpooledImage,
    pub thumbnail: Option<SpooledImage>,
    pub extraction: Option<TextExtraction>,
}

/// Destination of drained records.
pub trait RecordSink {
    fn ingest(&self, record: QueueRecord) -> impl Future<Output = Result<i64>> + Send;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Store ids of the records inserted this tick, in spool order.
    pub ingested: Vec<i64>,
    pub quarantined: usize,
    /// Records still waiting after the tick.
    pub remaining: usize,
}

pub struct IngestSpool {
    dir: PathBuf,
    quarantine: PathBuf,
    queued: watch::Sender<usize>,
    recovered: usize,
    /// Files that could be neither deleted nor quarantined. Left on disk
    /// and never read again by this process.
    skipped: Mutex<HashSet<PathBuf>>,
}

impl IngestSpool {
    /// Opens (creating if needed) the spool at `dir`. Leftovers from writes
    /// interrupted by a crash are deleted, never read.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let quarantine = dir.join(QUARANTINE_DIR);
        fs::create_dir_all(&quarantine)
            .with_context(|| format!("failed to create spool at {}", dir.display()))?;

        let recovered = remove_partials(&dir)?;
        if recovered > 0 {
            log_warn!("removed {} interrupted spool writes", recovered);
        }

        let (queued, _) = watch::channel(0);
        let spool = Self {
            dir,
            quarantine,
            queued,
            recovered,
            skipped: Mutex::new(HashSet::new()),
        };
        let count = spool.queued_count()?;
        if count > 0 {
            log_info!("spool holds {} pending records", count);
        }
        Ok(spool)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Interrupted writes discarded by `open`.
    pub fn recovered(&self) -> usize {
        self.recovered
    }

    /// Seals `record` to `public` and writes it under a name that sorts
    /// after every earlier record.
    pub fn enqueue(&self, record: &QueueRecord, public: &KekPublic) -> Result<PathBuf> {
        let plaintext = serde_json::to_vec(record).context("failed to serialize queue record")?;
        let sealed = envelope::seal(
            &plaintext,
            ContentType::Payload {
                payload_type: QUEUE_RECORD_PAYLOAD.to_string(),
            },
            public,
        )
        .context("failed to seal queue record")?;

        let path = self.dir.join(next_file_name(Utc::now()));
        write_atomic(&path, &sealed.to_bytes())?;
        self.queued_count()?;
        Ok(path)
    }

    /// Pending files in drain order.
    pub fn pending(&self) -> Result<Vec<PathBuf>> {
        let skipped = self.skipped();
        let mut records = list_records(&self.dir)?;
        records.retain(|path| !skipped.contains(path));
        Ok(records)
    }

    fn skipped(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        match self.skipped.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn quarantined(&self) -> Result<Vec<PathBuf>> {
        list_records(&self.quarantine)
    }

    /// Counts pending files on disk and publishes the result.
    pub fn queued_count(&self) -> Result<usize> {
        let count = self.pending()?.len();
        self.queued.send_replace(count);
        Ok(count)
    }

    /// Count published by the last enqueue or drain, without listing.
    pub fn last_count(&self) -> usize {
        *self.queued.borrow()
    }

    /// Last published count. Cheap; for display.
    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.queued.subscribe()
    }

    fn decode<K>(&self, path: &Path, keys: &K) -> Result<QueueRecord>
    where
        K: ContentKeyUnwrapper + ?Sized,
    {
        let bytes = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let (header, plaintext) = envelope::open(&bytes, keys)?;
        match header.content {
            ContentType::Payload { payload_type } if payload_type == QUEUE_RECORD_PAYLOAD => {}
            other => return Err(anyhow!("unexpected spool content {other:?}")),
        }
        serde_json::from_slice(&plaintext).context("failed to parse queue record")
    }

    /// Moves `path` out of the live queue. If even that fails the file is
    /// skipped by name until restart, so it is never ingested twice.
    fn move_to_quarantine(&self, path: &Path) {
        let moved = match path.file_name() {
            Some(name) => fs::rename(path, self.quarantine.join(name)),
            None => return,
        };
        if let Err(err) = moved {
            log_error!(
                "failed to quarantine {}, skipping it until restart: {err}",
                path.display()
            );
            self.skipped().insert(path.to_path_buf());
        }
    }

    /// Processes up to `batch` records, oldest first. A file is deleted only
    /// after the sink accepted it; anything that fails to open or insert is
    /// quarantined and the batch goes on.
    pub async fn drain_once<K, S>(&self, keys: &K, batch: usize, sink: &S) -> Result<DrainReport>
    where
        K: ContentKeyUnwrapper + Sync + ?Sized,
        S: RecordSink + Sync,
    {
        let mut report = DrainReport::default();

        for path in self.pending()?.into_iter().take(batch) {
            let record = match self.decode(&path, keys) {
                Ok(record) => record,
                Err(err) => {
                    log_warn!("quarantining unreadable spool file {}: {err:#}", path.display());
                    self.move_to_quarantine(&path);
                    report.quarantined += 1;
                    continue;
                }
            };

            match sink.ingest(record).await {
                Ok(id) => {
                    if let Err(err) = fs::remove_file(&path) {
                        // Already inserted; keep it out of the live queue.
                        log_error!("failed to delete drained {}: {err}", path.display());
                        self.move_to_quarantine(&path);
                    }
                    report.ingested.push(id);
                }
                Err(err) => {
                    log_warn!("quarantining spool file {} after insert failure: {err:#}", path.display());
                    self.move_to_quarantine(&path);
                    report.quarantined += 1;
                }
            }
        }

        report.remaining = self.queued_count()?;
        Ok(report)
    }
}

fn next_file_name(now: DateTime<Utc>) -> String {
    let sequence = SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{:010}-{}.{SPOOL_EXTENSION}",
        now.format("%Y%m%dT%H%M%S%.6fZ"),
        sequence,
        &suffix[..8]
    )
}

fn list_records(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut records = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))? {
        let path = entry?.path();
        let is_record = path.extension().and_then(|ext| ext.to_str()) == Some(SPOOL_EXTENSION);
        if path.is_file() && is_record && !is_partial(&path) {
            records.push(path);
        }
    }
    records.sort();
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::envelope::KekSecret;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collect {
        seen: Mutex<Vec<QueueRecord>>,
        reject_hash: Option<PerceptualHash>,
    }

    impl RecordSink for Collect {
        async fn ingest(&self, record: QueueRecord) -> Result<i64> {
            if Some(record.phash) == self.reject_hash {
                return Err(anyhow!("constraint violation"));
            }
            let mut seen = self.seen.lock().unwrap();
            seen.push(record);
            Ok(seen.len() as i64)
        }
    }

    fn record(bits: u64) -> QueueRecord {
        QueueRecord {
            captured_at: Utc::now(),
            app: None,
            phash: PerceptualHash::from_bits(bits),
            image: SpooledImage {
                bytes: vec![bits as u8; 64],
                width: 8,
                height: 2,
                format: SnapshotFormat::Png,
            },
            thumbnail: None,
            extraction: Some(TextExtraction {
                text: format!("record {bits}"),
                confidence: 0.8,
                word_count: 2,
                boxes: Vec::new(),
            }),
        }
    }

    #[tokio::test]
    async fn drains_in_fifo_order_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let spool = IngestSpool::open(dir.path()).unwrap();
        let secret = KekSecret::generate();

        for bits in 1..=3 {
            spool.enqueue(&record(bits), secret.public()).unwrap();
        }
        assert_eq!(spool.queued_count().unwrap(), 3);
        assert_eq!(*spool.subscribe().borrow(), 3);

        let sink = Collect::default();
        let report = spool.drain_once(&secret, 200, &sink).await.unwrap();

        assert_eq!(report.ingested, vec![1, 2, 3]);
        assert_eq!(report.remaining, 0);
        let order: Vec<u64> = sink.seen.lock().unwrap().iter().map(|r| r.phash.bits()).collect();
        assert_eq!(order, vec![1, 2, 3]);
        let first = sink.seen.lock().unwrap()[0].clone();
        assert_eq!(first.image, record(1).image);
        assert_eq!(first.extraction.unwrap().text, "record 1");
        assert!(spool.pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_size_bounds_a_tick() {
        let dir = tempfile::tempdir().unwrap();
        let spool = IngestSpool::open(dir.path()).unwrap();
        let secret = KekSecret::generate();
        for bits in 0..5 {
            spool.enqueue(&record(bits), secret.public()).unwrap();
        }

        let sink = Collect::default();
        let report = spool.drain_once(&secret, 2, &sink).await.unwrap();
        assert_eq!(report.ingested.len(), 2);
        assert_eq!(report.remaining, 3);
    }

    #[tokio::test]
    async fn corrupt_file_is_quarantined_without_blocking_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let spool = IngestSpool::open(dir.path()).unwrap();
        let secret = KekSecret::generate();

        let bad = spool.enqueue(&record(1), secret.public()).unwrap();
        spool.enqueue(&record(2), secret.public()).unwrap();

        let mut bytes = fs::read(&bad).unwrap();
        bytes[10] ^= 0x01;
        fs::write(&bad, bytes).unwrap();

        let sink = Collect::default();
        let report = spool.drain_once(&secret, 200, &sink).await.unwrap();

        assert_eq!(report.quarantined, 1);
        assert_eq!(report.ingested.len(), 1);
        assert!(!bad.exists());
        assert_eq!(spool.quarantined().unwrap().len(), 1);
        assert_eq!(spool.queued_count().unwrap(), 0);
        assert_eq!(sink.seen.lock().unwrap()[0].phash.bits(), 2);
    }

    #[tokio::test]
    async fn insert_failure_quarantines() {
        let dir = tempfile::tempdir().unwrap();
        let spool = IngestSpool::open(dir.path()).unwrap();
        let secret = KekSecret::generate();
        spool.enqueue(&record(7), secret.public()).unwrap();

        let sink = Collect {
            reject_hash: Some(PerceptualHash::from_bits(7)),
            ..Collect::default()
        };
        let report = spool.drain_once(&secret, 200, &sink).await.unwrap();

        assert_eq!(report.quarantined, 1);
        assert_eq!(spool.queued_count().unwrap(), 0);
        assert_eq!(spool.quarantined().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn wrong_key_quarantines() {
        let dir = tempfile::tempdir().unwrap();
        let spool = IngestSpool::open(dir.path()).unwrap();
        spool
            .enqueue(&record(1), KekSecret::generate().public())
            .unwrap();

        let report = spool
            .drain_once(&KekSecret::generate(), 200, &Collect::default())
            .await
            .unwrap();
        assert_eq!(report.quarantined, 1);
    }

    #[tokio::test]
    async fn records_survive_reopen_and_partials_do_not() {
        let dir = tempfile::tempdir().unwrap();
        let secret = KekSecret::generate();
        {
            let spool = IngestSpool::open(dir.path()).unwrap();
            spool.enqueue(&record(9), secret.public()).unwrap();
        }
        // A write that died before its rename.
        fs::write(dir.path().join(".x.tsq.0badf00d.partial"), b"half a record").unwrap();

        let spool = IngestSpool::open(dir.path()).unwrap();
        assert_eq!(spool.recovered(), 1);
        assert_eq!(spool.queued_count().unwrap(), 1);

        let sink = Collect::default();
        spool.drain_once(&secret, 200, &sink).await.unwrap();
        assert_eq!(sink.seen.lock().unwrap()[0].phash.bits(), 9);
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().path())
            .filter(|path| path.is_file())
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn file_names_sort_chronologically() {
        let early = next_file_name(Utc::now());
        let late = next_file_name(Utc::now() + chrono::Duration::seconds(1));
        assert!(early < late);
        assert!(early.ends_with(".tsq"));
    }

    struct SwapForDirectory<'a> {
        target: PathBuf,
        inner: &'a Collect,
    }

    impl RecordSink for SwapForDirectory<'_> {
        async fn ingest(&self, record: QueueRecord) -> Result<i64> {
            // A directory in its place cannot be removed with `remove_file`.
            fs::remove_file(&self.target)?;
            fs::create_dir(&self.target)?;
            fs::write(self.target.join("pinned"), b"x")?;
            self.inner.ingest(record).await
        }
    }

    #[tokio::test]
    async fn ingested_file_that_cannot_leave_the_queue_is_not_ingested_again() {
        let dir = tempfile::tempdir().unwrap();
        let spool = IngestSpool::open(dir.path().join("spool")).unwrap();
        let kek = KekSecret::generate();
        spool.enqueue(&record(1), kek.public()).unwrap();

        let path = spool.pending().unwrap().remove(0);
        let original = fs::read(&path).unwrap();
        // Quarantine is unusable: renames into it fail.
        let quarantine = spool.dir().join(QUARANTINE_DIR);
        fs::remove_dir_all(&quarantine).unwrap();
        fs::write(&quarantine, b"not a directory").unwrap();

        let sink = Collect::default();
        let swap = SwapForDirectory {
            target: path.clone(),
            inner: &sink,
        };
        let report = spool.drain_once(&kek, 10, &swap).await.unwrap();
        assert_eq!(report.ingested.len(), 1);

        // The same sealed bytes reappear under the same name.
        fs::remove_dir_all(&path).unwrap();
        fs::write(&path, original).unwrap();

        assert!(spool.pending().unwrap().is_empty());
        assert_eq!(spool.queued_count().unwrap(), 0);
        let report = spool.drain_once(&kek, 10, &sink).await.unwrap();
        assert!(report.ingested.is_empty());
        assert_eq!(sink.seen.lock().unwrap().len(), 1);
    }
}
