//! Moves existing snapshot files between plain and sealed storage.
//!
//! Best-effort and per record: a record that fails is left as it was and the
//! pass continues with the next one.

use anyhow::Result;

use crate::db::{SnapshotRecord, StoredBlobs};
use crate::indexer::Indexer;
use crate::metrics::{FailureStage, MetricsCollector};

use super::envelope::ContentKeyUnwrapper;
use super::storage::StorageMode;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

const PAGE_SIZE: usize = 100;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MigrationReport {
    pub migrated: usize,
    pub failed: usize,
}

/// Rewrites every record not yet in `target`'s form. Sealed sources need
/// `keys`; plain sources do not.
pub async fn migrate_records(
    indexer: &Indexer,
    target: &StorageMode,
    keys: Option<&(dyn ContentKeyUnwrapper + Send + Sync)>,
    metrics: &MetricsCollector,
) -> Result<MigrationReport> {
    let source_encrypted = !target.is_sealed();
    let mut report = MigrationReport::default();
    let mut after_id = 0;

    loop {
        let page = indexer
            .db()
            .list_snapshots_by_storage(source_encrypted, after_id, PAGE_SIZE)
            .await?;
        let last = match page.last() {
            Some(record) => record.id,
            None => break,
        };

        for record in page {
            match migrate_one(indexer, &record, target, keys).await {
                Ok(()) => report.migrated += 1,
                Err(err) => {
                    report.failed += 1;
                    log_warn!("skipping migration of snapshot {}: {err:#}", record.id);
                    metrics
                        .record_failure(
                            FailureStage::Migration,
                            format!("snapshot {}: {err:#}", record.id),
                        )
                        .await;
                }
            }
        }
        after_id = last;
    }

    if report.migrated > 0 || report.failed > 0 {
        log_info!(
            "storage migration to {} finished: {} migrated, {} failed",
            if target.is_sealed() { "sealed" } else { "plain" },
            report.migrated,
            report.failed
        );
    }
    Ok(report)
}

async fn migrate_one(
    indexer: &Indexer,
    record: &SnapshotRecord,
    target: &StorageMode,
    keys: Option<&(dyn ContentKeyUnwrapper + Send + Sync)>,
) -> Result<()> {
    let files = indexer.files();
    let old = &record.blobs;

    let image_path = files.rewrite(&old.image_path, target, keys)?;
    let thumbnail_path = match &old.thumbnail_path {
        Some(path) => match files.rewrite(path, target, keys) {
            Ok(new_path) => Some(new_path),
            Err(err) => {
                files.remove(&image_path)?;
                return Err(err);
            }
        },
        None => None,
    };

    let blobs = StoredBlobs {
        image_path,
        thumbnail_path,
        encrypted: target.is_sealed(),
    };
    if let Err(err) = indexer.db().update_snapshot_blobs(record.id, &blobs).await {
        files.remove(&blobs.image_path)?;
        if let Some(path) = &blobs.thumbnail_path {
            files.remove(path)?;
        }
        return Err(err);
    }

    files.remove(&old.image_path)?;
    if let Some(path) = &old.thumbnail_path {
        files.remove(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{EncodeParams, ImageEncoder, TextExtraction, TextExtractor};
    use crate::db::{Database, IngestSource};
    use crate::indexer::{NewSnapshot, SnapshotContent};
    use crate::sensing::{CooldownGate, Frame, PerceptualHash, RasterEncoder};
    use crate::settings::SnapshotFormat;
    use crate::vault::envelope::KekSecret;
    use crate::vault::storage::SnapshotFiles;
    use chrono::Utc;
    use std::{sync::Arc, time::Duration};

    struct Silent;

    impl TextExtractor for Silent {
        fn extract(&self, _frame: &Frame) -> Result<TextExtraction> {
            anyhow::bail!("not used")
        }
    }

    #[tokio::test]
    async fn round_trips_between_plain_and_sealed() {
        let dir = tempfile::tempdir().unwrap();
        let metrics = MetricsCollector::new();
        let indexer = Indexer::new(
            Database::new(dir.path().join("store.sqlite3")).unwrap(),
            SnapshotFiles::new(dir.path().join("snapshots")),
            Arc::new(Silent),
            Arc::new(CooldownGate::new()),
            metrics.clone(),
        );

        let frame = Frame::new(vec![40; 8 * 8 * 4], 8, 8, Duration::ZERO).unwrap();
        let encoder = RasterEncoder::new();
        let image = encoder
            .encode(
                &frame,
                &EncodeParams {
                    format: SnapshotFormat::Png,
                    quality: 70,
                    max_dimension: 64,
                },
            )
            .unwrap();
        let mut ids = Vec::new();
        for bits in 0..3 {
            let snapshot = NewSnapshot {
                captured_at: Utc::now(),
                app: None,
                phash: PerceptualHash::from_bits(bits),
                source: IngestSource::Direct,
                extraction: None,
            };
            let content = SnapshotContent {
                image: image.clone(),
                thumbnail: Some(encoder.thumbnail(&frame, 4).unwrap()),
            };
            ids.push(
                indexer
                    .persist(snapshot, content, &StorageMode::Plain)
                    .await
                    .unwrap(),
            );
        }

        let secret = KekSecret::generate();
        let sealed = StorageMode::Sealed(secret.public().clone());
        let report = migrate_records(&indexer, &sealed, None, &metrics).await.unwrap();
        assert_eq!(report, MigrationReport { migrated: 3, failed: 0 });

        let record = indexer.snapshot(ids[0]).await.unwrap().unwrap();
        assert!(record.blobs.encrypted);
        assert!(record.blobs.image_path.ends_with(".tse"));
        assert_eq!(
            indexer.load_image(ids[0], Some(&secret)).await.unwrap().unwrap(),
            image
        );

        // Without keys nothing can be unsealed; every record is skipped.
        let report = migrate_records(&indexer, &StorageMode::Plain, None, &metrics)
            .await
            .unwrap();
        assert_eq!(report, MigrationReport { migrated: 0, failed: 3 });
        assert_eq!(metrics.counters().failures, 3);

        let report = migrate_records(&indexer, &StorageMode::Plain, Some(&secret), &metrics)
            .await
            .unwrap();
        assert_eq!(report.migrated, 3);
        let record = indexer.snapshot(ids[2]).await.unwrap().unwrap();
        assert!(!record.blobs.encrypted);
        assert!(record.blobs.image_path.ends_with(".png"));
        assert!(!indexer.files().absolute(&record.blobs.image_path.replace(".png", ".tse")).exists());
    }
}
