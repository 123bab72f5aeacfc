use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use serde_json::{from_str, to_string};

use crate::bridge::{AppIdentity, TextBox, TextExtraction};
use crate::db::{
    helpers::{format_as_str, parse_datetime, parse_format, parse_source, to_i64, to_u32, to_u64},
    models::{PendingSnapshot, SnapshotRecord, StoredBlobs},
    Database,
};

const SNAPSHOT_COLUMNS: &str = "id, captured_at, bundle_id, app_name, byte_size, width, height,
     format, phash, image_path, thumbnail_path, encrypted, source, extracted_text,
     text_boxes_json, ocr_confidence, ocr_word_count, embedding_ref, created_at";

fn row_to_snapshot(row: &Row) -> Result<SnapshotRecord> {
    let bundle_id: Option<String> = row.get("bundle_id")?;
    let app = bundle_id.map(|bundle_id| -> Result<AppIdentity> {
        Ok(AppIdentity {
            bundle_id,
            name: row.get("app_name")?,
        })
    });
    let boxes_json: Option<String> = row.get("text_boxes_json")?;
    let text_boxes: Vec<TextBox> = match boxes_json {
        Some(raw) => from_str(&raw).context("failed to parse text_boxes_json")?,
        None => Vec::new(),
    };

    Ok(SnapshotRecord {
        id: row.get("id")?,
        captured_at: parse_datetime(&row.get::<_, String>("captured_at")?, "captured_at")?,
        app: app.transpose()?,
        byte_size: to_u64(row.get("byte_size")?, "byte_size")?,
        width: to_u32(row.get("width")?, "width")?,
        height: to_u32(row.get("height")?, "height")?,
        format: parse_format(&row.get::<_, String>("format")?)?,
        phash: row.get::<_, String>("phash")?.parse()?,
        blobs: StoredBlobs {
            image_path: row.get("image_path")?,
            thumbnail_path: row.get("thumbnail_path")?,
            encrypted: row.get("encrypted")?,
        },
        source: parse_source(&row.get::<_, String>("source")?)?,
        extracted_text: row.get("extracted_text")?,
        text_boxes,
        ocr_confidence: row.get("ocr_confidence")?,
        ocr_word_count: row
            .get::<_, Option<i64>>("ocr_word_count")?
            .map(|count| to_u64(count, "ocr_word_count"))
            .transpose()?,
        embedding_ref: row.get("embedding_ref")?,
        created_at: parse_datetime(&row.get::<_, String>("created_at")?, "created_at")?,
    })
}

impl Database {
    /// The only insert path for snapshots. Returns the new row id.
    pub async fn insert_snapshot(&self, snapshot: &PendingSnapshot) -> Result<i64> {
        let record = snapshot.clone();
        self.execute(move |conn| {
            let text_boxes_json = if record.text_boxes.is_empty() {
                None
            } else {
                Some(to_string(&record.text_boxes).context("failed to serialize text boxes")?)
            };
            let ocr_word_count = record.ocr_word_count.map(to_i64).transpose()?;

            conn.execute(
                "INSERT INTO snapshots (
                    captured_at,
                    bundle_id,
                    app_name,
                    byte_size,
                    width,
                    height,
                    format,
                    phash,
                    image_path,
                    thumbnail_path,
                    encrypted,
                    source,
                    extracted_text,
                    text_boxes_json,
                    ocr_confidence,
                    ocr_word_count,
                    created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    record.captured_at.to_rfc3339(),
                    record.app.as_ref().map(|app| app.bundle_id.clone()),
                    record.app.as_ref().and_then(|app| app.name.clone()),
                    to_i64(record.byte_size)?,
                    record.width,
                    record.height,
                    format_as_str(record.format),
                    record.phash.to_string(),
                    record.blobs.image_path,
                    record.blobs.thumbnail_path,
                    record.blobs.encrypted,
                    record.source.as_str(),
                    record.extracted_text,
                    text_boxes_json,
                    record.ocr_confidence,
                    ocr_word_count,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("failed to insert snapshot")?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    pub async fn update_extracted_text(&self, id: i64, extraction: &TextExtraction) -> Result<()> {
        let extraction = extraction.clone();
        self.execute(move |conn| {
            let boxes = to_string(&extraction.boxes).context("failed to serialize text boxes")?;
            let updated = conn
                .execute(
                    "UPDATE snapshots
                     SET extracted_text = ?1,
                         text_boxes_json = ?2,
                         ocr_confidence = ?3,
                         ocr_word_count = ?4
                     WHERE id = ?5",
                    params![
                        extraction.text,
                        boxes,
                        extraction.confidence,
                        to_i64(extraction.word_count)?,
                        id,
                    ],
                )
                .context("failed to update extracted text")?;
            anyhow::ensure!(updated == 1, "snapshot {id} does not exist");
            Ok(())
        })
        .await
    }

    pub async fn attach_embedding(&self, id: i64, reference: &str) -> Result<()> {
        let reference = reference.to_string();
        self.execute(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE snapshots SET embedding_ref = ?1 WHERE id = ?2",
                    params![reference, id],
                )
                .context("failed to attach embedding")?;
            anyhow::ensure!(updated == 1, "snapshot {id} does not exist");
            Ok(())
        })
        .await
    }

    /// Points a row at new files after a storage migration.
    pub async fn update_snapshot_blobs(&self, id: i64, blobs: &StoredBlobs) -> Result<()> {
        let blobs = blobs.clone();
        self.execute(move |conn| {
            conn.execute(
                "UPDATE snapshots
                 SET image_path = ?1,
                     thumbnail_path = ?2,
                     encrypted = ?3
                 WHERE id = ?4",
                params![blobs.image_path, blobs.thumbnail_path, blobs.encrypted, id],
            )
            .context("failed to update snapshot storage")?;
            Ok(())
        })
        .await
    }

    pub async fn get_snapshot(&self, id: i64) -> Result<Option<SnapshotRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM snapshots WHERE id = ?1"
            ))?;
            let mut rows = stmt.query(params![id])?;
            match rows.next()? {
                Some(row) => row_to_snapshot(row).map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    /// Rows in insertion order.
    pub async fn list_snapshots(&self, limit: usize) -> Result<Vec<SnapshotRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM snapshots ORDER BY id ASC LIMIT ?1"
            ))?;
            let mut rows = stmt.query(params![to_i64(limit as u64)?])?;
            let mut snapshots = Vec::new();
            while let Some(row) = rows.next()? {
                snapshots.push(row_to_snapshot(row)?);
            }
            Ok(snapshots)
        })
        .await
    }

    /// Rows whose files are (or are not) sealed, oldest first, starting
    /// after `after_id`.
    pub async fn list_snapshots_by_storage(
        &self,
        encrypted: bool,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<SnapshotRecord>> {
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SNAPSHOT_COLUMNS} FROM snapshots
                 WHERE encrypted = ?1 AND id > ?2
                 ORDER BY id ASC
                 LIMIT ?3"
            ))?;
            let mut rows = stmt.query(params![encrypted, after_id, to_i64(limit as u64)?])?;
            let mut snapshots = Vec::new();
            while let Some(row) = rows.next()? {
                snapshots.push(row_to_snapshot(row)?);
            }
            Ok(snapshots)
        })
        .await
    }

    pub async fn count_snapshots(&self) -> Result<u64> {
        self.execute(|conn| {
            let count: Option<i64> = conn
                .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))
                .optional()?;
            to_u64(count.unwrap_or(0), "count")
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::IngestSource;
    use crate::sensing::PerceptualHash;
    use crate::settings::SnapshotFormat;

    fn pending(name: &str) -> PendingSnapshot {
        PendingSnapshot {
            captured_at: Utc::now(),
            app: Some(AppIdentity {
                bundle_id: "com.example.editor".into(),
                name: Some("Editor".into()),
            }),
            byte_size: 1234,
            width: 800,
            height: 600,
            format: SnapshotFormat::Png,
            phash: PerceptualHash::from_bits(0xdead_beef),
            blobs: StoredBlobs {
                image_path: format!("{name}.png"),
                thumbnail_path: None,
                encrypted: false,
            },
            source: IngestSource::Direct,
            extracted_text: None,
            text_boxes: Vec::new(),
            ocr_confidence: None,
            ocr_word_count: None,
        }
    }

    #[tokio::test]
    async fn insert_then_attach_text_and_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("store.sqlite3")).unwrap();

        let id = db.insert_snapshot(&pending("a")).await.unwrap();
        db.update_extracted_text(
            id,
            &TextExtraction {
                text: "hello world".into(),
                confidence: 0.9,
                word_count: 2,
                boxes: vec![TextBox {
                    text: "hello".into(),
                    x: 1.0,
                    y: 2.0,
                    width: 30.0,
                    height: 10.0,
                    confidence: 0.9,
                }],
            },
        )
        .await
        .unwrap();
        db.attach_embedding(id, "vec:42").await.unwrap();

        let record = db.get_snapshot(id).await.unwrap().unwrap();
        assert_eq!(record.extracted_text.as_deref(), Some("hello world"));
        assert_eq!(record.text_boxes.len(), 1);
        assert_eq!(record.ocr_word_count, Some(2));
        assert_eq!(record.embedding_ref.as_deref(), Some("vec:42"));
        assert_eq!(record.phash, PerceptualHash::from_bits(0xdead_beef));
        assert_eq!(record.app.unwrap().name.as_deref(), Some("Editor"));
    }

    #[tokio::test]
    async fn updating_a_missing_row_fails() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("store.sqlite3")).unwrap();
        assert!(db.attach_embedding(99, "vec:1").await.is_err());
    }

    #[tokio::test]
    async fn lists_by_storage_in_id_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("store.sqlite3")).unwrap();

        let first = db.insert_snapshot(&pending("a")).await.unwrap();
        let second = db.insert_snapshot(&pending("b")).await.unwrap();
        db.update_snapshot_blobs(
            first,
            &StoredBlobs {
                image_path: "a.tse".into(),
                thumbnail_path: None,
                encrypted: true,
            },
        )
        .await
        .unwrap();

        let plain = db.list_snapshots_by_storage(false, 0, 10).await.unwrap();
        assert_eq!(plain.iter().map(|r| r.id).collect::<Vec<_>>(), vec![second]);
        let sealed = db.list_snapshots_by_storage(true, 0, 10).await.unwrap();
        assert_eq!(sealed[0].blobs.image_path, "a.tse");
        assert_eq!(db.count_snapshots().await.unwrap(), 2);
    }
}
