use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bridge::{AppIdentity, EncodeParams, ImageEncoder};
use crate::db::IngestSource;
use crate::indexer::{ExtractionOutcome, Indexer, NewSnapshot, SnapshotContent};
use crate::metrics::{FailureStage, FrameMetrics, MetricsCollector};
use crate::settings::CaptureSettings;
use crate::vault::{Destination, QueueRecord, VaultController};

use super::frame::{Frame, InFlightFrame};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// A frame the cadence controller let through, with everything the work
/// context needs to finish it.
pub struct AdmittedFrame {
    pub guard: InFlightFrame,
    pub app: Option<AppIdentity>,
    pub captured_at: DateTime<Utc>,
    /// Snapshot taken when the frame arrived; used for the whole trip.
    pub settings: Arc<CaptureSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Persisted(i64),
    Spooled,
    /// Locked vault with capture while locked turned off.
    Dropped,
    Failed(FailureStage),
}

/// Text extraction request for a row that already exists.
pub struct ExtractionJob {
    pub id: i64,
    pub frame: Frame,
}

#[derive(Clone)]
pub struct FrameProcessor {
    encoder: Arc<dyn ImageEncoder>,
    indexer: Indexer,
    vault: VaultController,
    metrics: MetricsCollector,
    extraction: mpsc::Sender<ExtractionJob>,
}

impl FrameProcessor {
    pub fn new(
        encoder: Arc<dyn ImageEncoder>,
        indexer: Indexer,
        vault: VaultController,
        metrics: MetricsCollector,
        extraction: mpsc::Sender<ExtractionJob>,
    ) -> Self {
        Self {
            encoder,
            indexer,
            vault,
            metrics,
            extraction,
        }
    }

    /// Encodes one admitted frame and sends it to the destination chosen for
    /// it. The guard is committed only once the frame is durable; every other
    /// path releases it.
    pub async fn process(&self, admitted: AdmittedFrame) -> FrameOutcome {
        let started = Instant::now();
        let AdmittedFrame {
            guard,
            app,
            captured_at,
            settings,
        } = admitted;

        let Some(destination) = self.vault.destination(&settings) else {
            log_debug!("vault locked and capture while locked is off; frame released");
            return FrameOutcome::Dropped;
        };
        let (spooling, with_thumbnail) = match &destination {
            Destination::Direct(_) => (false, true),
            Destination::Spool { keep_thumbnail, .. } => (true, *keep_thumbnail),
        };

        let encoder = Arc::clone(&self.encoder);
        let indexer = self.indexer.clone();
        let job_settings = Arc::clone(&settings);
        let joined = tokio::task::spawn_blocking(move || {
            let encoded = encode_frame(encoder.as_ref(), guard.frame(), &job_settings, with_thumbnail);
            // A spooled record is sealed whole, so its text has to be in it.
            let extraction = (spooling && encoded.is_ok())
                .then(|| indexer.extract_blocking(guard.frame(), std::time::Instant::now()));
            (guard, encoded, extraction)
        })
        .await;

        let (guard, encoded, extraction) = match joined {
            Ok(parts) => parts,
            Err(err) => {
                return self
                    .fail(FailureStage::Encode, anyhow!("encode worker join failed: {err}"))
                    .await
            }
        };
        let content = match encoded {
            Ok(content) => content,
            Err(err) => return self.fail(FailureStage::Encode, err).await,
        };
        let encode_ms = started.elapsed().as_millis() as u64;
        let encoded_bytes = content.image.bytes.len();
        let label = destination.label();

        let persist_started = Instant::now();
        let outcome = match destination {
            Destination::Direct(mode) => {
                let snapshot = NewSnapshot {
                    captured_at,
                    app,
                    phash: guard.hash(),
                    source: IngestSource::Direct,
                    extraction: None,
                };
                match self.indexer.persist(snapshot, content, &mode).await {
                    Ok(id) => {
                        let frame = guard.commit();
                        self.metrics.record_persisted();
                        self.queue_extraction(ExtractionJob { id, frame });
                        FrameOutcome::Persisted(id)
                    }
                    Err(err) => return self.fail(FailureStage::Persist, err).await,
                }
            }
            Destination::Spool { public, .. } => {
                let extraction = match extraction {
                    Some(Ok(found)) => found,
                    Some(Err(err)) => {
                        log_warn!("text extraction failed; spooling without text: {err:#}");
                        self.metrics
                            .record_failure(FailureStage::Extract, format!("{err:#}"))
                            .await;
                        None
                    }
                    None => None,
                };
                let record = QueueRecord {
                    captured_at,
                    app,
                    phash: guard.hash(),
                    image: content.image.into(),
                    thumbnail: content.thumbnail.map(Into::into),
                    extraction,
                };
                match self.vault.spool_record(&record, &public) {
                    Ok(()) => {
                        guard.commit();
                        self.metrics.record_spooled();
                        FrameOutcome::Spooled
                    }
                    Err(err) => return self.fail(FailureStage::Spool, err).await,
                }
            }
        };

        let (cpu_percent, memory_mb) = self.metrics.sample_system_metrics().await;
        self.metrics
            .record_frame(FrameMetrics {
                timestamp: captured_at,
                destination: label.to_string(),
                encode_ms,
                encoded_bytes,
                persist_ms: persist_started.elapsed().as_millis() as u64,
                total_ms: started.elapsed().as_millis() as u64,
                cpu_percent,
                memory_mb,
            })
            .await;
        outcome
    }

    fn queue_extraction(&self, job: ExtractionJob) {
        match self.extraction.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                log_debug!("extraction lane full; snapshot {} keeps no text", job.id);
                self.metrics.record_extraction(false);
            }
            Err(TrySendError::Closed(job)) => {
                log_debug!("extraction lane closed; snapshot {} keeps no text", job.id);
            }
        }
    }

    async fn fail(&self, stage: FailureStage, err: anyhow::Error) -> FrameOutcome {
        log_warn!("frame dropped at {:?}: {err:#}", stage);
        self.metrics.record_failure(stage, format!("{err:#}")).await;
        FrameOutcome::Failed(stage)
    }
}

fn encode_frame(
    encoder: &dyn ImageEncoder,
    frame: &Frame,
    settings: &CaptureSettings,
    with_thumbnail: bool,
) -> Result<SnapshotContent> {
    let params = EncodeParams {
        format: settings.format,
        quality: settings.jpeg_quality,
        max_dimension: settings.max_dimension,
    };
    let image = encoder.encode(frame, &params)?;
    let thumbnail = if with_thumbnail {
        Some(encoder.thumbnail(frame, settings.thumbnail_max_dimension)?)
    } else {
        None
    };
    Ok(SnapshotContent { image, thumbnail })
}

/// The work context: one admitted frame at a time, in arrival order.
pub async fn work_loop(
    processor: FrameProcessor,
    mut frames: mpsc::Receiver<AdmittedFrame>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            admitted = frames.recv() => {
                let Some(admitted) = admitted else {
                    break;
                };
                let outcome = processor.process(admitted).await;
                log_debug!("frame finished: {:?}", outcome);
            }
            _ = cancel_token.cancelled() => {
                log_info!("work loop shutting down");
                break;
            }
        }
    }
}

/// The extraction lane. Runs behind the work context so slow text
/// extraction never holds up the next frame.
pub async fn extraction_loop(
    indexer: Indexer,
    metrics: MetricsCollector,
    mut jobs: mpsc::Receiver<ExtractionJob>,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            job = jobs.recv() => {
                let Some(ExtractionJob { id, frame }) = job else {
                    break;
                };
                match indexer.complete_text_extraction(id, frame).await {
                    Ok(ExtractionOutcome::Extracted { word_count }) => {
                        log_debug!("snapshot {}: extracted {} words", id, word_count);
                    }
                    Ok(ExtractionOutcome::SkippedCooldown) => {}
                    Err(err) => {
                        log_warn!("text extraction failed for snapshot {}: {err:#}", id);
                        metrics
                            .record_failure(FailureStage::Extract, format!("snapshot {id}: {err:#}"))
                            .await;
                    }
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("extraction lane shutting down");
                break;
            }
        }
    }
}
