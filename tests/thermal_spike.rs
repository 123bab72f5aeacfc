mod common;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::Utc;
use common::{ramp, CountingExtractor, ThermalDial};
use timescroll::{
    bridge::{EncodeParams, ImageEncoder},
    db::{Database, IngestSource},
    indexer::{ExtractionOutcome, Indexer, NewSnapshot, SnapshotContent},
    metrics::MetricsCollector,
    sensing::{
        CadenceController, Completion, CooldownGate, Decision, Frame, RasterEncoder, SkipReason,
        ThermalGovernor, ThermalLevel,
    },
    settings::CaptureSettings,
    vault::{SnapshotFiles, StorageMode},
};

fn settings(max_interval_secs: f64) -> CaptureSettings {
    CaptureSettings {
        base_interval_secs: 2.0,
        max_interval_secs,
        thermal_sample_interval_ms: 1_000,
        critical_cooldown_secs: 60,
        ..CaptureSettings::default()
    }
}

async fn persist(indexer: &Indexer, frame: &Frame, bits: u64) -> i64 {
    let image = RasterEncoder::new()
        .encode(
            frame,
            &EncodeParams {
                format: Default::default(),
                quality: 70,
                max_dimension: 1920,
            },
        )
        .unwrap();
    indexer
        .persist(
            NewSnapshot {
                captured_at: Utc::now(),
                app: None,
                phash: timescroll::sensing::PerceptualHash::from_bits(bits),
                source: IngestSource::Direct,
                extraction: None,
            },
            SnapshotContent {
                image,
                thumbnail: None,
            },
            &StorageMode::Plain,
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn critical_spike_triples_interval_and_pauses_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let s = settings(30.0);
    let dial = ThermalDial::default();
    let cooldown = Arc::new(CooldownGate::new());
    let extractor = Arc::new(CountingExtractor::default());
    let indexer = Indexer::new(
        Database::new(dir.path().join("store.sqlite3")).unwrap(),
        SnapshotFiles::new(dir.path().join("snapshots")),
        extractor.clone(),
        Arc::clone(&cooldown),
        MetricsCollector::new(),
    );
    let mut cadence = CadenceController::new(
        &s,
        ThermalGovernor::new(Box::new(dial.clone())),
        Arc::clone(&cooldown),
    );

    let t0 = Instant::now();
    let Decision::Admit(first) = cadence.on_frame_at(&ramp(0, false), None, &s, t0) else {
        panic!("first frame should be admitted");
    };
    cadence.complete(Completion::Committed(first), &s);

    // nominal -> critical, seen on the next frame.
    dial.set(ThermalLevel::Critical);
    let spike = t0 + Duration::from_secs(2);
    assert_eq!(
        cadence.on_frame_at(&ramp(2_000, true), None, &s, spike),
        Decision::Skip(SkipReason::Cadence)
    );
    assert_eq!(cadence.state().current_interval, Duration::from_secs(6));
    assert_eq!(cadence.state().last_thermal_level, ThermalLevel::Critical);
    assert_eq!(cooldown.expiry(), Some(spike + Duration::from_secs(60)));

    // Admitted 10s after the spike: extraction is skipped, the row stays.
    let at_10s = spike + Duration::from_secs(10);
    let frame = ramp(12_000, true);
    let Decision::Admit(hash) = cadence.on_frame_at(&frame, None, &s, at_10s) else {
        panic!("changed frame should be admitted");
    };
    let id = persist(&indexer, &frame, hash.bits()).await;
    cadence.complete(Completion::Committed(hash), &s);
    assert_eq!(
        indexer
            .complete_text_extraction_at(id, frame, at_10s)
            .await
            .unwrap(),
        ExtractionOutcome::SkippedCooldown
    );
    assert_eq!(extractor.calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    // Admitted 65s after the spike: the cooldown is over.
    let at_65s = spike + Duration::from_secs(65);
    let frame = ramp(67_000, false);
    let Decision::Admit(hash) = cadence.on_frame_at(&frame, None, &s, at_65s) else {
        panic!("changed frame should be admitted");
    };
    let id = persist(&indexer, &frame, hash.bits()).await;
    assert_eq!(
        indexer
            .complete_text_extraction_at(id, frame, at_65s)
            .await
            .unwrap(),
        ExtractionOutcome::Extracted { word_count: 2 }
    );
    let record = indexer.snapshot(id).await.unwrap().unwrap();
    assert_eq!(record.extracted_text.as_deref(), Some("frame 64x48"));
}

#[test]
fn widening_is_bounded_by_max_and_cooldowns_only_extend() {
    let s = settings(5.0);
    let dial = ThermalDial::default();
    let cooldown = Arc::new(CooldownGate::new());
    let mut cadence = CadenceController::new(
        &s,
        ThermalGovernor::new(Box::new(dial.clone())),
        Arc::clone(&cooldown),
    );

    let t0 = Instant::now();
    let Decision::Admit(first) = cadence.on_frame_at(&ramp(0, false), None, &s, t0) else {
        panic!("first frame should be admitted");
    };
    cadence.complete(Completion::Committed(first), &s);

    dial.set(ThermalLevel::Critical);
    cadence.on_frame_at(&ramp(100, true), None, &s, t0 + Duration::from_secs(1));
    assert_eq!(cadence.state().current_interval, Duration::from_secs(5));
    let critical_expiry = cooldown.expiry().unwrap();

    // Easing to serious asks for a shorter window; the longer one stands.
    dial.set(ThermalLevel::Serious);
    cadence.on_frame_at(&ramp(200, true), None, &s, t0 + Duration::from_secs(3));
    assert_eq!(cooldown.expiry(), Some(critical_expiry));

    // Back to nominal: nothing narrows the interval until a change commits.
    dial.set(ThermalLevel::Nominal);
    cadence.on_frame_at(&ramp(300, true), None, &s, t0 + Duration::from_secs(5));
    assert_eq!(cadence.state().current_interval, Duration::from_secs(5));
}
