#![allow(dead_code)]

use std::{
    future::Future,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::Result;
use timescroll::{
    bridge::{AppIdentity, ForegroundProbe, TextExtraction, TextExtractor, ThermalSource},
    sensing::{Frame, ThermalLevel},
    settings::CaptureSettings,
    vault::{AuthContext, Authenticator, KeyError},
    Platform, Recorder,
};

pub struct Gate(pub AtomicBool);

impl Gate {
    pub fn open() -> Arc<Self> {
        Arc::new(Self(AtomicBool::new(true)))
    }

    pub fn set(&self, allow: bool) {
        self.0.store(allow, Ordering::SeqCst);
    }
}

impl Authenticator for Gate {
    fn authenticate(&self, _reason: &str) -> Result<AuthContext, KeyError> {
        if self.0.load(Ordering::SeqCst) {
            Ok(AuthContext::new(Instant::now(), Duration::from_secs(30)))
        } else {
            Err(KeyError::AuthDenied("user cancelled".into()))
        }
    }
}

/// Reports the frame size as its text and counts calls.
#[derive(Default)]
pub struct CountingExtractor {
    pub calls: AtomicUsize,
}

impl TextExtractor for CountingExtractor {
    fn extract(&self, frame: &Frame) -> Result<TextExtraction> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TextExtraction {
            text: format!("frame {}x{}", frame.width(), frame.height()),
            confidence: 0.9,
            word_count: 2,
            boxes: Vec::new(),
        })
    }
}

/// Thermal level set by the test.
#[derive(Clone, Default)]
pub struct ThermalDial(pub Arc<AtomicU8>);

impl ThermalDial {
    pub fn set(&self, level: ThermalLevel) {
        self.0.store(level as u8, Ordering::SeqCst);
    }
}

impl ThermalSource for ThermalDial {
    fn current_level(&self) -> ThermalLevel {
        match self.0.load(Ordering::SeqCst) {
            0 => ThermalLevel::Nominal,
            1 => ThermalLevel::Fair,
            2 => ThermalLevel::Serious,
            _ => ThermalLevel::Critical,
        }
    }
}

#[derive(Default)]
pub struct FixedProbe(pub Mutex<Option<AppIdentity>>);

impl FixedProbe {
    pub fn set(&self, bundle_id: &str) {
        *self.0.lock().unwrap() = Some(AppIdentity {
            bundle_id: bundle_id.to_string(),
            name: None,
        });
    }
}

impl ForegroundProbe for FixedProbe {
    fn frontmost_app(&self) -> Option<AppIdentity> {
        self.0.lock().unwrap().clone()
    }
}

pub struct Harness {
    pub recorder: Recorder,
    pub gate: Arc<Gate>,
    pub extractor: Arc<CountingExtractor>,
    pub probe: Arc<FixedProbe>,
}

/// Settings that keep background timers out of the way; tests drive
/// draining themselves.
pub fn test_settings() -> CaptureSettings {
    CaptureSettings {
        base_interval_secs: 1.0,
        max_interval_secs: 30.0,
        drain_interval_ms: 60_000,
        auto_lock_after_secs: 0,
        ..CaptureSettings::default()
    }
}

pub fn open_harness(dir: &Path, settings: &CaptureSettings) -> Harness {
    std::fs::write(
        dir.join("settings.json"),
        serde_json::to_vec(settings).unwrap(),
    )
    .unwrap();

    let gate = Gate::open();
    let extractor = Arc::new(CountingExtractor::default());
    let probe = Arc::new(FixedProbe::default());
    let mut platform = Platform::new(extractor.clone(), gate.clone());
    platform.probe = probe.clone();

    Harness {
        recorder: Recorder::open(dir, platform).unwrap(),
        gate,
        extractor,
        probe,
    }
}

/// Horizontal grey ramp; `flip` mirrors it, which moves the hash far away.
pub fn ramp(timestamp_ms: u64, flip: bool) -> Frame {
    let (width, height) = (64u32, 48u32);
    let mut pixels = Vec::with_capacity((width * height * 4) as usize);
    for _ in 0..height {
        for x in 0..width {
            let mut value = (x * 255 / width) as u8;
            if flip {
                value = 255 - value;
            }
            pixels.extend_from_slice(&[value, value, value, 255]);
        }
    }
    Frame::new(pixels, width, height, Duration::from_millis(timestamp_ms)).unwrap()
}

/// Polls `check` until it holds or five seconds pass.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
