use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::PathBuf,
    sync::{Arc, RwLock},
    time::Duration,
};

/// Longest cadence interval accepted from a settings file.
pub const MAX_INTERVAL_SECS: f64 = 86_400.0;

fn valid_interval(secs: f64) -> bool {
    secs.is_finite() && (0.0..=MAX_INTERVAL_SECS).contains(&secs)
}

fn interval_or(secs: f64, fallback: f64) -> Duration {
    if valid_interval(secs) {
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::from_secs_f64(fallback))
    } else {
        Duration::from_secs_f64(fallback)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotFormat {
    Png,
    Jpeg,
}

impl Default for SnapshotFormat {
    fn default() -> Self {
        SnapshotFormat::Png
    }
}

/// Typed configuration for one capture pipeline.
///
/// Consumers never hold on to the store; they take an `Arc` snapshot at the
/// start of each frame and read from that.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub base_interval_secs: f64,
    pub max_interval_secs: f64,
    /// Frames whose hashes are at most this many bits apart count as duplicates.
    pub hamming_threshold: u32,
    pub adaptive_sampling: bool,
    /// Bundle identifiers that are never captured.
    pub excluded_apps: Vec<String>,

    pub format: SnapshotFormat,
    pub jpeg_quality: u8,
    pub max_dimension: u32,
    pub thumbnail_max_dimension: u32,

    pub capture_while_locked: bool,
    /// Whether spooled records may carry a thumbnail.
    pub keep_thumbnails_while_locked: bool,
    pub auto_lock_after_secs: u64,
    pub auto_lock_on_sleep: bool,

    pub drain_interval_ms: u64,
    pub drain_batch_size: usize,

    pub thermal_sample_interval_ms: u64,
    pub serious_cooldown_secs: u64,
    pub critical_cooldown_secs: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            base_interval_secs: 2.0,
            max_interval_secs: 30.0,
            hamming_threshold: 5,
            adaptive_sampling: true,
            excluded_apps: Vec::new(),
            format: SnapshotFormat::Png,
            jpeg_quality: 70,
            max_dimension: 1920,
            thumbnail_max_dimension: 320,
            capture_while_locked: true,
            keep_thumbnails_while_locked: false,
            auto_lock_after_secs: 300,
            auto_lock_on_sleep: true,
            drain_interval_ms: 2_000,
            drain_batch_size: 200,
            thermal_sample_interval_ms: 1_000,
            serious_cooldown_secs: 30,
            critical_cooldown_secs: 60,
        }
    }
}

impl CaptureSettings {
    /// Repairs values that would break the cadence invariants. Intervals
    /// end up finite and within `[0, MAX_INTERVAL_SECS]` with base <= max.
    pub fn normalized(mut self) -> Self {
        let defaults = Self::default();
        if !valid_interval(self.base_interval_secs) {
            self.base_interval_secs = defaults.base_interval_secs;
        }
        if !valid_interval(self.max_interval_secs) {
            self.max_interval_secs = defaults.max_interval_secs;
        }
        self.max_interval_secs = self.max_interval_secs.max(self.base_interval_secs);
        self.jpeg_quality = self.jpeg_quality.clamp(1, 100);
        self.max_dimension = self.max_dimension.max(1);
        self.thumbnail_max_dimension = self.thumbnail_max_dimension.max(1);
        self.drain_batch_size = self.drain_batch_size.max(1);
        self.drain_interval_ms = self.drain_interval_ms.max(1);
        self
    }

    /// Falls back to the default for values `normalized` would reject.
    pub fn base_interval(&self) -> Duration {
        interval_or(self.base_interval_secs, Self::default().base_interval_secs)
    }

    /// Never below `base_interval`.
    pub fn max_interval(&self) -> Duration {
        interval_or(self.max_interval_secs, Self::default().max_interval_secs)
            .max(self.base_interval())
    }

    pub fn is_excluded(&self, bundle_id: &str) -> bool {
        self.excluded_apps.iter().any(|excluded| excluded == bundle_id)
    }
}

pub struct SettingsStore {
    path: Option<PathBuf>,
    data: RwLock<Arc<CaptureSettings>>,
}

impl SettingsStore {
    /// Loads settings from `path`, falling back to defaults when the file is
    /// missing or unreadable.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str::<CaptureSettings>(&contents).unwrap_or_else(|err| {
                warn!("Ignoring malformed settings at {}: {err}", path.display());
                CaptureSettings::default()
            })
        } else {
            CaptureSettings::default()
        };

        Ok(Self {
            path: Some(path),
            data: RwLock::new(Arc::new(data.normalized())),
        })
    }

    pub fn in_memory(settings: CaptureSettings) -> Self {
        Self {
            path: None,
            data: RwLock::new(Arc::new(settings.normalized())),
        }
    }

    pub fn snapshot(&self) -> Arc<CaptureSettings> {
        match self.data.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Swaps in a new snapshot. In-flight frames keep the one they started with.
    pub fn replace(&self, settings: CaptureSettings) {
        let next = Arc::new(settings.normalized());
        match self.data.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let contents = fs::read_to_string(path)?;
        let data: CaptureSettings = serde_json::from_str(&contents)?;
        self.replace(data);
        Ok(())
    }
}
