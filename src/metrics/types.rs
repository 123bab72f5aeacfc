use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timings for one admitted frame on the work context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub timestamp: DateTime<Utc>,
    pub destination: String,
    pub encode_ms: u64,
    pub encoded_bytes: usize,
    pub persist_ms: u64,
    pub total_ms: u64,
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Encode,
    Persist,
    Spool,
    Extract,
    Drain,
    Migration,
    Unlock,
}

/// Published on the diagnostic channel whenever something is dropped or
/// quarantined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub at: DateTime<Utc>,
    pub stage: FailureStage,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub admitted: u64,
    pub skipped_cadence: u64,
    pub skipped_excluded: u64,
    pub skipped_busy: u64,
    pub skipped_duplicate: u64,
    pub persisted: u64,
    pub spooled: u64,
    pub drained: u64,
    pub quarantined: u64,
    pub extraction_completed: u64,
    pub extraction_skipped: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_percent: f32,
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub system: SystemMetrics,
    pub counters: CounterSnapshot,
    pub recent_frames: Vec<FrameMetrics>,
    pub recent_failures: Vec<DiagnosticEvent>,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            system: SystemMetrics {
                cpu_percent: 0.0,
                memory_mb: 0.0,
            },
            counters: CounterSnapshot::default(),
            recent_frames: Vec::new(),
            recent_failures: Vec::new(),
        }
    }
}
