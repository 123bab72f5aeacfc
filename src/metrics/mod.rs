mod types;

pub use types::{
    CounterSnapshot, DiagnosticEvent, FailureStage, FrameMetrics, MetricsSnapshot, SystemMetrics,
};

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::Utc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::{broadcast, Mutex};

use crate::sensing::SkipReason;

const MAX_RECENT_FRAMES: usize = 20;
const MAX_RECENT_FAILURES: usize = 20;
const DIAGNOSTIC_CHANNEL_CAPACITY: usize = 64;

/// Lock-free so the capture callback can count skips without waiting.
#[derive(Default)]
struct Counters {
    admitted: AtomicU64,
    skipped_cadence: AtomicU64,
    skipped_excluded: AtomicU64,
    skipped_busy: AtomicU64,
    skipped_duplicate: AtomicU64,
    persisted: AtomicU64,
    spooled: AtomicU64,
    drained: AtomicU64,
    quarantined: AtomicU64,
    extraction_completed: AtomicU64,
    extraction_skipped: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CounterSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CounterSnapshot {
            admitted: load(&self.admitted),
            skipped_cadence: load(&self.skipped_cadence),
            skipped_excluded: load(&self.skipped_excluded),
            skipped_busy: load(&self.skipped_busy),
            skipped_duplicate: load(&self.skipped_duplicate),
            persisted: load(&self.persisted),
            spooled: load(&self.spooled),
            drained: load(&self.drained),
            quarantined: load(&self.quarantined),
            extraction_completed: load(&self.extraction_completed),
            extraction_skipped: load(&self.extraction_skipped),
            failures: load(&self.failures),
        }
    }
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

pub struct MetricsCollector {
    counters: Arc<Counters>,
    inner: Arc<Mutex<MetricsState>>,
    events: broadcast::Sender<DiagnosticEvent>,
}

struct MetricsState {
    recent_frames: VecDeque<FrameMetrics>,
    recent_failures: VecDeque<DiagnosticEvent>,
    system: System,
    pid: Pid,
}

impl MetricsCollector {
    pub fn new() -> Self {
        let mut system = System::new();
        let pid = Pid::from_u32(std::process::id());

        // Initial refresh to establish baseline for CPU calculation
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        let (events, _) = broadcast::channel(DIAGNOSTIC_CHANNEL_CAPACITY);
        Self {
            counters: Arc::new(Counters::default()),
            inner: Arc::new(Mutex::new(MetricsState {
                recent_frames: VecDeque::with_capacity(MAX_RECENT_FRAMES),
                recent_failures: VecDeque::with_capacity(MAX_RECENT_FAILURES),
                system,
                pid,
            })),
            events,
        }
    }

    /// Diagnostic channel. Lagging receivers lose the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.events.subscribe()
    }

    pub fn record_admitted(&self) {
        bump(&self.counters.admitted, 1);
    }

    pub fn record_skip(&self, reason: SkipReason) {
        let counter = match reason {
            SkipReason::Cadence => &self.counters.skipped_cadence,
            SkipReason::Excluded => &self.counters.skipped_excluded,
            SkipReason::Busy => &self.counters.skipped_busy,
            SkipReason::Duplicate => &self.counters.skipped_duplicate,
        };
        bump(counter, 1);
    }

    pub fn record_persisted(&self) {
        bump(&self.counters.persisted, 1);
    }

    pub fn record_spooled(&self) {
        bump(&self.counters.spooled, 1);
    }

    pub fn record_drained(&self, ingested: usize, quarantined: usize) {
        bump(&self.counters.drained, ingested as u64);
        bump(&self.counters.quarantined, quarantined as u64);
    }

    pub fn record_extraction(&self, completed: bool) {
        if completed {
            bump(&self.counters.extraction_completed, 1);
        } else {
            bump(&self.counters.extraction_skipped, 1);
        }
    }

    /// Sample current CPU and memory usage of this process.
    /// CPU usage requires multiple refreshes over time to calculate delta.
    pub async fn sample_system_metrics(&self) -> (f32, f64) {
        let mut state = self.inner.lock().await;
        let pid = state.pid;
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        if let Some(process) = state.system.process(pid) {
            (
                process.cpu_usage(),
                process.memory() as f64 / 1024.0 / 1024.0,
            )
        } else {
            (0.0, 0.0)
        }
    }

    pub async fn record_frame(&self, metrics: FrameMetrics) {
        let mut state = self.inner.lock().await;
        state.recent_frames.push_back(metrics);
        while state.recent_frames.len() > MAX_RECENT_FRAMES {
            state.recent_frames.pop_front();
        }
    }

    /// Counts a dropped or quarantined item and publishes it.
    pub async fn record_failure(&self, stage: FailureStage, message: impl Into<String>) {
        bump(&self.counters.failures, 1);
        let event = DiagnosticEvent {
            at: Utc::now(),
            stage,
            message: message.into(),
        };
        // No subscribers is fine.
        let _ = self.events.send(event.clone());

        let mut state = self.inner.lock().await;
        state.recent_failures.push_back(event);
        while state.recent_failures.len() > MAX_RECENT_FAILURES {
            state.recent_failures.pop_front();
        }
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub async fn get_snapshot(&self) -> MetricsSnapshot {
        let mut state = self.inner.lock().await;
        let pid = state.pid;

        // Refresh to get current CPU/RAM
        state.system.refresh_processes(ProcessesToUpdate::Some(&[pid]));

        let system_metrics = if let Some(process) = state.system.process(pid) {
            SystemMetrics {
                cpu_percent: process.cpu_usage(),
                memory_mb: process.memory() as f64 / 1024.0 / 1024.0,
            }
        } else {
            SystemMetrics {
                cpu_percent: 0.0,
                memory_mb: 0.0,
            }
        };

        MetricsSnapshot {
            system: system_metrics,
            counters: self.counters.snapshot(),
            recent_frames: state.recent_frames.iter().cloned().collect(),
            recent_failures: state.recent_failures.iter().cloned().collect(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MetricsCollector {
    fn clone(&self) -> Self {
        Self {
            counters: Arc::clone(&self.counters),
            inner: Arc::clone(&self.inner),
            events: self.events.clone(),
        }
    }
}
