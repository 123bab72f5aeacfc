use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::bridge::AppIdentity;
use crate::settings::CaptureSettings;

use super::frame::{Completion, Frame};
use super::phash::{PerceptualHash, PerceptualHasher};
use super::thermal::{CooldownGate, LevelChange, ThermalGovernor, ThermalLevel};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_debug;

/// Growth applied to the interval for every consecutive near-duplicate.
const ADAPTIVE_GROWTH: f64 = 1.5;

/// Per-stream admission state. Owned by one `CadenceController`; nothing else
/// mutates it.
#[derive(Debug, Clone)]
pub struct CadenceState {
    pub last_evaluated: Option<Duration>,
    pub last_hash: Option<PerceptualHash>,
    /// Consecutive near-duplicate frames since the last persisted change.
    pub stable_count: u32,
    /// Always within `[base, max]` after every mutation.
    pub current_interval: Duration,
    pub last_thermal_level: ThermalLevel,
    pub last_thermal_check: Option<Instant>,
    in_flight: bool,
}

impl CadenceState {
    pub fn new(settings: &CaptureSettings) -> Self {
        Self {
            last_evaluated: None,
            last_hash: None,
            stable_count: 0,
            current_interval: settings.base_interval(),
            last_thermal_level: ThermalLevel::Nominal,
            last_thermal_check: None,
            in_flight: false,
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    fn clamp(&mut self, settings: &CaptureSettings) {
        self.current_interval = self
            .current_interval
            .clamp(settings.base_interval(), settings.max_interval());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Arrived before the current interval elapsed.
    Cadence,
    /// Frontmost app is on the exclusion list.
    Excluded,
    /// A frame from this stream is still being encoded/persisted.
    Busy,
    /// Within the Hamming threshold of the last persisted frame.
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip(SkipReason),
    Admit(PerceptualHash),
}

/// Decides, inline on the capture callback, which frames are worth the
/// expensive encode/persist work. Per-frame cost is bounded by one hash.
pub struct CadenceController {
    state: CadenceState,
    hasher: PerceptualHasher,
    thermal: ThermalGovernor,
    cooldown: Arc<CooldownGate>,
}

impl CadenceController {
    pub fn new(
        settings: &CaptureSettings,
        thermal: ThermalGovernor,
        cooldown: Arc<CooldownGate>,
    ) -> Self {
        Self {
            state: CadenceState::new(settings),
            hasher: PerceptualHasher::new(),
            thermal,
            cooldown,
        }
    }

    pub fn state(&self) -> &CadenceState {
        &self.state
    }

    pub fn cooldown(&self) -> &Arc<CooldownGate> {
        &self.cooldown
    }

    pub fn on_frame(
        &mut self,
        frame: &Frame,
        frontmost: Option<&AppIdentity>,
        settings: &CaptureSettings,
    ) -> Decision {
        self.on_frame_at(frame, frontmost, settings, Instant::now())
    }

    pub fn on_frame_at(
        &mut self,
        frame: &Frame,
        frontmost: Option<&AppIdentity>,
        settings: &CaptureSettings,
        now: Instant,
    ) -> Decision {
        self.state.clamp(settings);

        if let Some(change) = self.thermal.sample(&mut self.state, settings, now) {
            self.apply_thermal(change, settings);
        }

        let timestamp = frame.timestamp();
        if let Some(last) = self.state.last_evaluated {
            // A timestamp that runs backwards means the source restarted; let
            // it through rather than stalling until it catches up.
            if let Some(elapsed) = timestamp.checked_sub(last) {
                if elapsed < self.state.current_interval {
                    return Decision::Skip(SkipReason::Cadence);
                }
            }
        }

        if let Some(app) = frontmost {
            if settings.is_excluded(&app.bundle_id) {
                self.state.last_evaluated = Some(timestamp);
                log_debug!("skipping frame from excluded app {}", app.bundle_id);
                return Decision::Skip(SkipReason::Excluded);
            }
        }

        if self.state.in_flight {
            return Decision::Skip(SkipReason::Busy);
        }

        self.state.last_evaluated = Some(timestamp);
        let hash = self.hasher.compute(frame);
        self.judge(hash, settings)
    }

    /// Content stage: a hash within `hamming_threshold` bits of the last
    /// persisted one is a duplicate.
    fn judge(&mut self, hash: PerceptualHash, settings: &CaptureSettings) -> Decision {
        if let Some(previous) = self.state.last_hash {
            if previous.distance(hash) <= settings.hamming_threshold {
                self.state.stable_count = self.state.stable_count.saturating_add(1);
                if settings.adaptive_sampling {
                    let grown = self.state.current_interval.mul_f64(ADAPTIVE_GROWTH);
                    self.state.current_interval = grown.min(settings.max_interval());
                }
                log_debug!(
                    "duplicate frame (stable_count={}, interval={:?})",
                    self.state.stable_count,
                    self.state.current_interval
                );
                return Decision::Skip(SkipReason::Duplicate);
            }
        }

        self.state.in_flight = true;
        Decision::Admit(hash)
    }

    /// Applies the outcome of the last admitted frame. Only a successful
    /// persist moves the reference hash and relaxes the interval.
    pub fn complete(&mut self, completion: Completion, settings: &CaptureSettings) {
        self.state.in_flight = false;
        if let Completion::Committed(hash) = completion {
            self.state.stable_count = 0;
            self.state.current_interval = settings.base_interval();
            self.state.last_hash = Some(hash);
        }
    }

    /// Thermal pressure can only widen the interval. Relaxation is left to
    /// the next committed change resetting to base.
    fn apply_thermal(&mut self, change: LevelChange, settings: &CaptureSettings) {
        if let Some(factor) = change.interval_factor {
            let widened = self
                .state
                .current_interval
                .max(settings.base_interval())
                .mul_f64(factor);
            let bounded = widened.min(settings.max_interval());
            self.state.current_interval = self.state.current_interval.max(bounded);
        }
        if let Some(until) = change.cooldown_until {
            self.cooldown.extend_to(until);
        }
    }
}
