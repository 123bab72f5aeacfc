use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sysinfo::Components;
use tokio::{
    runtime::Handle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::bridge::ThermalSource;
use crate::settings::CaptureSettings;

use super::cadence::CadenceState;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_info, log_warn};

/// Fallback when a sensor does not report its own critical threshold.
const DEFAULT_CRITICAL_CELSIUS: f32 = 100.0;

const MIN_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermalLevel {
    Nominal,
    Fair,
    Serious,
    Critical,
}

impl Default for ThermalLevel {
    fn default() -> Self {
        ThermalLevel::Nominal
    }
}

impl ThermalLevel {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThermalLevel::Nominal,
            1 => ThermalLevel::Fair,
            2 => ThermalLevel::Serious,
            _ => ThermalLevel::Critical,
        }
    }

    /// Multiplier applied to the sampling interval on entering this level.
    pub fn interval_factor(self) -> Option<f64> {
        match self {
            ThermalLevel::Serious => Some(2.0),
            ThermalLevel::Critical => Some(3.0),
            ThermalLevel::Nominal | ThermalLevel::Fair => None,
        }
    }

    pub fn cooldown(self, settings: &CaptureSettings) -> Option<Duration> {
        match self {
            ThermalLevel::Serious => Some(Duration::from_secs(settings.serious_cooldown_secs)),
            ThermalLevel::Critical => Some(Duration::from_secs(settings.critical_cooldown_secs)),
            ThermalLevel::Nominal | ThermalLevel::Fair => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelChange {
    pub from: ThermalLevel,
    pub to: ThermalLevel,
    pub interval_factor: Option<f64>,
    /// Requested end of the extraction cooldown, if the new level imposes one.
    pub cooldown_until: Option<Instant>,
}

/// Window during which text extraction is suppressed.
///
/// Shared between the capture context (writer) and the extraction lane
/// (reader). The expiry only ever moves forward.
#[derive(Debug, Default)]
pub struct CooldownGate {
    expiry: Mutex<Option<Instant>>,
}

impl CooldownGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extends the window to `until` unless it already reaches further.
    /// Returns the effective expiry.
    pub fn extend_to(&self, until: Instant) -> Instant {
        let mut guard = match self.expiry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let effective = match *guard {
            Some(current) if current >= until => current,
            _ => until,
        };
        *guard = Some(effective);
        effective
    }

    pub fn expiry(&self) -> Option<Instant> {
        match self.expiry.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    pub fn is_active_at(&self, now: Instant) -> bool {
        self.expiry().is_some_and(|expiry| now < expiry)
    }
}

pub struct ThermalGovernor {
    source: Box<dyn ThermalSource>,
}

impl ThermalGovernor {
    pub fn new(source: Box<dyn ThermalSource>) -> Self {
        Self { source }
    }

    /// Reads the heat-pressure signal at most once per
    /// `thermal_sample_interval_ms`; calls in between return `None` without
    /// touching the source.
    pub fn sample(
        &self,
        state: &mut CadenceState,
        settings: &CaptureSettings,
        now: Instant,
    ) -> Option<LevelChange> {
        let min_gap = Duration::from_millis(settings.thermal_sample_interval_ms);
        if let Some(last) = state.last_thermal_check {
            if now.saturating_duration_since(last) < min_gap {
                return None;
            }
        }
        state.last_thermal_check = Some(now);

        let level = self.source.current_level();
        let previous = state.last_thermal_level;
        if level == previous {
            return None;
        }
        state.last_thermal_level = level;

        let change = LevelChange {
            from: previous,
            to: level,
            interval_factor: level.interval_factor(),
            cooldown_until: level.cooldown(settings).map(|window| now + window),
        };

        if level > previous {
            log_info!("thermal level rose {:?} -> {:?}", previous, level);
        } else {
            log_debug!("thermal level eased {:?} -> {:?}", previous, level);
        }
        Some(change)
    }
}

/// Thermal source backed by the host's temperature sensors.
///
/// The hottest sensor relative to its own critical threshold decides the
/// level; hosts without sensors always report nominal. Sensors are read on a
/// blocking worker every `poll_every`; `current_level` only loads the last
/// published level. Polling stops when the source is dropped.
pub struct SysinfoThermalSource {
    level: Arc<AtomicU8>,
    _stop: DropGuard,
}

impl SysinfoThermalSource {
    /// Starts polling on the current tokio runtime.
    pub fn spawn(poll_every: Duration) -> Result<Self> {
        Handle::try_current().context("thermal polling needs a tokio runtime")?;
        let mut components: Option<Components> = None;
        Ok(Self::polling(poll_every, move || {
            let components = components.get_or_insert_with(Components::new_with_refreshed_list);
            components.refresh();
            hottest_level(components)
        }))
    }

    fn polling<F>(poll_every: Duration, sampler: F) -> Self
    where
        F: FnMut() -> ThermalLevel + Send + 'static,
    {
        let level = Arc::new(AtomicU8::new(ThermalLevel::Nominal as u8));
        let stop = CancellationToken::new();
        tokio::spawn(poll_loop(
            poll_every,
            sampler,
            Arc::clone(&level),
            stop.clone(),
        ));
        Self {
            level,
            _stop: stop.drop_guard(),
        }
    }
}

impl ThermalSource for SysinfoThermalSource {
    fn current_level(&self) -> ThermalLevel {
        ThermalLevel::from_u8(self.level.load(Ordering::Relaxed))
    }
}

async fn poll_loop<F>(
    poll_every: Duration,
    mut sampler: F,
    level: Arc<AtomicU8>,
    stop: CancellationToken,
) where
    F: FnMut() -> ThermalLevel + Send + 'static,
{
    let mut ticker = time::interval(poll_every.max(MIN_POLL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let joined = tokio::task::spawn_blocking(move || {
            let sampled = sampler();
            (sampler, sampled)
        })
        .await;
        match joined {
            Ok((returned, sampled)) => {
                sampler = returned;
                level.store(sampled as u8, Ordering::Relaxed);
            }
            Err(err) => {
                log_warn!("thermal sensor read failed, polling stopped: {err}");
                break;
            }
        }
    }
    log_debug!("thermal polling stopped");
}

fn hottest_level(components: &Components) -> ThermalLevel {
    let mut hottest: f32 = 0.0;
    for component in components.list() {
        let temperature = component.temperature();
        if !temperature.is_finite() {
            continue;
        }
        let critical = component
            .critical()
            .filter(|value| value.is_finite() && *value > 0.0)
            .unwrap_or(DEFAULT_CRITICAL_CELSIUS);
        hottest = hottest.max(temperature / critical);
    }
    level_for_ratio(hottest)
}

fn level_for_ratio(ratio: f32) -> ThermalLevel {
    if ratio < 0.75 {
        ThermalLevel::Nominal
    } else if ratio < 0.85 {
        ThermalLevel::Fair
    } else if ratio < 0.95 {
        ThermalLevel::Serious
    } else {
        ThermalLevel::Critical
    }
}
