use std::{
    sync::{mpsc as std_mpsc, Arc},
    time::Instant,
};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::info;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::{ForegroundProbe, ImageEncoder};
use crate::indexer::Indexer;
use crate::metrics::MetricsCollector;
use crate::settings::SettingsStore;
use crate::vault::VaultController;

use super::cadence::{CadenceController, CadenceState, Decision};
use super::frame::{Completion, Frame, InFlightFrame};
use super::loop_worker::{extraction_loop, work_loop, AdmittedFrame, FrameProcessor};
use super::thermal::{CooldownGate, ThermalGovernor};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::log_warn;

/// Single-flight admission keeps at most one frame in here.
const WORK_QUEUE_CAPACITY: usize = 2;
const EXTRACTION_QUEUE_CAPACITY: usize = 4;

/// Shared services a capture stream runs against.
#[derive(Clone)]
pub struct CaptureContext {
    pub settings: Arc<SettingsStore>,
    pub probe: Arc<dyn ForegroundProbe>,
    pub encoder: Arc<dyn ImageEncoder>,
    pub indexer: Indexer,
    pub vault: VaultController,
    pub metrics: MetricsCollector,
    /// Must be the gate the indexer checks.
    pub cooldown: Arc<CooldownGate>,
}

/// The capture-callback side of one stream. Owned by whoever delivers frames;
/// `on_frame` never blocks and never touches disk.
pub struct CaptureStream {
    cadence: CadenceController,
    completions: std_mpsc::Receiver<Completion>,
    completion_tx: std_mpsc::Sender<Completion>,
    work_tx: mpsc::Sender<AdmittedFrame>,
    settings: Arc<SettingsStore>,
    probe: Arc<dyn ForegroundProbe>,
    metrics: MetricsCollector,
}

impl CaptureStream {
    pub fn on_frame(&mut self, frame: Frame) -> Decision {
        self.on_frame_at(frame, Instant::now())
    }

    pub fn on_frame_at(&mut self, frame: Frame, now: Instant) -> Decision {
        let settings = self.settings.snapshot();
        self.collect_completions();

        let app = self.probe.frontmost_app();
        let decision = self.cadence.on_frame_at(&frame, app.as_ref(), &settings, now);
        match decision {
            Decision::Skip(reason) => self.metrics.record_skip(reason),
            Decision::Admit(hash) => {
                self.metrics.record_admitted();
                let admitted = AdmittedFrame {
                    guard: InFlightFrame::new(frame, hash, self.completion_tx.clone()),
                    app,
                    captured_at: Utc::now(),
                    settings,
                };
                if let Err(err) = self.work_tx.try_send(admitted) {
                    // Dropping the rejected frame releases the stream.
                    log_warn!("work queue rejected an admitted frame: {err}");
                }
            }
        }
        decision
    }

    /// Applies finished work to the cadence state. Called at the top of
    /// every frame; also useful before inspecting `cadence`.
    pub fn collect_completions(&mut self) {
        let settings = self.settings.snapshot();
        while let Ok(completion) = self.completions.try_recv() {
            self.cadence.complete(completion, &settings);
        }
    }

    pub fn cadence(&self) -> &CadenceState {
        self.cadence.state()
    }
}

pub struct SensingController {
    handles: Vec<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl SensingController {
    pub fn new() -> Self {
        Self {
            handles: Vec::new(),
            cancel_token: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.cancel_token.is_some()
    }

    /// Spawns the work context and the extraction lane for a new stream and
    /// hands back its capture side.
    pub fn start(&mut self, context: &CaptureContext, thermal: ThermalGovernor) -> Result<CaptureStream> {
        if self.is_active() {
            bail!("capture already active");
        }

        let cancel_token = CancellationToken::new();
        let (work_tx, work_rx) = mpsc::channel(WORK_QUEUE_CAPACITY);
        let (extraction_tx, extraction_rx) = mpsc::channel(EXTRACTION_QUEUE_CAPACITY);
        let (completion_tx, completions) = std_mpsc::channel();

        let processor = FrameProcessor::new(
            Arc::clone(&context.encoder),
            context.indexer.clone(),
            context.vault.clone(),
            context.metrics.clone(),
            extraction_tx,
        );
        self.handles.push(tokio::spawn(work_loop(
            processor,
            work_rx,
            cancel_token.clone(),
        )));
        self.handles.push(tokio::spawn(extraction_loop(
            context.indexer.clone(),
            context.metrics.clone(),
            extraction_rx,
            cancel_token.clone(),
        )));
        self.cancel_token = Some(cancel_token);
        info!("capture stream started");

        let settings = context.settings.snapshot();
        Ok(CaptureStream {
            cadence: CadenceController::new(&settings, thermal, Arc::clone(&context.cooldown)),
            completions,
            completion_tx,
            work_tx,
            settings: Arc::clone(&context.settings),
            probe: Arc::clone(&context.probe),
            metrics: context.metrics.clone(),
        })
    }

    /// Cancels the stream's tasks and waits for them. Frames still queued are
    /// released, not persisted.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        for handle in self.handles.drain(..) {
            handle.await.context("capture task failed to join")?;
        }
        Ok(())
    }
}

impl Default for SensingController {
    fn default() -> Self {
        Self::new()
    }
}
