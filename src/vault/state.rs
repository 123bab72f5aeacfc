//! Vault lock state and the tasks that hang off it.
//!
//! Every transition goes through `VaultController` and is serialized by one
//! async mutex. Readers never take that mutex: the current `VaultState` is
//! published whole on a `watch` channel.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::indexer::{Indexer, SpoolIngest};
use crate::metrics::{FailureStage, MetricsCollector};
use crate::settings::{CaptureSettings, SettingsStore};
use crate::utils::fs::write_atomic;

use super::envelope::{ContentKeyUnwrapper, KekPublic};
use super::keys::{KeyError, KeyManager, UnlockedKeys};
use super::migration::{migrate_records, MigrationReport};
use super::spool::{DrainReport, IngestSpool, QueueRecord};
use super::storage::StorageMode;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

const UNLOCK_REASON: &str = "Unlock your screen history";

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("the vault is disabled")]
    Disabled,
    #[error("unlock failed: {0}")]
    UnlockFailed(#[source] KeyError),
    #[error("{0} records could not be restored to plain storage")]
    MigrationIncomplete(usize),
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VaultPhase {
    Disabled,
    Locked,
    Unlocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultState {
    pub enabled: bool,
    pub unlocked: bool,
    /// Mirrors the spool directory; recounted after every enqueue and drain.
    pub queued_count: usize,
}

impl VaultState {
    pub fn phase(&self) -> VaultPhase {
        match (self.enabled, self.unlocked) {
            (false, _) => VaultPhase::Disabled,
            (true, false) => VaultPhase::Locked,
            (true, true) => VaultPhase::Unlocked,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockReason {
    User,
    Inactivity,
    Sleep,
}

/// Where an admitted frame goes. Decided once per frame from the state at
/// that moment.
#[derive(Debug, Clone)]
pub enum Destination {
    /// Persist now, plain or sealed.
    Direct(StorageMode),
    /// Vault locked: seal into the spool for later insertion.
    Spool {
        public: KekPublic,
        keep_thumbnail: bool,
    },
}

impl Destination {
    pub fn label(&self) -> &'static str {
        match self {
            Destination::Direct(StorageMode::Plain) => "direct",
            Destination::Direct(StorageMode::Sealed(_)) => "direct-sealed",
            Destination::Spool { .. } => "spool",
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultFile {
    enabled: bool,
}

#[derive(Default)]
struct Tasks {
    drain: Option<(CancellationToken, JoinHandle<()>)>,
    idle: Option<CancellationToken>,
    migration: Option<JoinHandle<()>>,
}

struct VaultInner {
    transition: Mutex<Tasks>,
    drain_lock: Mutex<()>,
    state: watch::Sender<VaultState>,
    public: RwLock<Option<KekPublic>>,
    /// Raised for the whole of `disable`; new frames go to plain storage.
    disabling: AtomicBool,
    activity: watch::Sender<Instant>,
    keys: Arc<KeyManager>,
    spool: Arc<IngestSpool>,
    indexer: Indexer,
    settings: Arc<SettingsStore>,
    metrics: MetricsCollector,
    vault_file: PathBuf,
}

#[derive(Clone)]
pub struct VaultController {
    inner: Arc<VaultInner>,
}

impl VaultController {
    /// Restores the persisted flag from `vault_file`. An enabled vault
    /// always starts locked.
    pub fn open(
        vault_file: PathBuf,
        keys: Arc<KeyManager>,
        spool: Arc<IngestSpool>,
        indexer: Indexer,
        settings: Arc<SettingsStore>,
        metrics: MetricsCollector,
    ) -> Result<Self> {
        let persisted: VaultFile = match std::fs::read(&vault_file) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("failed to parse {}", vault_file.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => VaultFile::default(),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", vault_file.display()))
            }
        };

        let public = if persisted.enabled {
            Some(keys.ensure_key_pair()?)
        } else {
            None
        };

        let (state, _) = watch::channel(VaultState {
            enabled: persisted.enabled,
            unlocked: false,
            queued_count: spool.queued_count()?,
        });
        let (activity, _) = watch::channel(Instant::now());

        Ok(Self {
            inner: Arc::new(VaultInner {
                transition: Mutex::new(Tasks::default()),
                drain_lock: Mutex::new(()),
                state,
                public: RwLock::new(public),
                disabling: AtomicBool::new(false),
                activity,
                keys,
                spool,
                indexer,
                settings,
                metrics,
                vault_file,
            }),
        })
    }

    pub fn state(&self) -> VaultState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<VaultState> {
        self.inner.state.subscribe()
    }

    pub fn spool(&self) -> &Arc<IngestSpool> {
        &self.inner.spool
    }

    /// Recounts the spool directory.
    pub fn queued_count(&self) -> Result<usize> {
        self.inner.refresh_queued_count()
    }

    /// Picks the path for one admitted frame. `None` means the vault is
    /// locked and capture while locked is off: the frame must be dropped.
    pub fn destination(&self, settings: &CaptureSettings) -> Option<Destination> {
        if self.inner.disabling.load(Ordering::SeqCst) {
            return Some(Destination::Direct(StorageMode::Plain));
        }
        let state = self.state();
        match state.phase() {
            VaultPhase::Disabled => Some(Destination::Direct(StorageMode::Plain)),
            VaultPhase::Unlocked => self
                .inner
                .public_key()
                .map(|public| Destination::Direct(StorageMode::Sealed(public))),
            VaultPhase::Locked if settings.capture_while_locked => {
                self.inner.public_key().map(|public| Destination::Spool {
                    public,
                    keep_thumbnail: settings.keep_thumbnails_while_locked,
                })
            }
            VaultPhase::Locked => None,
        }
    }

    /// Seals `record` into the spool and republishes the count `enqueue`
    /// just took.
    pub fn spool_record(&self, record: &QueueRecord, public: &KekPublic) -> Result<()> {
        self.inner.spool.enqueue(record, public)?;
        self.inner.publish_queued_count(self.inner.spool.last_count());
        Ok(())
    }

    /// Disabled -> Locked. Key material is created if missing and existing
    /// plain records are sealed in the background.
    pub async fn enable(&self) -> Result<(), VaultError> {
        let mut tasks = self.inner.transition.lock().await;
        if self.state().enabled {
            return Ok(());
        }

        let keys = Arc::clone(&self.inner.keys);
        let public = tokio::task::spawn_blocking(move || -> Result<KekPublic, KeyError> {
            let public = keys.ensure_key_pair()?;
            keys.ensure_database_key()?;
            Ok(public)
        })
        .await
        .map_err(|err| anyhow!("key setup worker join failed: {err}"))??;

        self.inner.persist_enabled(true)?;
        *self.inner.public.write().unwrap_or_else(|p| p.into_inner()) = Some(public.clone());
        self.inner.state.send_modify(|state| {
            state.enabled = true;
            state.unlocked = false;
        });
        log_info!("vault enabled with key {}", public.id());

        self.inner.start_migration(&mut tasks, StorageMode::Sealed(public));
        Ok(())
    }

    /// Locked -> Unlocked after a successful authenticated unwrap. A failed
    /// unwrap leaves the vault locked.
    pub async fn unlock(&self) -> Result<(), VaultError> {
        let mut tasks = self.inner.transition.lock().await;
        match self.state().phase() {
            VaultPhase::Unlocked => return Ok(()),
            VaultPhase::Disabled => return Err(VaultError::Disabled),
            VaultPhase::Locked => {}
        }

        if let Err(err) = self.inner.unlock_keys().await {
            log_warn!("vault unlock failed: {err}");
            self.inner
                .metrics
                .record_failure(FailureStage::Unlock, err.to_string())
                .await;
            return Err(VaultError::UnlockFailed(err));
        }

        let public = self.inner.keys.public_key()?;
        *self.inner.public.write().unwrap_or_else(|p| p.into_inner()) = Some(public.clone());
        self.inner.state.send_modify(|state| state.unlocked = true);
        log_info!("vault unlocked");

        self.inner.start_migration(&mut tasks, StorageMode::Sealed(public));
        self.inner.start_drain(&mut tasks);
        self.start_idle_timer(&mut tasks);
        Ok(())
    }

    /// Unlocked -> Locked. An in-flight drain tick is allowed to finish;
    /// everything it has not reached stays spooled.
    pub async fn lock(&self, reason: LockReason) -> Result<(), VaultError> {
        let mut tasks = self.inner.transition.lock().await;
        if self.state().phase() != VaultPhase::Unlocked {
            return Ok(());
        }

        self.inner.state.send_modify(|state| state.unlocked = false);
        self.inner.stop_tasks(&mut tasks).await;
        self.inner.keys.discard();
        self.inner.indexer.thumbnail_cache().clear();
        log_info!("vault locked ({:?})", reason);
        Ok(())
    }

    /// Locked/Unlocked -> Disabled. Pending spool records are ingested and
    /// every sealed record is restored to plain storage first; if any record
    /// cannot be restored the vault stays enabled.
    pub async fn disable(&self) -> Result<(), VaultError> {
        let mut tasks = self.inner.transition.lock().await;
        let phase = self.state().phase();
        if phase == VaultPhase::Disabled {
            return Ok(());
        }

        let keys = match self.inner.keys.current_unlocked() {
            Some(keys) if phase == VaultPhase::Unlocked => keys,
            _ => self
                .inner
                .unlock_keys()
                .await
                .map_err(VaultError::UnlockFailed)?,
        };
        self.inner.disabling.store(true, Ordering::SeqCst);
        self.inner.stop_tasks(&mut tasks).await;
        if let Some(migration) = tasks.migration.take() {
            let _ = migration.await;
        }

        let outcome = match self.inner.restore_plain(&keys).await {
            Ok(report) if report.failed == 0 => self
                .inner
                .persist_enabled(false)
                .map(|()| report)
                .map_err(VaultError::Other),
            Ok(report) => Err(VaultError::MigrationIncomplete(report.failed)),
            Err(err) => Err(VaultError::Other(err)),
        };
        let report = match outcome {
            Ok(report) => report,
            Err(err) => {
                self.roll_back_disable(&mut tasks, phase);
                return Err(err);
            }
        };

        *self.inner.public.write().unwrap_or_else(|p| p.into_inner()) = None;
        self.inner.state.send_modify(|state| {
            state.enabled = false;
            state.unlocked = false;
        });

        // Frames that picked sealed storage just before `disabling` was raised.
        let unwrapper: &(dyn ContentKeyUnwrapper + Send + Sync) = &*keys;
        match migrate_records(
            &self.inner.indexer,
            &StorageMode::Plain,
            Some(unwrapper),
            &self.inner.metrics,
        )
        .await
        {
            Ok(late) if late.migrated > 0 => {
                log_info!("restored {} records sealed during disable", late.migrated)
            }
            Ok(_) => {}
            Err(err) => log_error!("final plain-storage pass failed: {err:#}"),
        }

        self.inner.disabling.store(false, Ordering::SeqCst);
        self.inner.keys.discard();
        self.inner.indexer.thumbnail_cache().clear();
        log_info!("vault disabled; {} records restored", report.migrated);
        Ok(())
    }

    /// Back to the phase `disable` started from.
    fn roll_back_disable(&self, tasks: &mut Tasks, phase: VaultPhase) {
        self.inner.disabling.store(false, Ordering::SeqCst);
        if phase == VaultPhase::Unlocked {
            self.inner.start_drain(tasks);
            self.start_idle_timer(tasks);
        } else {
            self.inner.keys.discard();
        }
    }

    /// One drain tick on demand. Returns `None` when the vault is not
    /// unlocked.
    pub async fn drain_now(&self) -> Result<Option<DrainReport>> {
        self.inner.drain_tick().await
    }

    /// Pushes the inactivity auto-lock deadline out.
    pub fn record_activity(&self) {
        self.inner.activity.send_replace(Instant::now());
    }

    /// System sleep notification.
    pub async fn handle_sleep(&self) -> Result<(), VaultError> {
        if self.inner.settings.snapshot().auto_lock_on_sleep {
            self.lock(LockReason::Sleep).await
        } else {
            Ok(())
        }
    }

    /// Waits for a background storage migration, if one is running.
    pub async fn wait_for_migration(&self) {
        let handle = self.inner.transition.lock().await.migration.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Unlocked keys, for reading sealed snapshots.
    pub fn unlocked_keys(&self) -> Option<Arc<UnlockedKeys>> {
        if self.state().unlocked {
            self.inner.keys.current_unlocked()
        } else {
            None
        }
    }

    fn start_idle_timer(&self, tasks: &mut Tasks) {
        if let Some(previous) = tasks.idle.take() {
            previous.cancel();
        }
        let timeout = self.inner.settings.snapshot().auto_lock_after_secs;
        if timeout == 0 {
            return;
        }

        self.record_activity();
        let token = CancellationToken::new();
        tasks.idle = Some(token.clone());
        tokio::spawn(idle_timer(
            self.clone(),
            Duration::from_secs(timeout),
            token,
        ));
    }
}

impl VaultInner {
    fn public_key(&self) -> Option<KekPublic> {
        self.public
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn is_unlocked(&self) -> bool {
        self.state.borrow().unlocked
    }

    fn refresh_queued_count(&self) -> Result<usize> {
        let count = self.spool.queued_count()?;
        self.publish_queued_count(count);
        Ok(count)
    }

    fn publish_queued_count(&self, count: usize) {
        self.state.send_if_modified(|state| {
            let changed = state.queued_count != count;
            state.queued_count = count;
            changed
        });
    }

    fn persist_enabled(&self, enabled: bool) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&VaultFile { enabled })?;
        write_atomic(&self.vault_file, &bytes)
    }

    /// May prompt; runs off the async workers.
    async fn unlock_keys(&self) -> Result<Arc<UnlockedKeys>, KeyError> {
        let keys = Arc::clone(&self.keys);
        tokio::task::spawn_blocking(move || keys.unlock(UNLOCK_REASON))
            .await
            .map_err(|err| KeyError::Other(anyhow!("unlock worker join failed: {err}")))?
    }

    fn start_migration(self: &Arc<Self>, tasks: &mut Tasks, target: StorageMode) {
        if let Some(running) = &tasks.migration {
            if !running.is_finished() {
                return;
            }
        }

        let inner = Arc::clone(self);
        tasks.migration = Some(tokio::spawn(async move {
            if let Err(err) = migrate_records(&inner.indexer, &target, None, &inner.metrics).await {
                log_error!("background storage migration failed: {err:#}");
            }
        }));
    }

    fn start_drain(self: &Arc<Self>, tasks: &mut Tasks) {
        if tasks.drain.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(drain_loop(Arc::clone(self), token.clone()));
        tasks.drain = Some((token, handle));
    }

    async fn stop_tasks(&self, tasks: &mut Tasks) {
        if let Some(idle) = tasks.idle.take() {
            idle.cancel();
        }
        if let Some((token, handle)) = tasks.drain.take() {
            token.cancel();
            if let Err(err) = handle.await {
                log_error!("drain loop task failed to join: {err}");
            }
        }
    }

    async fn drain_tick(&self) -> Result<Option<DrainReport>> {
        // Checked once per tick; a lock arriving mid-tick takes effect on the
        // next one.
        if !self.is_unlocked() {
            return Ok(None);
        }
        let keys = match self.keys.current_unlocked() {
            Some(keys) => keys,
            None => return Ok(None),
        };
        let public = self
            .public_key()
            .ok_or_else(|| anyhow!("unlocked vault has no public key"))?;

        let batch = self.settings.snapshot().drain_batch_size;
        self.drain_with(&keys, StorageMode::Sealed(public), batch)
            .await
            .map(Some)
    }

    /// Ingests whatever is still spooled and unseals every record.
    async fn restore_plain(&self, keys: &UnlockedKeys) -> Result<MigrationReport> {
        let batch = self.settings.snapshot().drain_batch_size;
        loop {
            let report = self.drain_with(keys, StorageMode::Plain, batch).await?;
            let stalled = report.ingested.is_empty() && report.quarantined == 0;
            if report.remaining == 0 || stalled {
                break;
            }
        }

        let unwrapper: &(dyn ContentKeyUnwrapper + Send + Sync) = keys;
        migrate_records(&self.indexer, &StorageMode::Plain, Some(unwrapper), &self.metrics).await
    }

    async fn drain_with(
        &self,
        keys: &UnlockedKeys,
        mode: StorageMode,
        batch: usize,
    ) -> Result<DrainReport> {
        let _serial = self.drain_lock.lock().await;
        let sink = SpoolIngest::new(self.indexer.clone(), mode);
        let report = self.spool.drain_once(keys, batch, &sink).await?;

        self.metrics
            .record_drained(report.ingested.len(), report.quarantined);
        if report.quarantined > 0 {
            self.metrics
                .record_failure(
                    FailureStage::Drain,
                    format!("{} spool records quarantined", report.quarantined),
                )
                .await;
        }
        if !report.ingested.is_empty() {
            log_info!(
                "drained {} spooled records ({} remaining)",
                report.ingested.len(),
                report.remaining
            );
        }
        self.publish_queued_count(report.remaining);
        Ok(report)
    }
}

async fn drain_loop(inner: Arc<VaultInner>, cancel_token: CancellationToken) {
    let interval = Duration::from_millis(inner.settings.snapshot().drain_interval_ms.max(1));
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match inner.drain_tick().await {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        log_debug!("drain loop stopping: vault no longer unlocked");
                        break;
                    }
                    Err(err) => log_error!("drain tick failed: {err:#}"),
                }
            }
            _ = cancel_token.cancelled() => {
                log_debug!("drain loop shutting down");
                break;
            }
        }
    }
}

async fn idle_timer(vault: VaultController, timeout: Duration, cancel_token: CancellationToken) {
    let mut activity = vault.inner.activity.subscribe();

    loop {
        let deadline = *activity.borrow_and_update() + timeout;
        tokio::select! {
            _ = time::sleep_until(deadline) => {
                if let Err(err) = vault.lock(LockReason::Inactivity).await {
                    log_error!("inactivity auto-lock failed: {err}");
                }
                break;
            }
            changed = activity.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = cancel_token.cancelled() => break,
        }
    }
}
