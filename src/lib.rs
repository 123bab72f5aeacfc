pub mod bridge;
pub mod db;
pub mod indexer;
pub mod metrics;
pub mod sensing;
pub mod settings;
pub mod utils;
pub mod vault;

use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, Result};
use log::info;
use tokio::sync::Mutex;

use bridge::{ForegroundProbe, ImageEncoder, NoForegroundProbe, TextExtractor, ThermalSource};
use db::Database;
use indexer::Indexer;
use metrics::MetricsCollector;
use sensing::{
    CaptureContext, CaptureStream, CooldownGate, RasterEncoder, SensingController, ThermalGovernor,
};
use settings::SettingsStore;
use vault::{
    Authenticator, FileKeyStore, IngestSpool, KeyManager, KeyStore, SnapshotFiles, VaultController,
};

/// Installs the global logger. `RUST_LOG` wins over the `info` default;
/// `TIMESCROLL_DEBUG=1` turns on debug output for this crate.
pub fn init_logging() {
    let mut builder = env_logger::Builder::new();
    builder
        .filter_level(log::LevelFilter::Info)
        .parse_default_env();
    if std::env::var("TIMESCROLL_DEBUG").is_ok_and(|value| value == "1") {
        builder.filter_module("timescroll", log::LevelFilter::Debug);
    }
    // A host or a test harness may have installed one already.
    let _ = builder.try_init();
}

/// Host-provided capabilities.
pub struct Platform {
    pub extractor: Arc<dyn TextExtractor>,
    pub authenticator: Arc<dyn Authenticator>,
    pub probe: Arc<dyn ForegroundProbe>,
    pub encoder: Arc<dyn ImageEncoder>,
    /// Preferred over the file store when it reports itself available.
    pub hardware_keys: Option<Arc<dyn KeyStore>>,
}

impl Platform {
    pub fn new(extractor: Arc<dyn TextExtractor>, authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            extractor,
            authenticator,
            probe: Arc::new(NoForegroundProbe),
            encoder: Arc::new(RasterEncoder::new()),
            hardware_keys: None,
        }
    }
}

/// Everything under one data directory, wired together.
///
/// Layout: `settings.json`, `timescroll.sqlite3`, `snapshots/`, `spool/`,
/// `keys/` and `vault.json`.
pub struct Recorder {
    context: CaptureContext,
    keys: Arc<KeyManager>,
    sensing: Mutex<SensingController>,
}

impl Recorder {
    pub fn open(data_dir: &Path, platform: Platform) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        let settings = Arc::new(SettingsStore::new(data_dir.join("settings.json"))?);
        let metrics = MetricsCollector::new();
        let database = Database::new(data_dir.join("timescroll.sqlite3"))?;
        let cooldown = Arc::new(CooldownGate::new());
        let indexer = Indexer::new(
            database,
            SnapshotFiles::new(data_dir.join("snapshots")),
            platform.extractor,
            Arc::clone(&cooldown),
            metrics.clone(),
        );

        let software: Arc<dyn KeyStore> = Arc::new(FileKeyStore::new(data_dir.join("keys")));
        let keys = Arc::new(match platform.hardware_keys {
            Some(hardware) => KeyManager::with_hardware(hardware, software, platform.authenticator),
            None => KeyManager::new(software, platform.authenticator),
        });

        let spool = Arc::new(IngestSpool::open(data_dir.join("spool"))?);
        let vault = VaultController::open(
            data_dir.join("vault.json"),
            Arc::clone(&keys),
            spool,
            indexer.clone(),
            Arc::clone(&settings),
            metrics.clone(),
        )?;

        info!(
            "timescroll opened at {} (vault {:?}, {:?} keys)",
            data_dir.display(),
            vault.state().phase(),
            keys.backing()
        );

        Ok(Self {
            context: CaptureContext {
                settings,
                probe: platform.probe,
                encoder: platform.encoder,
                indexer,
                vault,
                metrics,
                cooldown,
            },
            keys,
            sensing: Mutex::new(SensingController::new()),
        })
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.context.settings
    }

    pub fn indexer(&self) -> &Indexer {
        &self.context.indexer
    }

    pub fn vault(&self) -> &VaultController {
        &self.context.vault
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.context.metrics
    }

    pub fn keys(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    pub fn cooldown(&self) -> &Arc<CooldownGate> {
        &self.context.cooldown
    }

    /// Starts the work context and extraction lane; the returned stream is
    /// what the capture source feeds.
    pub async fn start_capture(&self, thermal: Box<dyn ThermalSource>) -> Result<CaptureStream> {
        self.sensing
            .lock()
            .await
            .start(&self.context, ThermalGovernor::new(thermal))
    }

    pub async fn stop_capture(&self) -> Result<()> {
        self.sensing.lock().await.stop().await
    }
}
