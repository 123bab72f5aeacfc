//! SQLite-backed searchable store.
//!
//! One dedicated thread owns the connection. Async callers hand it closures
//! through `execute` and await the reply, so no rusqlite handle ever crosses
//! a tokio worker.

use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use rusqlite::Connection;
use tokio::sync::oneshot;

pub mod helpers;
mod migrations;
pub mod models;
mod repositories;

pub use models::{IngestSource, PendingSnapshot, SnapshotRecord, StoredBlobs};

use migrations::run_migrations;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type StoreJob = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum Request {
    Run(StoreJob),
    Close,
}

struct StoreThread {
    requests: mpsc::Sender<Request>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreThread {
    fn drop(&mut self) {
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(handle) = handle else {
            return;
        };
        if self.requests.send(Request::Close).is_err() {
            log_warn!("store thread already gone at shutdown");
        }
        if let Err(panic) = handle.join() {
            log_error!("store thread panicked: {panic:?}");
        }
    }
}

#[derive(Clone)]
pub struct Database {
    thread: Arc<StoreThread>,
    path: Arc<PathBuf>,
}

fn open_connection(path: &Path) -> Result<Connection> {
    let mut conn = Connection::open(path)
        .with_context(|| format!("failed to open store at {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
        log_warn!("store stays in rollback-journal mode: {err}");
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    run_migrations(&mut conn).context("failed to migrate store schema")?;
    Ok(conn)
}

fn serve(mut conn: Connection, requests: mpsc::Receiver<Request>) {
    while let Ok(request) = requests.recv() {
        match request {
            Request::Run(job) => job(&mut conn),
            Request::Close => break,
        }
    }
    log_info!("store thread stopped");
}

impl Database {
    /// Opens (creating and migrating if needed) the store at `path` and
    /// blocks until its thread is ready.
    pub fn new(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let (requests, inbox) = mpsc::channel::<Request>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
        let thread_path = path.clone();

        let handle = thread::Builder::new()
            .name("timescroll-store".into())
            .spawn(move || match open_connection(&thread_path) {
                Ok(conn) => {
                    if ready_tx.send(Ok(())).is_ok() {
                        serve(conn, inbox);
                    }
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            })
            .context("failed to spawn store thread")?;

        ready_rx
            .recv()
            .context("store thread exited during startup")??;
        log_info!("store ready at {}", path.display());

        Ok(Self {
            thread: Arc::new(StoreThread {
                requests,
                handle: Mutex::new(Some(handle)),
            }),
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `task` on the store thread. Tasks run one at a time in
    /// submission order.
    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: StoreJob = Box::new(move |conn| {
            // The caller may have been cancelled; its reply is simply dropped.
            let _ = reply_tx.send(task(conn));
        });

        self.thread
            .requests
            .send(Request::Run(job))
            .map_err(|_| anyhow!("store thread is not running"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("store thread dropped the request"))?
    }
}
