//! Encryption at rest, key custody, the locked-vault spool and the lock
//! state machine that decides where each frame goes.

pub mod envelope;
pub mod keys;
pub mod migration;
pub mod spool;
pub mod state;
pub mod storage;

pub use envelope::{ContentKeyUnwrapper, EncryptedEnvelope, EnvelopeError, KekPublic, KekSecret};
pub use keys::{
    AuthContext, Authenticator, FileKeyStore, KeyBacking, KeyError, KeyManager, KeyScope, KeyStore,
    UnlockedKeys,
};
pub use migration::MigrationReport;
pub use spool::{DrainReport, IngestSpool, QueueRecord, RecordSink, SpooledImage};
pub use state::{Destination, LockReason, VaultController, VaultError, VaultPhase, VaultState};
pub use storage::{SnapshotFiles, StorageMode};
