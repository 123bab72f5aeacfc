pub mod snapshot;

pub use snapshot::{IngestSource, PendingSnapshot, SnapshotRecord, StoredBlobs};
