// Import module: lock, discovery and the per-file pipeline

pub mod discover;
pub mod lock;
pub mod pipeline;

pub use discover::discover_import_files;
pub use lock::{HeldLock, ImportLock, LockInfo, LockStatusInfo};
pub use pipeline::{BatchError, BatchItem, ImportRequest, ImportSummary, Importer};
