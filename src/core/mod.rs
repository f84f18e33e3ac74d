pub mod engine;
pub mod fingerprint;
pub mod metadata;
pub mod scanner;

pub use engine::{run_sync, SyncEngine, SyncEvent, SyncReport, SyncStatus};
pub use fingerprint::{delta, fingerprint, local_delta};
pub use metadata::{preserve_directory, preserve_file};
pub use scanner::{FileScanner, ScanConfig};
