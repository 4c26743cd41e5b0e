pub mod engine;
pub mod ledger;
pub mod reconciler;
pub mod run_log;
pub mod scanner;
pub mod snapshot;

pub use engine::{SyncConfig, SyncEngine, SyncItem, SyncOutcome, SyncReport};
pub use ledger::{FailureLedger, LedgerEntry};
pub use reconciler::{Change, ChangeSet, Deletion, ReconcileMode, ReconcileStats, Reconciler};
pub use run_log::{RunCounts, RunLog, RunRecord};
pub use scanner::{DirectoryLister, FsScanner, LiveEntry, Listing, ScanConfig};
pub use snapshot::{Bootstrap, DeleteOutcome, SnapshotStore, StoredEntry, UpdateOutcome};
