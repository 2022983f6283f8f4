pub mod apply;
pub mod audit;
pub mod changeset;
pub mod crop;
pub mod error;
pub mod fetch;
pub mod spatial;
pub mod store;
pub mod sync;
pub mod value;

pub use apply::{apply_changes, ApplyResult};
pub use audit::{AuditEntry, AuditLedger, AuditRecord};
pub use changeset::{ChangeKind, ChangeRow, ChangeSet, ChangesetOutcome};
pub use error::{FetchError, SyncError};
pub use sync::{DatasetSpec, SyncEngine};
pub use value::{FieldKind, Geometry, Record, Value};
pub use rusqlite;
pub use rusqlite_migration;
pub use serde_rusqlite;
