#![forbid(unsafe_code)]

//! Per-database coordinator for an embedded, multi-version object database.
//!
//! A process may open the same database file from many threads. The
//! [`Coordinator`] is the process-wide singleton (keyed by file path) that
//! owns the cross-thread concerns: caching open handles, observing external
//! commits, validating incoming transaction-log schema deltas, and running
//! asynchronous queries whose results track the newest committed version.

pub mod config;
pub mod coordinator;
pub mod error;
pub mod handle;
pub mod index_set;
pub mod notifier;
pub mod query;
pub mod store;
pub mod transact_log;
pub mod types;

pub use crate::config::{ColumnType, Config, LinkType, Schema, TableSchema};
pub use crate::coordinator::Coordinator;
pub use crate::error::{DuskError, Result};
pub use crate::handle::{BindingContext, Handle};
pub use crate::index_set::IndexSet;
pub use crate::notifier::CommitNotifier;
pub use crate::query::AsyncQuery;
pub use crate::store::{MemoryEngine, Snapshot, StorageEngine};
pub use crate::transact_log::{
    ChangeInfo, LinkListInfo, TransactLogHandler, TransactLogObserver, TransactLogOp,
    TransactLogValidator,
};
pub use crate::types::{VersionId, SCHEMA_NOT_VERSIONED};
