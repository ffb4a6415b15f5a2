//! Storage-engine collaborator boundary.
//!
//! The coordinator never touches pages or B-trees itself; it drives the
//! engine through these traits. A snapshot is a read transaction pinned to a
//! committed version, carrying its own history cursor so it can replay
//! transaction logs while advancing.

pub mod memory;

pub use memory::MemoryEngine;

use crate::config::Config;
use crate::error::Result;
use crate::transact_log::TransactLogHandler;
use crate::types::VersionId;

pub trait StorageEngine: Send + Sync {
    /// Opens the database described by `config`, yielding a snapshot handle
    /// with no active read.
    fn open(&self, config: &Config) -> Result<Box<dyn Snapshot>>;
}

pub trait Snapshot: Send {
    /// Begins a read transaction at `version`, or at the newest committed
    /// version when `None`. Returns the pinned version.
    fn begin_read(&mut self, version: Option<VersionId>) -> Result<VersionId>;

    /// Ends the active read transaction, releasing the pinned version.
    /// A snapshot without an active read is left untouched.
    fn end_read(&mut self);

    /// Version of the active read transaction, if any.
    fn version(&self) -> Option<VersionId>;

    /// Advances the active read to `target` (the newest committed version
    /// when `None`), replaying the intervening transaction logs through
    /// `handler`. Returns the version landed on. On a handler error the read
    /// stays at its current version.
    fn advance_read(
        &mut self,
        handler: Option<&mut dyn TransactLogHandler>,
        target: Option<VersionId>,
    ) -> Result<VersionId>;
}
