use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::Config;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::store::Snapshot;
use crate::transact_log::ChangeInfo;
use crate::types::VersionId;

/// Consumer hooks observing a handle's view of the database.
pub trait BindingContext: Send {
    /// An external commit is available; the handle's view is now stale.
    fn changes_available(&self) {}

    /// The handle's snapshot advanced over the described changes.
    fn did_change(&self, _changes: &[ChangeInfo]) {}
}

/// One thread's view of the database: a read snapshot plus notification
/// hooks, bound to the coordinator that produced it.
pub struct Handle {
    coordinator: Arc<Coordinator>,
    config: Config,
    created_on: ThreadId,
    snapshot: Mutex<Box<dyn Snapshot>>,
    binding: Mutex<Option<Box<dyn BindingContext>>>,
    pending_change: AtomicBool,
    closed: AtomicBool,
}

impl Handle {
    pub(crate) fn new(coordinator: Arc<Coordinator>, config: Config) -> Result<Arc<Self>> {
        let mut snapshot = config.engine.open(&config)?;
        snapshot.begin_read(None)?;
        debug!(path = %config.path.display(), "handle.open");
        Ok(Arc::new(Self {
            coordinator,
            config,
            created_on: thread::current().id(),
            snapshot: Mutex::new(snapshot),
            binding: Mutex::new(None),
            pending_change: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Version of this handle's read snapshot, if it is open.
    pub fn version(&self) -> Option<VersionId> {
        self.snapshot.lock().version()
    }

    pub fn set_binding_context(&self, binding: Option<Box<dyn BindingContext>>) {
        *self.binding.lock() = binding;
    }

    /// Advances this handle's snapshot to the oldest version with ready async
    /// results, delivering them, or to the latest version when none are
    /// pending.
    pub fn refresh(&self) -> Result<()> {
        self.pending_change.store(false, Ordering::Release);
        self.coordinator.advance_to_ready(self)
    }

    /// Delivers async results already at this handle's version without
    /// advancing the snapshot.
    pub fn process_available(&self) {
        self.coordinator.process_available_async(self);
    }

    /// Whether an external commit arrived since the last refresh.
    pub fn has_pending_change(&self) -> bool {
        self.pending_change.load(Ordering::Acquire)
    }

    /// Ends the read transaction and detaches from the coordinator. Safe to
    /// call more than once.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(path = %self.config.path.display(), "handle.close");
        self.snapshot.lock().end_read();
        self.coordinator.unregister_realm(self);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn created_on(&self) -> ThreadId {
        self.created_on
    }

    pub(crate) fn snapshot(&self) -> &Mutex<Box<dyn Snapshot>> {
        &self.snapshot
    }

    /// Wakes the handle after an external commit.
    pub(crate) fn notify(&self) {
        self.pending_change.store(true, Ordering::Release);
        let binding = self.binding.lock();
        if let Some(context) = binding.as_ref() {
            context.changes_available();
        }
    }

    pub(crate) fn deliver_changes(&self, changes: &[ChangeInfo]) {
        let binding = self.binding.lock();
        if let Some(context) = binding.as_ref() {
            context.did_change(changes);
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.close();
    }
}
