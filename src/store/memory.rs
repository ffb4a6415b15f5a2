//! In-memory multi-version storage engine.
//!
//! Backs `in_memory` configurations and the test suites. Every committed
//! version retains its transaction log so snapshots can advance through
//! history; read snapshots pin the version they sit on with a reference
//! count, which keeps "never release a pinned version" observable.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::config::Config;
use crate::error::{DuskError, Result};
use crate::transact_log::{TransactLogHandler, TransactLogOp};
use crate::types::VersionId;

use super::{Snapshot, StorageEngine};

struct Committed {
    id: VersionId,
    ops: Vec<TransactLogOp>,
}

#[derive(Default)]
struct EngineState {
    versions: Vec<Committed>,
    pins: HashMap<VersionId, usize>,
}

impl EngineState {
    fn latest(&self) -> Result<VersionId> {
        self.versions
            .last()
            .map(|committed| committed.id)
            .ok_or(DuskError::Corruption("engine has no committed version"))
    }

    fn contains(&self, version: VersionId) -> bool {
        self.versions.iter().any(|committed| committed.id == version)
    }

    fn pin(&mut self, version: VersionId) {
        *self.pins.entry(version).or_insert(0) += 1;
    }

    fn unpin(&mut self, version: VersionId) {
        if let Some(count) = self.pins.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&version);
            }
        }
    }
}

#[derive(Clone)]
pub struct MemoryEngine {
    state: Arc<Mutex<EngineState>>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    /// Creates an engine holding a single empty committed version.
    pub fn new() -> Self {
        let state = EngineState {
            versions: vec![Committed { id: VersionId::new(1, 0), ops: Vec::new() }],
            pins: HashMap::new(),
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Commits a transaction, retaining its log, and returns the new version.
    pub fn commit(&self, ops: Vec<TransactLogOp>) -> VersionId {
        let mut state = self.state.lock();
        let next = match state.versions.last() {
            Some(committed) => VersionId::new(committed.id.version + 1, 0),
            None => VersionId::new(1, 0),
        };
        trace!(version = %next, ops = ops.len(), "memstore.commit");
        state.versions.push(Committed { id: next, ops });
        next
    }

    pub fn latest_version(&self) -> VersionId {
        self.state
            .lock()
            .versions
            .last()
            .map(|committed| committed.id)
            .unwrap_or(VersionId::new(0, 0))
    }

    /// Versions currently pinned by at least one read snapshot, ascending.
    pub fn pinned_versions(&self) -> Vec<VersionId> {
        let state = self.state.lock();
        let mut pinned: Vec<VersionId> = state.pins.keys().copied().collect();
        pinned.sort();
        pinned
    }

    pub fn is_pinned(&self, version: VersionId) -> bool {
        self.state.lock().pins.contains_key(&version)
    }
}

impl StorageEngine for MemoryEngine {
    fn open(&self, _config: &Config) -> Result<Box<dyn Snapshot>> {
        Ok(Box::new(MemorySnapshot {
            state: Arc::clone(&self.state),
            current: None,
        }))
    }
}

struct MemorySnapshot {
    state: Arc<Mutex<EngineState>>,
    current: Option<VersionId>,
}

impl Snapshot for MemorySnapshot {
    fn begin_read(&mut self, version: Option<VersionId>) -> Result<VersionId> {
        if self.current.is_some() {
            return Err(DuskError::Invalid("read transaction already active"));
        }
        let mut state = self.state.lock();
        let target = match version {
            Some(version) => {
                if !state.contains(version) {
                    return Err(DuskError::VersionUnavailable(version));
                }
                version
            }
            None => state.latest()?,
        };
        state.pin(target);
        self.current = Some(target);
        Ok(target)
    }

    fn end_read(&mut self) {
        if let Some(version) = self.current.take() {
            self.state.lock().unpin(version);
        }
    }

    fn version(&self) -> Option<VersionId> {
        self.current
    }

    fn advance_read(
        &mut self,
        handler: Option<&mut dyn TransactLogHandler>,
        target: Option<VersionId>,
    ) -> Result<VersionId> {
        let current = self
            .current
            .ok_or(DuskError::Invalid("no active read transaction"))?;

        // Replay outside the state lock so handlers cannot deadlock against
        // concurrent commits; the retained logs are immutable once committed.
        let (target, pending): (VersionId, Vec<Vec<TransactLogOp>>) = {
            let state = self.state.lock();
            let target = match target {
                Some(version) => {
                    if !state.contains(version) {
                        return Err(DuskError::VersionUnavailable(version));
                    }
                    version
                }
                None => state.latest()?,
            };
            if target < current {
                return Err(DuskError::Invalid("cannot advance a read backwards"));
            }
            let pending = state
                .versions
                .iter()
                .filter(|committed| committed.id > current && committed.id <= target)
                .map(|committed| committed.ops.clone())
                .collect();
            (target, pending)
        };

        if let Some(handler) = handler {
            for transaction in &pending {
                for op in transaction {
                    handler.op(op)?;
                }
                handler.parse_complete();
            }
        }

        let mut state = self.state.lock();
        state.pin(target);
        state.unpin(current);
        self.current = Some(target);
        Ok(target)
    }
}

impl Drop for MemorySnapshot {
    fn drop(&mut self) {
        self.end_read();
    }
}
