//! Per-database coordinator: the process-wide singleton (keyed by file path)
//! that caches open handles, observes external commits, and keeps async query
//! results tracking the newest committed version.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::{Config, Schema};
use crate::error::{DuskError, Result};
use crate::handle::Handle;
use crate::notifier::CommitNotifier;
use crate::query::AsyncQuery;
use crate::store::Snapshot;
use crate::transact_log::TransactLogObserver;
use crate::types::{VersionId, SCHEMA_NOT_VERSIONED};

static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Weak<Coordinator>>>> = OnceLock::new();

fn registry() -> &'static Mutex<HashMap<PathBuf, Weak<Coordinator>>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// A cached handle: weakly held so the cache never prolongs handle life,
/// tagged with the thread that may reuse it.
struct CachedHandle {
    handle: Weak<Handle>,
    thread: ThreadId,
    cache: bool,
}

impl CachedHandle {
    fn new(handle: &Arc<Handle>, cache: bool) -> Self {
        Self {
            handle: Arc::downgrade(handle),
            thread: handle.created_on(),
            cache,
        }
    }

    fn upgrade(&self) -> Option<Arc<Handle>> {
        self.handle.upgrade()
    }

    fn expired(&self) -> bool {
        self.handle.strong_count() == 0
    }

    fn is_for(&self, handle: &Handle) -> bool {
        std::ptr::eq(self.handle.as_ptr(), handle)
    }

    fn is_cached_for_current_thread(&self) -> bool {
        self.cache && self.thread == thread::current().id()
    }
}

#[derive(Default)]
struct HandleState {
    config: Option<Config>,
    cached: Vec<CachedHandle>,
    notifier: Option<CommitNotifier>,
}

#[derive(Default)]
struct QueryState {
    config: Option<Config>,
    queries: Vec<Arc<dyn AsyncQuery>>,
    new_queries: Vec<Arc<dyn AsyncQuery>>,
    query_snapshot: Option<Box<dyn Snapshot>>,
    advancer_snapshot: Option<Box<dyn Snapshot>>,
    // Sticky: once an async open or advance fails, every subsequent deliver
    // hands the error to consumers and no further helper work is attempted.
    async_error: Option<Arc<DuskError>>,
}

/// The per-file coordinator. One instance per path is live in a process at a
/// time; handles hold it strongly, the registry only weakly.
pub struct Coordinator {
    path: PathBuf,
    handles: Mutex<HandleState>,
    queries: Mutex<QueryState>,
}

impl Coordinator {
    /// Returns the coordinator for `path`, creating it if no live one exists.
    pub fn get_coordinator(path: impl AsRef<Path>) -> Arc<Coordinator> {
        let path = path.as_ref().to_path_buf();
        let mut map = registry().lock();
        if let Some(weak) = map.get(&path) {
            if let Some(coordinator) = weak.upgrade() {
                return coordinator;
            }
        }
        debug!(path = %path.display(), "coordinator.create");
        let coordinator = Arc::new(Coordinator {
            path: path.clone(),
            handles: Mutex::new(HandleState::default()),
            queries: Mutex::new(QueryState::default()),
        });
        map.insert(path, Arc::downgrade(&coordinator));
        coordinator
    }

    /// Returns the live coordinator for `path` without creating one.
    pub fn get_existing_coordinator(path: impl AsRef<Path>) -> Option<Arc<Coordinator>> {
        let map = registry().lock();
        map.get(path.as_ref()).and_then(Weak::upgrade)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens (or reuses) a handle for the calling thread.
    ///
    /// The first open captures the configuration and, for writable databases,
    /// constructs the external-commit notifier. Later opens must agree with
    /// the captured configuration on read permissions, in-memory setting,
    /// encryption key, and (when declared) schema version.
    pub fn get_realm(self: &Arc<Self>, config: Config) -> Result<Arc<Handle>> {
        let mut state = self.handles.lock();

        let first_open = match &state.config {
            None => true,
            Some(current) => {
                (!current.read_only && state.notifier.is_none())
                    || (current.read_only && state.cached.is_empty())
            }
        };

        if first_open {
            if !config.read_only && state.notifier.is_none() {
                let weak = Arc::downgrade(self);
                let notifier = CommitNotifier::new(&config.path, move || {
                    if let Some(coordinator) = weak.upgrade() {
                        coordinator.on_change();
                    }
                })
                .map_err(|err| DuskError::FileAccess {
                    path: config.path.clone(),
                    message: err.to_string(),
                })?;
                state.notifier = Some(notifier);
            }
            state.config = Some(config.clone());
            self.queries.lock().config = Some(config.clone());
        } else if let Some(current) = &state.config {
            if current.read_only != config.read_only {
                return Err(DuskError::MismatchedConfig("read permissions"));
            }
            if current.in_memory != config.in_memory {
                return Err(DuskError::MismatchedConfig("in-memory settings"));
            }
            if current.encryption_key != config.encryption_key {
                return Err(DuskError::MismatchedConfig("encryption key"));
            }
            if current.schema_version != config.schema_version
                && config.schema_version != SCHEMA_NOT_VERSIONED
            {
                return Err(DuskError::MismatchedConfig("schema version"));
            }
        }

        if config.cache {
            for cached in &state.cached {
                if cached.is_cached_for_current_thread() {
                    // Can be dead if we jumped in between the ref count
                    // hitting zero and unregister_realm getting the lock.
                    if let Some(handle) = cached.upgrade() {
                        return Ok(handle);
                    }
                }
            }
        }

        let cache = state.config.as_ref().map_or(config.cache, |c| c.cache);
        let handle = Handle::new(Arc::clone(self), config)?;
        state.cached.push(CachedHandle::new(&handle, cache));
        Ok(handle)
    }

    /// Opens a handle with the configuration captured by the first open.
    pub fn get_realm_cached(self: &Arc<Self>) -> Result<Arc<Handle>> {
        let config = self
            .handles
            .lock()
            .config
            .clone()
            .ok_or(DuskError::Invalid("database has not been opened yet"))?;
        self.get_realm(config)
    }

    /// The captured schema, while any handle is cached.
    pub fn schema(&self) -> Option<Arc<Schema>> {
        let state = self.handles.lock();
        if state.cached.is_empty() {
            None
        } else {
            state.config.as_ref().and_then(|config| config.schema.clone())
        }
    }

    /// Removes the entry for `handle`, along with any expired entries.
    pub fn unregister_realm(&self, handle: &Handle) {
        let mut state = self.handles.lock();
        let mut i = 0;
        while i < state.cached.len() {
            let cached = &state.cached[i];
            if !cached.expired() && !cached.is_for(handle) {
                i += 1;
                continue;
            }
            state.cached.swap_remove(i);
        }
    }

    /// Drops every coordinator's notifier and closes every cached handle
    /// process-wide. Handles stay usable afterwards; they are just no longer
    /// cached.
    pub fn clear_cache() {
        let mut coordinators: Vec<Arc<Coordinator>> = Vec::new();
        let mut to_close: Vec<Weak<Handle>> = Vec::new();
        {
            let mut map = registry().lock();
            for weak in map.values() {
                if let Some(coordinator) = weak.upgrade() {
                    coordinators.push(coordinator);
                }
            }
            for coordinator in &coordinators {
                let mut state = coordinator.handles.lock();
                state.notifier = None;
                for cached in &state.cached {
                    to_close.push(cached.handle.clone());
                }
            }
            map.clear();
        }
        // Closing reenters the coordinator, and dropping the last reference
        // to one locks the registry again, so both happen with it released.
        drop(coordinators);
        for weak in to_close {
            if let Some(handle) = weak.upgrade() {
                handle.close();
            }
        }
    }

    /// Publishes a local commit so other processes' coordinators wake up.
    pub fn send_commit_notifications(&self) {
        let state = self.handles.lock();
        debug_assert!(
            state.config.as_ref().is_some_and(|config| !config.read_only),
            "read-only coordinators cannot commit"
        );
        if let Some(notifier) = &state.notifier {
            notifier.notify_others();
        }
    }

    /// Called by the notifier on its own thread after an external commit.
    pub fn on_change(&self) {
        self.run_async_queries();

        let handles: Vec<Arc<Handle>> = {
            let state = self.handles.lock();
            state.cached.iter().filter_map(CachedHandle::upgrade).collect()
        };
        for handle in &handles {
            handle.notify();
        }
    }

    /// Registers a query at its pinned version; it joins the main list at the
    /// next run.
    pub fn register_query(&self, query: Arc<dyn AsyncQuery>) {
        let mut state = self.queries.lock();
        if let Some(version) = query.version() {
            Self::pin_version(&mut state, version);
        }
        state.new_queries.push(query);
    }

    // Keeps the advancer snapshot holding a read on the oldest version any
    // pending query is anchored to.
    fn pin_version(state: &mut QueryState, version: VersionId) {
        if state.async_error.is_some() {
            return;
        }
        if state.advancer_snapshot.is_none() {
            match Self::open_snapshot(state, Some(version)) {
                Ok(snapshot) => state.advancer_snapshot = Some(snapshot),
                Err(err) => {
                    warn!(error = %err, "coordinator.pin_version.failed");
                    state.async_error = Some(Arc::new(err));
                    state.advancer_snapshot = None;
                }
            }
            return;
        }

        let result = {
            let advancer = match state.advancer_snapshot.as_mut() {
                Some(advancer) => advancer,
                None => return,
            };
            if state.new_queries.is_empty() {
                // First pending query: the advancer is idle.
                advancer.begin_read(Some(version)).map(|_| ())
            } else if advancer.version().map_or(true, |current| version < current) {
                // Hold a read on the oldest version we will hand over from.
                advancer.end_read();
                advancer.begin_read(Some(version)).map(|_| ())
            } else {
                Ok(())
            }
        };
        if let Err(err) = result {
            warn!(error = %err, "coordinator.pin_version.failed");
            state.async_error = Some(Arc::new(err));
            state.advancer_snapshot = None;
        }
    }

    fn open_snapshot(state: &QueryState, version: Option<VersionId>) -> Result<Box<dyn Snapshot>> {
        let config = state
            .config
            .as_ref()
            .ok_or(DuskError::Invalid("database has not been opened yet"))?;
        let mut snapshot = config.engine.open(config)?;
        snapshot.begin_read(version)?;
        Ok(snapshot)
    }

    fn open_query_snapshot(state: &mut QueryState) {
        if state.query_snapshot.is_none() {
            match Self::open_snapshot(state, None) {
                Ok(snapshot) => state.query_snapshot = Some(snapshot),
                Err(err) => {
                    warn!(error = %err, "coordinator.open_query_snapshot.failed");
                    state.async_error = Some(Arc::new(err));
                    state.query_snapshot = None;
                }
            }
        } else if state.queries.is_empty() {
            // The read was released when the query list emptied; start a new
            // one at the current version.
            let result = match state.query_snapshot.as_mut() {
                Some(snapshot) if snapshot.version().is_none() => {
                    snapshot.begin_read(None).map(|_| ())
                }
                _ => Ok(()),
            };
            if let Err(err) = result {
                warn!(error = %err, "coordinator.open_query_snapshot.failed");
                state.async_error = Some(Arc::new(err));
            }
        }
    }

    fn move_new_queries_to_main(state: &mut QueryState) {
        let pending = std::mem::take(&mut state.new_queries);
        state.queries.extend(pending);
    }

    fn run_async_queries(&self) {
        let mut state = self.queries.lock();

        Self::clean_up_dead_queries(&mut state);

        if state.queries.is_empty() && state.new_queries.is_empty() {
            return;
        }

        if state.async_error.is_none() {
            Self::open_query_snapshot(&mut state);
        }

        if state.async_error.is_some() {
            // Promote pending queries so consumers observe the error through
            // deliver.
            Self::move_new_queries_to_main(&mut state);
            return;
        }

        let mut observer = TransactLogObserver::new();
        if let Err(err) = Self::advance_helper_to_latest(&mut state, &mut observer) {
            warn!(error = %err, "coordinator.run_queries.failed");
            state.async_error = Some(Arc::new(err));
            Self::move_new_queries_to_main(&mut state);
            return;
        }

        // Copy the list so the queries run with the lock released.
        let to_run = state.queries.clone();
        let changes = observer.into_changes();
        drop(state);

        trace!(queries = to_run.len(), "coordinator.run_queries");
        for query in &to_run {
            query.run(&changes);
        }

        // Reacquire while updating the fields read on consumer threads.
        let mut state = self.queries.lock();
        for query in &to_run {
            query.prepare_handover();
        }
        Self::clean_up_dead_queries(&mut state);
    }

    fn advance_helper_to_latest(
        state: &mut QueryState,
        observer: &mut TransactLogObserver,
    ) -> Result<()> {
        if state.new_queries.is_empty() {
            let snapshot = state
                .query_snapshot
                .as_mut()
                .ok_or(DuskError::Invalid("query snapshot is not open"))?;
            snapshot.advance_read(Some(observer), None)?;
            return Ok(());
        }

        // Sort pending queries by source version so a single pass over the
        // transaction log pulls them all forward.
        state.new_queries.sort_by_key(|query| query.version());

        let advancer = state
            .advancer_snapshot
            .as_mut()
            .ok_or(DuskError::Invalid("advancer snapshot is not open"))?;
        for query in &state.new_queries {
            if let Some(version) = query.version() {
                advancer.advance_read(None, Some(version))?;
            }
            query.attach_to(&**advancer);
        }

        // Advance both snapshots to the newest version, landing them on the
        // same commit.
        let latest = advancer.advance_read(None, None)?;
        let snapshot = state
            .query_snapshot
            .as_mut()
            .ok_or(DuskError::Invalid("query snapshot is not open"))?;
        snapshot.advance_read(Some(observer), Some(latest))?;

        for query in &state.new_queries {
            query.detach();
            query.attach_to(&**snapshot);
        }

        Self::move_new_queries_to_main(state);
        if let Some(advancer) = state.advancer_snapshot.as_mut() {
            advancer.end_read();
        }
        Ok(())
    }

    fn clean_up_dead_queries(state: &mut QueryState) {
        fn sweep(list: &mut Vec<Arc<dyn AsyncQuery>>) -> bool {
            let mut removed = false;
            let mut i = 0;
            while i < list.len() {
                if list[i].is_alive() {
                    i += 1;
                    continue;
                }
                // Destroy the query now even if consumer references linger.
                list[i].release_query();
                list.swap_remove(i);
                removed = true;
            }
            removed
        }

        // Snapshots stay open (re-opening is expensive) but stop holding a
        // read version nobody is anchored to.
        if sweep(&mut state.queries) && state.queries.is_empty() {
            if let Some(snapshot) = state.query_snapshot.as_mut() {
                snapshot.end_read();
            }
        }
        if sweep(&mut state.new_queries) && state.new_queries.is_empty() {
            if let Some(advancer) = state.advancer_snapshot.as_mut() {
                advancer.end_read();
            }
        }
    }

    /// Advances `handle`'s snapshot to the oldest version with ready async
    /// results, delivering them, or to the latest version when no live query
    /// is targeted.
    pub fn advance_to_ready(&self, handle: &Handle) -> Result<()> {
        let mut delivered: Vec<Arc<dyn AsyncQuery>> = Vec::new();
        {
            let state = self.queries.lock();
            let mut snapshot = handle.snapshot().lock();

            let target = state
                .queries
                .iter()
                .filter(|query| query.is_alive())
                .filter_map(|query| query.version())
                .min();

            match target {
                None => {
                    // No targeted async results; just advance to latest.
                    return Self::advance_handle(handle, &mut **snapshot, None);
                }
                Some(version) => {
                    if let Some(current) = snapshot.version() {
                        if version < current {
                            // Async results are out of date; ignore.
                            return Ok(());
                        }
                    }
                    Self::advance_handle(handle, &mut **snapshot, Some(version))?;
                    let error = state.async_error.clone();
                    for query in &state.queries {
                        if query.deliver(&**snapshot, error.as_ref()) {
                            delivered.push(Arc::clone(query));
                        }
                    }
                }
            }
        }
        for query in &delivered {
            query.call_callbacks();
        }
        Ok(())
    }

    /// Delivers any async results already at `handle`'s version without
    /// advancing its snapshot.
    pub fn process_available_async(&self, handle: &Handle) {
        let mut delivered: Vec<Arc<dyn AsyncQuery>> = Vec::new();
        {
            let state = self.queries.lock();
            let snapshot = handle.snapshot().lock();
            let error = state.async_error.clone();
            for query in &state.queries {
                if query.deliver(&**snapshot, error.as_ref()) {
                    delivered.push(Arc::clone(query));
                }
            }
        }
        for query in &delivered {
            query.call_callbacks();
        }
    }

    fn advance_handle(
        handle: &Handle,
        snapshot: &mut dyn Snapshot,
        target: Option<VersionId>,
    ) -> Result<()> {
        let mut observer = TransactLogObserver::new();
        snapshot.advance_read(Some(&mut observer), target)?;
        handle.deliver_changes(observer.changes());
        Ok(())
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        let mut map = registry().lock();
        map.retain(|_, weak| weak.strong_count() > 0);
    }
}
