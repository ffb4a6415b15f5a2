//! Shared test doubles for the coordinator suites.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use duskdb::{
    AsyncQuery, ChangeInfo, Config, DuskError, MemoryEngine, Result, Snapshot, StorageEngine,
    VersionId,
};

/// Installs the tracing subscriber once per test binary so failing tests
/// emit the coordinator's diagnostics under `RUST_LOG`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A fresh directory for one test's database path. Coordinators are keyed by
/// path, so every test gets its own to keep the process registry disjoint.
pub fn test_dir() -> TempDir {
    init_tracing();
    tempfile::tempdir().expect("temp dir")
}

/// An async query that records everything the coordinator does to it.
pub struct RecordingQuery {
    version: Mutex<Option<VersionId>>,
    prepared: Mutex<Option<VersionId>>,
    alive: AtomicBool,
    runs: AtomicUsize,
    last_changed_rows: Mutex<Vec<Vec<usize>>>,
    delivered_version: Mutex<Option<VersionId>>,
    delivered_error: Mutex<Option<Arc<DuskError>>>,
    callbacks: AtomicUsize,
    released: AtomicBool,
}

impl RecordingQuery {
    pub fn new(version: VersionId) -> Arc<Self> {
        Arc::new(Self {
            version: Mutex::new(Some(version)),
            prepared: Mutex::new(None),
            alive: AtomicBool::new(true),
            runs: AtomicUsize::new(0),
            last_changed_rows: Mutex::new(Vec::new()),
            delivered_version: Mutex::new(None),
            delivered_error: Mutex::new(None),
            callbacks: AtomicUsize::new(0),
            released: AtomicBool::new(false),
        })
    }

    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn callbacks(&self) -> usize {
        self.callbacks.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn current_version(&self) -> Option<VersionId> {
        *self.version.lock()
    }

    pub fn delivered_version(&self) -> Option<VersionId> {
        *self.delivered_version.lock()
    }

    pub fn delivered_error(&self) -> Option<Arc<DuskError>> {
        self.delivered_error.lock().clone()
    }

    pub fn last_changed_rows(&self) -> Vec<Vec<usize>> {
        self.last_changed_rows.lock().clone()
    }
}

impl AsyncQuery for RecordingQuery {
    fn version(&self) -> Option<VersionId> {
        *self.version.lock()
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn run(&self, changes: &[ChangeInfo]) {
        self.runs.fetch_add(1, Ordering::SeqCst);
        *self.last_changed_rows.lock() = changes
            .iter()
            .map(|info| info.changed.iter().collect())
            .collect();
    }

    fn prepare_handover(&self) {
        *self.prepared.lock() = *self.version.lock();
    }

    fn deliver(&self, snapshot: &dyn Snapshot, error: Option<&Arc<DuskError>>) -> bool {
        if let Some(error) = error {
            *self.delivered_error.lock() = Some(Arc::clone(error));
            *self.version.lock() = None;
            return true;
        }
        let prepared = match *self.prepared.lock() {
            Some(prepared) => prepared,
            None => return false,
        };
        match snapshot.version() {
            Some(current) if current >= prepared => {
                *self.delivered_version.lock() = Some(prepared);
                *self.version.lock() = None;
                *self.prepared.lock() = None;
                true
            }
            _ => false,
        }
    }

    fn attach_to(&self, snapshot: &dyn Snapshot) {
        *self.version.lock() = snapshot.version();
    }

    fn detach(&self) {}

    fn release_query(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn call_callbacks(&self) {
        self.callbacks.fetch_add(1, Ordering::SeqCst);
    }
}

/// Storage engine that fails every open after the first `successful_opens`.
pub struct FailingEngine {
    inner: MemoryEngine,
    opens_left: AtomicUsize,
}

impl FailingEngine {
    pub fn new(inner: MemoryEngine, successful_opens: usize) -> Self {
        Self {
            inner,
            opens_left: AtomicUsize::new(successful_opens),
        }
    }
}

impl StorageEngine for FailingEngine {
    fn open(&self, config: &Config) -> Result<Box<dyn Snapshot>> {
        let allowed = self
            .opens_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                left.checked_sub(1)
            })
            .is_ok();
        if allowed {
            self.inner.open(config)
        } else {
            Err(DuskError::FileAccess {
                path: config.path.clone(),
                message: "simulated open failure".into(),
            })
        }
    }
}
