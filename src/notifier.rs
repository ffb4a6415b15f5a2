//! External-commit notifier glue.
//!
//! One `CommitNotifier` per writable coordinator. Construction subscribes to
//! the process commit bus for the database path (the in-process stand-in for
//! the platform file-change notifier); a worker thread coalesces wakeups and
//! invokes the coordinator's change callback. `notify_others` publishes a
//! commit to every other subscriber of the same path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::OnceLock;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::Result;

enum NotifierMessage {
    Changed,
    Shutdown,
}

struct Subscriber {
    id: u64,
    sender: Sender<NotifierMessage>,
}

#[derive(Default)]
struct CommitBus {
    subscribers: Mutex<HashMap<PathBuf, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

static BUS: OnceLock<CommitBus> = OnceLock::new();

fn bus() -> &'static CommitBus {
    BUS.get_or_init(CommitBus::default)
}

impl CommitBus {
    fn register(&self, path: &Path, sender: Sender<NotifierMessage>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .push(Subscriber { id, sender });
        id
    }

    fn unregister(&self, path: &Path, id: u64) {
        let mut subscribers = self.subscribers.lock();
        if let Some(entries) = subscribers.get_mut(path) {
            entries.retain(|subscriber| subscriber.id != id);
            if entries.is_empty() {
                subscribers.remove(path);
            }
        }
    }

    fn publish(&self, path: &Path, from: u64) {
        let subscribers = self.subscribers.lock();
        if let Some(entries) = subscribers.get(path) {
            for subscriber in entries {
                if subscriber.id == from {
                    continue;
                }
                // A dead receiver just means its notifier is shutting down.
                let _ = subscriber.sender.send(NotifierMessage::Changed);
            }
        }
    }
}

pub struct CommitNotifier {
    path: PathBuf,
    id: u64,
    sender: Sender<NotifierMessage>,
    worker: Option<thread::JoinHandle<()>>,
    worker_thread: thread::ThreadId,
}

impl CommitNotifier {
    /// Subscribes to commit events for `path` and spawns the worker that
    /// drives `on_change`. The callback runs on the worker thread only.
    pub fn new<F>(path: &Path, on_change: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();
        let id = bus().register(path, sender.clone());
        let worker = thread::Builder::new()
            .name(format!("duskdb-notifier-{id}"))
            .spawn(move || Self::run(receiver, on_change));
        let worker = match worker {
            Ok(worker) => worker,
            Err(err) => {
                bus().unregister(path, id);
                return Err(err.into());
            }
        };
        debug!(path = %path.display(), id, "notifier.subscribed");
        Ok(Self {
            path: path.to_path_buf(),
            id,
            sender,
            worker_thread: worker.thread().id(),
            worker: Some(worker),
        })
    }

    /// Publishes a local commit to every other subscriber of this path.
    pub fn notify_others(&self) {
        trace!(path = %self.path.display(), id = self.id, "notifier.notify_others");
        bus().publish(&self.path, self.id);
    }

    fn run<F: Fn()>(receiver: Receiver<NotifierMessage>, on_change: F) {
        loop {
            match receiver.recv() {
                Ok(NotifierMessage::Changed) => {
                    // Coalesce a burst of commits into one wakeup.
                    loop {
                        match receiver.try_recv() {
                            Ok(NotifierMessage::Changed) => continue,
                            Ok(NotifierMessage::Shutdown) => return,
                            Err(_) => break,
                        }
                    }
                    trace!("notifier.wake");
                    on_change();
                }
                Ok(NotifierMessage::Shutdown) | Err(_) => return,
            }
        }
    }
}

impl Drop for CommitNotifier {
    fn drop(&mut self) {
        bus().unregister(&self.path, self.id);
        let _ = self.sender.send(NotifierMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            // The notifier can be dropped from its own worker thread when the
            // callback held the last reference to the coordinator; joining
            // would deadlock there.
            if thread::current().id() != self.worker_thread {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use tempfile::tempdir;

    fn wait_until(deadline: Duration, predicate: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        predicate()
    }

    #[test]
    fn publish_wakes_other_subscribers_but_not_self() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("bus.dusk");
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));

        let a_count = Arc::clone(&a_calls);
        let a = CommitNotifier::new(&path, move || {
            a_count.fetch_add(1, Ordering::SeqCst);
        })
        .expect("notifier a");
        let b_count = Arc::clone(&b_calls);
        let _b = CommitNotifier::new(&path, move || {
            b_count.fetch_add(1, Ordering::SeqCst);
        })
        .expect("notifier b");

        a.notify_others();
        assert!(wait_until(Duration::from_secs(2), || {
            b_calls.load(Ordering::SeqCst) >= 1
        }));
        assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn drop_stops_the_worker_and_unsubscribes() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("bus.dusk");
        let calls = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&calls);
        let victim = CommitNotifier::new(&path, move || {
            count.fetch_add(1, Ordering::SeqCst);
        })
        .expect("victim notifier");
        let publisher = CommitNotifier::new(&path, || {}).expect("publisher");

        drop(victim);
        publisher.notify_others();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn bursts_are_coalesced_into_fewer_wakeups() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("bus.dusk");
        let calls = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&calls);
        let _listener = CommitNotifier::new(&path, move || {
            // Slow consumer: lets the burst pile up in the channel.
            thread::sleep(Duration::from_millis(20));
            count.fetch_add(1, Ordering::SeqCst);
        })
        .expect("listener");
        let publisher = CommitNotifier::new(&path, || {}).expect("publisher");

        for _ in 0..20 {
            publisher.notify_others();
        }
        assert!(wait_until(Duration::from_secs(2), || {
            calls.load(Ordering::SeqCst) >= 1
        }));
        thread::sleep(Duration::from_millis(200));
        let total = calls.load(Ordering::SeqCst);
        assert!(total < 20, "expected coalescing, saw {total} wakeups");
    }
}
