use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Atomic activity counters for one connection, plus the per-database
/// usage table behind its own lock.
#[derive(Default)]
pub(crate) struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    queue_jumpers: AtomicU64,
    messages_cancelled: AtomicU64,
    error_messages: AtomicU64,
    timeouts: AtomicU64,
    per_db: Mutex<HashMap<u16, u64>>,
}

impl Counters {
    pub(crate) fn record_sent(&self, db: Option<u16>) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        if let Some(db) = db {
            let mut per_db = self.per_db.lock().expect("per-db counter lock poisoned");
            *per_db.entry(db).or_insert(0) += 1;
        }
    }

    pub(crate) fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_queue_jumper(&self) {
        self.queue_jumpers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.messages_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error_message(&self) {
        self.error_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time snapshot. Each counter is read exactly once.
    pub(crate) fn snapshot(&self, unsent: usize) -> Stats {
        Stats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            queue_jumpers: self.queue_jumpers.load(Ordering::Relaxed),
            messages_cancelled: self.messages_cancelled.load(Ordering::Relaxed),
            error_messages: self.error_messages.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            unsent,
            per_db: self
                .per_db
                .lock()
                .expect("per-db counter lock poisoned")
                .clone(),
        }
    }
}

/// Statistics snapshot returned on demand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub queue_jumpers: u64,
    pub messages_cancelled: u64,
    pub error_messages: u64,
    pub timeouts: u64,
    /// Length of the unsent backlog at snapshot time.
    pub unsent: usize,
    /// Commands sent per logical database.
    pub per_db: HashMap<u16, u64>,
}
