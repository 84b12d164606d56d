//! Transaction-id allocation. Ids increase monotonically (mod 2^32) across
//! restarts: a ceiling is persisted ahead of use, so even a crash cannot
//! reissue an id a peer might still associate with an old transaction. The
//! very first id of a fresh deployment comes from an unpredictable seed
//! rather than zero, which makes blind spoofing of in-flight transactions
//! harder.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Context;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, warn};

/// How far the persisted ceiling runs ahead of the live counter, and how
/// far an unclean restart advances past the ceiling.
const SAFETY_MARGIN: u32 = 1024;

/// Counter values are re-persisted every this many allocations.
const PERSIST_INTERVAL: u32 = 1024;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CounterSnapshot {
    pub value: u32,
    /// False if the snapshot was written while the server was running, i.e.
    /// the previous shutdown was unclean.
    pub clean: bool,
}

/// Consumed persistence interface for the transaction-id counter.
#[cfg_attr(test, automock)]
pub trait CounterStore: Send + Sync + 'static {
    fn load(&self) -> anyhow::Result<Option<CounterSnapshot>>;

    fn store(&self, snapshot: CounterSnapshot) -> anyhow::Result<()>;
}

/// Single-file implementation: `<value> <0|1>` in plain text.
pub struct FileCounterStore {
    path: PathBuf,
}

impl FileCounterStore {
    pub fn new(path: impl Into<PathBuf>) -> FileCounterStore {
        FileCounterStore { path: path.into() }
    }
}

impl CounterStore for FileCounterStore {
    fn load(&self) -> anyhow::Result<Option<CounterSnapshot>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).context("reading transaction-id snapshot"),
        };

        let mut fields = raw.split_whitespace();
        let value = fields
            .next()
            .and_then(|v| v.parse::<u32>().ok())
            .context("malformed transaction-id snapshot")?;
        let clean = fields.next() == Some("1");
        Ok(Some(CounterSnapshot { value, clean }))
    }

    fn store(&self, snapshot: CounterSnapshot) -> anyhow::Result<()> {
        let clean = if snapshot.clean { 1 } else { 0 };
        std::fs::write(&self.path, format!("{} {}\n", snapshot.value, clean))
            .context("writing transaction-id snapshot")
    }
}

pub(crate) struct TransIdCounter {
    next: AtomicU32,
    store: Option<Arc<dyn CounterStore>>,
}

impl TransIdCounter {
    pub(crate) fn new(store: Option<Arc<dyn CounterStore>>) -> anyhow::Result<TransIdCounter> {
        let start = match store.as_ref().map(|s| s.load()).transpose()?.flatten() {
            Some(snapshot) if snapshot.clean => snapshot.value,
            Some(snapshot) => {
                warn!("unclean shutdown detected, advancing transaction ids past the persisted ceiling");
                snapshot.value.wrapping_add(SAFETY_MARGIN)
            }
            None => {
                let seed = rand::random::<u32>();
                debug!("no transaction-id snapshot, seeding randomly");
                seed
            }
        };

        let counter = TransIdCounter { next: AtomicU32::new(start), store };
        counter.persist_ceiling(start);
        Ok(counter)
    }

    pub(crate) fn allocate(&self) -> u32 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        if id % PERSIST_INTERVAL == 0 {
            self.persist_ceiling(id);
        }
        id
    }

    /// Write the in-progress marker with a ceiling comfortably ahead of the
    /// ids actually handed out. Persistence failures are logged, not fatal:
    /// the transport keeps working, at the cost of weaker restart
    /// guarantees.
    fn persist_ceiling(&self, current: u32) {
        if let Some(store) = &self.store {
            let snapshot = CounterSnapshot { value: current.wrapping_add(2 * SAFETY_MARGIN), clean: false };
            if let Err(e) = store.store(snapshot) {
                warn!("failed to persist transaction-id ceiling: {:#}", e);
            }
        }
    }

    /// Record the exact counter value with the clean marker. Called once on
    /// orderly shutdown.
    pub(crate) fn persist_clean(&self) {
        if let Some(store) = &self.store {
            let snapshot = CounterSnapshot { value: self.next.load(Ordering::Relaxed), clean: true };
            if let Err(e) = store.store(snapshot) {
                warn!("failed to persist transaction-id counter on shutdown: {:#}", e);
            }
        }
    }
}
