use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Sequence number handed out when a refresh starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RefreshTicket(u64);

impl RefreshTicket {
    pub fn sequence(self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
struct Applied<T> {
    sequence: u64,
    value: Arc<T>,
}

/// Last completed fetch of a remote collection.
///
/// Readers always see a whole value. A refresh takes a ticket before it
/// starts fetching and installs its result with that ticket; a result whose
/// ticket is older than the one already applied is dropped, so an early
/// fetch that finishes late cannot overwrite newer data.
#[derive(Debug)]
pub struct SnapshotCell<T> {
    issued: AtomicU64,
    applied: RwLock<Applied<T>>,
}

impl<T: Default> Default for SnapshotCell<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> SnapshotCell<T> {
    pub fn new(initial: T) -> Self {
        Self {
            issued: AtomicU64::new(0),
            applied: RwLock::new(Applied {
                sequence: 0,
                value: Arc::new(initial),
            }),
        }
    }

    pub fn begin(&self) -> RefreshTicket {
        RefreshTicket(self.issued.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Install `value` unless a newer ticket already landed. Returns whether
    /// the value was installed.
    pub fn apply(&self, ticket: RefreshTicket, value: T) -> bool {
        let mut applied = match self.applied.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ticket.0 <= applied.sequence {
            return false;
        }
        applied.sequence = ticket.0;
        applied.value = Arc::new(value);
        true
    }

    pub fn current(&self) -> Arc<T> {
        match self.applied.read() {
            Ok(guard) => Arc::clone(&guard.value),
            Err(poisoned) => Arc::clone(&poisoned.into_inner().value),
        }
    }

    /// Sequence of the installed value; 0 until the first refresh lands.
    pub fn last_applied(&self) -> u64 {
        match self.applied.read() {
            Ok(guard) => guard.sequence,
            Err(poisoned) => poisoned.into_inner().sequence,
        }
    }
}
