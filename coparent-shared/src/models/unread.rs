use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unread count for a single thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadThreadSummary {
    /// Thread identifier.
    pub thread_id: Uuid,
    /// Messages in the thread the viewer has not read.
    pub unread: u64,
}

/// Snapshot of the viewer's unread messages.
///
/// `total` always equals the sum of `per_thread`, and `per_thread` holds no
/// zero entries. Consumers receive owned copies; mutating one never touches
/// the hub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadState {
    /// Unread count per thread, zero entries pruned.
    pub per_thread: BTreeMap<Uuid, u64>,
    /// Sum of all per-thread counts.
    pub total: u64,
}

impl UnreadState {
    /// Builds a state from raw counts, dropping zero entries.
    #[must_use]
    pub fn from_counts(counts: &HashMap<Uuid, u64>) -> Self {
        let per_thread: BTreeMap<Uuid, u64> = counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(thread, count)| (*thread, *count))
            .collect();
        let total = per_thread.values().sum();
        Self { per_thread, total }
    }

    /// Unread count for `thread_id`, zero when absent.
    #[must_use]
    pub fn unread_in(&self, thread_id: &Uuid) -> u64 {
        self.per_thread.get(thread_id).copied().unwrap_or(0)
    }

    /// Whether `total` matches the per-thread sum and no zero entry is kept.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.per_thread.values().all(|count| *count > 0)
            && self.per_thread.values().sum::<u64>() == self.total
    }

    /// Per-thread entries in thread id order.
    #[must_use]
    pub fn summaries(&self) -> Vec<UnreadThreadSummary> {
        self.per_thread
            .iter()
            .map(|(thread_id, unread)| UnreadThreadSummary {
                thread_id: *thread_id,
                unread: *unread,
            })
            .collect()
    }
}
