//! Incremental unread-count bookkeeping for one viewing user.

use std::collections::{HashMap, HashSet, VecDeque};

use metrics::counter;
use shared::models::{ChangeEvent, MessageRecord, ReadReceiptRecord, UnreadState};
use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::store::{UnreadMessageRef, UnreadSnapshot, ViewerScope};

/// Bounded FIFO set of recently seen ids.
#[derive(Debug)]
struct RecentIds {
    order: VecDeque<Uuid>,
    members: HashSet<Uuid>,
    capacity: usize,
}

impl RecentIds {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity.min(1024)),
            members: HashSet::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    /// Returns `false` when `id` was already present.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.members.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity
            && let Some(evicted) = self.order.pop_front()
        {
            self.members.remove(&evicted);
        }
        true
    }

    fn contains(&self, id: &Uuid) -> bool {
        self.members.contains(id)
    }
}

/// Owns the viewer's per-thread unread counts.
///
/// Message inserts and read receipts may arrive duplicated and in any order.
/// Each applied message id is remembered for a bounded window so a
/// redelivery is a no-op, and each message the viewer has read is remembered
/// so a receipt that overtakes its message still suppresses the increment.
#[derive(Debug)]
pub struct UnreadAggregator {
    viewer_id: Uuid,
    per_thread: HashMap<Uuid, u64>,
    total: u64,
    unread_index: HashMap<Uuid, Uuid>,
    applied: RecentIds,
    read: RecentIds,
    scope: Option<ViewerScope>,
    resync_advised: bool,
}

impl UnreadAggregator {
    /// Creates an empty aggregator remembering up to `dedup_window` ids per window.
    #[must_use]
    pub fn new(viewer_id: Uuid, dedup_window: usize) -> Self {
        Self {
            viewer_id,
            per_thread: HashMap::new(),
            total: 0,
            unread_index: HashMap::new(),
            applied: RecentIds::new(dedup_window),
            read: RecentIds::new(dedup_window),
            scope: None,
            resync_advised: false,
        }
    }

    /// User whose unread messages are counted.
    #[must_use]
    pub const fn viewer_id(&self) -> Uuid {
        self.viewer_id
    }

    /// Copy of the current state.
    #[must_use]
    pub fn snapshot(&self) -> UnreadState {
        UnreadState::from_counts(&self.per_thread)
    }

    /// Whether an inconsistency was healed locally since the last replace.
    #[must_use]
    pub const fn resync_advised(&self) -> bool {
        self.resync_advised
    }

    /// Replaces the whole state with freshly fetched counts.
    ///
    /// `index` names the unread messages behind the counts where the store
    /// can provide them; entries for threads without a positive count are
    /// ignored. The redelivery window is kept.
    pub fn replace(&mut self, counts: &HashMap<Uuid, u64>, index: &[UnreadMessageRef]) {
        self.per_thread = counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(thread, count)| (*thread, *count))
            .collect();
        self.total = self.per_thread.values().sum();
        self.unread_index = index
            .iter()
            .filter(|entry| self.per_thread.contains_key(&entry.thread_id))
            .map(|entry| (entry.message_id, entry.thread_id))
            .collect();
        self.resync_advised = false;

        debug!(
            threads = self.per_thread.len(),
            total = self.total,
            indexed = self.unread_index.len(),
            "unread state replaced"
        );
    }

    /// Replaces counts, index and visibility scope from one resync.
    pub fn apply_snapshot(&mut self, snapshot: &UnreadSnapshot) {
        self.replace(&snapshot.counts, &snapshot.index);
        self.scope.clone_from(&snapshot.scope);
    }

    /// Whether `event` is visible to the viewer.
    ///
    /// Without a scope every change is admitted.
    #[must_use]
    pub fn admits(&self, event: &ChangeEvent) -> bool {
        let Some(scope) = &self.scope else {
            return true;
        };
        let visible_user =
            |user_id: Uuid| user_id == self.viewer_id || scope.contacts.contains(&user_id);

        match event {
            ChangeEvent::Message { message } => scope.threads.contains(&message.thread_id),
            ChangeEvent::ReadReceipt { receipt } => visible_user(receipt.user_id),
            ChangeEvent::CalendarEvent { event } => visible_user(event.created_by),
            ChangeEvent::Navigation { .. } => true,
        }
    }

    /// Whether `thread_id` is one of the viewer's threads. Unknown without a scope.
    #[must_use]
    pub fn covers_thread(&self, thread_id: &Uuid) -> bool {
        self.scope
            .as_ref()
            .is_some_and(|scope| scope.threads.contains(thread_id))
    }

    /// Counts a newly inserted message. Returns whether the counts changed.
    pub fn apply_message_inserted(&mut self, message: &MessageRecord) -> bool {
        if !self.applied.insert(message.id) {
            trace!(message_id = %message.id, "duplicate message delivery ignored");
            return false;
        }
        if message.is_from(self.viewer_id)
            || self.read.contains(&message.id)
            || self.unread_index.contains_key(&message.id)
        {
            return false;
        }

        self.unread_index.insert(message.id, message.thread_id);
        *self.per_thread.entry(message.thread_id).or_insert(0) += 1;
        self.total += 1;
        self.check_invariants();
        true
    }

    /// Applies a read receipt. Returns whether the counts changed.
    ///
    /// Only the viewer's receipts with a read time matter; a receipt never
    /// makes a message unread again.
    pub fn apply_read_receipt_updated(&mut self, receipt: &ReadReceiptRecord) -> bool {
        if receipt.user_id != self.viewer_id || !receipt.is_read() {
            return false;
        }

        self.read.insert(receipt.message_id);
        let Some(thread_id) = self.unread_index.remove(&receipt.message_id) else {
            trace!(message_id = %receipt.message_id, "receipt for uncounted message");
            return false;
        };

        self.decrement(thread_id);
        self.check_invariants();
        true
    }

    fn decrement(&mut self, thread_id: Uuid) {
        match self.per_thread.get_mut(&thread_id) {
            Some(count) if *count > 0 => {
                *count -= 1;
                if *count == 0 {
                    self.per_thread.remove(&thread_id);
                }
                self.total = self.total.saturating_sub(1);
            }
            _ => {
                self.per_thread.remove(&thread_id);
                self.flag_violation(thread_id, "decrement below zero clamped");
            }
        }
    }

    fn check_invariants(&mut self) {
        let sum: u64 = self.per_thread.values().sum();
        if sum != self.total {
            error!(
                expected = sum,
                actual = self.total,
                "unread total diverged from per-thread sum; clamping"
            );
            self.total = sum;
            self.mark_resync_advised();
        }
        self.per_thread.retain(|_, count| *count > 0);
    }

    fn flag_violation(&mut self, thread_id: Uuid, reason: &'static str) {
        error!(thread_id = %thread_id, reason, "unread aggregation invariant violated");
        self.mark_resync_advised();
    }

    fn mark_resync_advised(&mut self) {
        counter!("coparent_realtime_invariant_violations_total").increment(1);
        self.resync_advised = true;
    }
}
