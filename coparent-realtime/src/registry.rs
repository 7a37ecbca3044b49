//! Typed multi-channel callback registry.
//!
//! Each channel keeps an ordered list of subscriber callbacks. Dispatch runs
//! synchronously over a snapshot of that list taken when the dispatch starts,
//! so subscribers added or removed while callbacks run only affect later
//! dispatches. A panicking callback is logged and skipped; the remaining
//! subscribers still receive the payload and the panicking one stays
//! registered.

use std::{
    any::Any,
    collections::BTreeMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use metrics::counter;
use shared::models::{
    CalendarEventRecord, ChannelKind, MessageRecord, ReadReceiptRecord, UnreadState,
};
use tracing::{error, trace};

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

/// Identity of one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A named channel and the payload type its subscribers receive.
pub trait Channel: 'static {
    /// Value handed to every subscriber.
    type Payload: Send + Sync + 'static;
    /// Channel tag used in logs and metrics.
    const KIND: ChannelKind;

    /// The channel's subscriber list inside `registry`.
    fn topic(registry: &CallbackRegistry) -> &Arc<Topic<Self::Payload>>;
}

/// Inserted messages.
#[derive(Debug)]
pub enum MessageChannel {}

/// Recomputed unread aggregate.
#[derive(Debug)]
pub enum UnreadCountsChannel {}

/// Upserted read receipts.
#[derive(Debug)]
pub enum ReadReceiptChannel {}

/// Upserted calendar events.
#[derive(Debug)]
pub enum CalendarEventChannel {}

/// Navigation paths pushed to the viewer.
#[derive(Debug)]
pub enum NavigationChannel {}

impl Channel for MessageChannel {
    type Payload = MessageRecord;
    const KIND: ChannelKind = ChannelKind::Message;

    fn topic(registry: &CallbackRegistry) -> &Arc<Topic<Self::Payload>> {
        &registry.message
    }
}

impl Channel for UnreadCountsChannel {
    type Payload = UnreadState;
    const KIND: ChannelKind = ChannelKind::UnreadCounts;

    fn topic(registry: &CallbackRegistry) -> &Arc<Topic<Self::Payload>> {
        &registry.unread_counts
    }
}

impl Channel for ReadReceiptChannel {
    type Payload = ReadReceiptRecord;
    const KIND: ChannelKind = ChannelKind::ReadReceipt;

    fn topic(registry: &CallbackRegistry) -> &Arc<Topic<Self::Payload>> {
        &registry.read_receipt
    }
}

impl Channel for CalendarEventChannel {
    type Payload = CalendarEventRecord;
    const KIND: ChannelKind = ChannelKind::CalendarEvent;

    fn topic(registry: &CallbackRegistry) -> &Arc<Topic<Self::Payload>> {
        &registry.calendar_event
    }
}

impl Channel for NavigationChannel {
    type Payload = String;
    const KIND: ChannelKind = ChannelKind::Navigation;

    fn topic(registry: &CallbackRegistry) -> &Arc<Topic<Self::Payload>> {
        &registry.navigation
    }
}

/// Subscribers of one channel, keyed by id.
///
/// Ids are handed out in increasing order, so iterating the map visits
/// subscribers in registration order.
pub struct Topic<T> {
    subscribers: Mutex<BTreeMap<SubscriptionId, Callback<T>>>,
}

impl<T> Topic<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(BTreeMap::new()),
        })
    }

    fn push(&self, id: SubscriptionId, callback: Callback<T>) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, callback);
    }

    fn snapshot(&self) -> Vec<(SubscriptionId, Callback<T>)> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, callback)| (*id, Arc::clone(callback)))
            .collect()
    }

    fn len(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<T> fmt::Debug for Topic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("subscribers", &self.len())
            .finish()
    }
}

trait Unsubscribe: Send + Sync {
    fn unsubscribe(&self, id: SubscriptionId) -> bool;
}

impl<T: 'static> Unsubscribe for Topic<T> {
    fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }
}

/// Cancels exactly one registration.
///
/// Dropping a `Disposer` without calling [`Disposer::dispose`] leaves the
/// subscription registered.
pub struct Disposer {
    id: SubscriptionId,
    channel: ChannelKind,
    topic: Weak<dyn Unsubscribe>,
    disposed: AtomicBool,
}

impl Disposer {
    /// Registration this disposer cancels.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Channel of the registration.
    #[must_use]
    pub const fn channel(&self) -> ChannelKind {
        self.channel
    }

    /// Whether [`Disposer::dispose`] has been called.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Removes the registration from future dispatches. Repeated calls are no-ops.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(topic) = self.topic.upgrade()
            && topic.unsubscribe(self.id)
        {
            trace!(channel = %self.channel, subscription = %self.id, "subscription disposed");
        }
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Callbacks that returned normally.
    pub delivered: usize,
    /// Callbacks that panicked.
    pub failed: usize,
}

/// Registry holding one subscriber list per [`ChannelKind`].
pub struct CallbackRegistry {
    next_id: AtomicU64,
    message: Arc<Topic<MessageRecord>>,
    unread_counts: Arc<Topic<UnreadState>>,
    read_receipt: Arc<Topic<ReadReceiptRecord>>,
    calendar_event: Arc<Topic<CalendarEventRecord>>,
    navigation: Arc<Topic<String>>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("message", &self.message.len())
            .field("unread_counts", &self.unread_counts.len())
            .field("read_receipt", &self.read_receipt.len())
            .field("calendar_event", &self.calendar_event.len())
            .field("navigation", &self.navigation.len())
            .finish()
    }
}

impl CallbackRegistry {
    /// Creates a registry with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            message: Topic::new(),
            unread_counts: Topic::new(),
            read_receipt: Topic::new(),
            calendar_event: Topic::new(),
            navigation: Topic::new(),
        }
    }

    /// Appends `callback` to channel `C` and returns its disposer.
    pub fn register<C, F>(&self, callback: F) -> Disposer
    where
        C: Channel,
        F: Fn(&C::Payload) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let topic = C::topic(self);
        topic.push(id, Arc::new(callback));

        let erased: Arc<dyn Unsubscribe> = Arc::clone(topic) as Arc<dyn Unsubscribe>;
        trace!(channel = %C::KIND, subscription = %id, "subscription registered");

        Disposer {
            id,
            channel: C::KIND,
            topic: Arc::downgrade(&erased),
            disposed: AtomicBool::new(false),
        }
    }

    /// Invokes every subscriber of `C` in registration order.
    pub fn dispatch<C: Channel>(&self, payload: &C::Payload) -> DispatchReport {
        let mut report = DispatchReport::default();

        for (id, callback) in C::topic(self).snapshot() {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(payload))) {
                Ok(()) => report.delivered += 1,
                Err(cause) => {
                    report.failed += 1;
                    counter!(
                        "coparent_realtime_callback_failures_total",
                        "channel" => C::KIND.as_str()
                    )
                    .increment(1);
                    error!(
                        channel = %C::KIND,
                        subscription = %id,
                        cause = panic_message(cause.as_ref()),
                        "subscriber callback panicked; subscription kept"
                    );
                }
            }
        }

        report
    }

    /// Number of live registrations on `C`.
    #[must_use]
    pub fn subscriber_count<C: Channel>(&self) -> usize {
        C::topic(self).len()
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> &str {
    if let Some(message) = cause.downcast_ref::<&str>() {
        message
    } else if let Some(message) = cause.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
