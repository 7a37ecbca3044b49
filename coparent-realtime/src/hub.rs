//! The composition root consumers talk to.
//!
//! A [`RealtimeHub`] owns the unread aggregate, the change source and the
//! callback registry. Changes are applied by a single event-loop task in
//! arrival order; each one is dispatched on its own channel and, when the
//! counts moved, followed by a fresh [`UnreadState`] on `unreadCounts`.
//! Every `unreadCounts` dispatch snapshots the aggregate under one lock, so
//! subscribers never see an older state after a newer one.

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};

use metrics::counter;
use shared::{
    config::RealtimeConfig,
    models::{
        CalendarEventRecord, ChangeEvent, MessageRecord, ReadReceiptRecord, UnreadState,
    },
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::{
    aggregator::UnreadAggregator,
    error::{HubError, HubResult},
    registry::{
        CalendarEventChannel, CallbackRegistry, Disposer, MessageChannel, NavigationChannel,
        ReadReceiptChannel, UnreadCountsChannel,
    },
    source::{ChangeEventSource, ChangeTransport, SourceEvent},
    store::{StoreError, UnreadCountStore},
};

const STATE_UNINITIALIZED: u8 = 0;
const STATE_RESYNCING: u8 = 1;
const STATE_LIVE: u8 = 2;
const STATE_STOPPED: u8 = 3;

/// Lifecycle position of a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    /// Constructed, not started.
    Uninitialized,
    /// Running the initial resync.
    Resyncing,
    /// Applying and dispatching changes.
    Live,
    /// Terminal.
    Stopped,
}

impl HubState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_UNINITIALIZED => Self::Uninitialized,
            STATE_RESYNCING => Self::Resyncing,
            STATE_LIVE => Self::Live,
            _ => Self::Stopped,
        }
    }
}

impl fmt::Display for HubState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Uninitialized => "uninitialized",
            Self::Resyncing => "resyncing",
            Self::Live => "live",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

struct HubInner {
    viewer_id: Uuid,
    state: AtomicU8,
    resynced_once: AtomicBool,
    resync_on_reconnect: bool,
    registry: CallbackRegistry,
    aggregator: Mutex<UnreadAggregator>,
    dispatch_lock: Mutex<()>,
    store: Arc<dyn UnreadCountStore>,
    source: ChangeEventSource,
    shutdown: CancellationToken,
}

/// Cloneable handle to one viewer's realtime hub.
#[derive(Clone)]
pub struct RealtimeHub {
    inner: Arc<HubInner>,
}

impl fmt::Debug for RealtimeHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeHub")
            .field("viewer_id", &self.inner.viewer_id)
            .field("state", &self.state())
            .field("registry", &self.inner.registry)
            .finish_non_exhaustive()
    }
}

impl RealtimeHub {
    /// Builds a hub for `viewer_id`. Nothing is fetched or subscribed until [`start`](Self::start).
    #[must_use]
    pub fn new(
        viewer_id: Uuid,
        config: &RealtimeConfig,
        store: Arc<dyn UnreadCountStore>,
        transport: Arc<dyn ChangeTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                viewer_id,
                state: AtomicU8::new(STATE_UNINITIALIZED),
                resynced_once: AtomicBool::new(false),
                resync_on_reconnect: config.resync_on_reconnect,
                registry: CallbackRegistry::new(),
                aggregator: Mutex::new(UnreadAggregator::new(viewer_id, config.dedup_window)),
                dispatch_lock: Mutex::new(()),
                store,
                source: ChangeEventSource::new(transport, viewer_id),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// User whose unread counts this hub maintains.
    #[must_use]
    pub fn viewer_id(&self) -> Uuid {
        self.inner.viewer_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> HubState {
        HubState::from_raw(self.inner.state.load(Ordering::SeqCst))
    }

    /// Opens the change source, runs the initial resync and goes live.
    ///
    /// Changes that arrive while the resync is in flight are buffered and
    /// applied afterwards. A failed initial resync is logged and the hub goes
    /// live with empty counts.
    ///
    /// # Errors
    /// [`HubError::InvalidState`] unless the hub is uninitialized, or
    /// [`HubError::Transport`] when the source cannot subscribe; the hub is
    /// stopped in that case.
    #[instrument(name = "hub.start", skip(self), fields(viewer_id = %self.inner.viewer_id), err)]
    pub async fn start(&self) -> HubResult<()> {
        let inner = &self.inner;
        if let Err(current) = inner.state.compare_exchange(
            STATE_UNINITIALIZED,
            STATE_RESYNCING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            return Err(HubError::InvalidState {
                operation: "start",
                state: HubState::from_raw(current),
            });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Err(err) = inner.source.start(events_tx).await {
            inner.state.store(STATE_STOPPED, Ordering::SeqCst);
            inner.shutdown.cancel();
            return Err(err.into());
        }

        if let Err(err) = inner.resync().await {
            warn!(error = %err, "initial resync failed; starting with empty unread state");
        }
        inner.resynced_once.store(true, Ordering::SeqCst);

        if inner
            .state
            .compare_exchange(
                STATE_RESYNCING,
                STATE_LIVE,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            debug!("hub stopped while starting");
            return Ok(());
        }

        tokio::spawn(run_event_loop(
            Arc::downgrade(inner),
            events_rx,
            inner.shutdown.clone(),
        ));
        info!("realtime hub live");
        Ok(())
    }

    /// Stops the source and the event loop. Terminal; repeated calls are no-ops.
    pub fn stop(&self) {
        let previous = self.inner.state.swap(STATE_STOPPED, Ordering::SeqCst);
        if previous == STATE_STOPPED {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.source.stop();
        info!(viewer_id = %self.inner.viewer_id, "realtime hub stopped");
    }

    /// Refetches the unread counts, replaces the local state and always
    /// notifies `unreadCounts` subscribers.
    ///
    /// # Errors
    /// [`HubError::NotReady`] before the initial resync has run, or
    /// [`HubError::Resync`] when the fetch fails; the previous state is kept.
    pub async fn request_full_resync(&self) -> HubResult<UnreadState> {
        if !self.inner.resynced_once.load(Ordering::SeqCst) {
            return Err(HubError::NotReady);
        }
        Ok(self.inner.resync().await?)
    }

    /// Copy of the current unread state.
    #[must_use]
    pub fn unread_state(&self) -> UnreadState {
        self.inner.aggregator().snapshot()
    }

    /// Whether the aggregate healed an inconsistency since the last resync.
    #[must_use]
    pub fn resync_advised(&self) -> bool {
        self.inner.aggregator().resync_advised()
    }

    /// Subscribes to inserted messages.
    pub fn register_message_callback<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&MessageRecord) + Send + Sync + 'static,
    {
        self.inner.registry.register::<MessageChannel, _>(callback)
    }

    /// Subscribes to unread count snapshots.
    pub fn register_unread_counts_callback<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&UnreadState) + Send + Sync + 'static,
    {
        self.inner.registry.register::<UnreadCountsChannel, _>(callback)
    }

    /// Subscribes to read receipt changes.
    pub fn register_read_receipt_callback<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&ReadReceiptRecord) + Send + Sync + 'static,
    {
        self.inner.registry.register::<ReadReceiptChannel, _>(callback)
    }

    /// Subscribes to calendar event changes.
    pub fn register_calendar_event_callback<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&CalendarEventRecord) + Send + Sync + 'static,
    {
        self.inner.registry.register::<CalendarEventChannel, _>(callback)
    }

    /// Subscribes to navigation targets pushed to the viewer.
    pub fn register_navigation_callback<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&String) + Send + Sync + 'static,
    {
        self.inner.registry.register::<NavigationChannel, _>(callback)
    }
}

impl HubInner {
    fn aggregator(&self) -> MutexGuard<'_, UnreadAggregator> {
        self.aggregator.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch_guard(&self) -> MutexGuard<'_, ()> {
        self.dispatch_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Publishes the current aggregate. The snapshot is taken after the
    /// dispatch lock is held so a concurrent resync cannot be overwritten.
    fn dispatch_unread_counts(&self) {
        let _dispatch = self.dispatch_guard();
        let snapshot = self.aggregator().snapshot();
        self.registry.dispatch::<UnreadCountsChannel>(&snapshot);
    }

    fn source_closed(&self) {
        if self.state.swap(STATE_STOPPED, Ordering::SeqCst) == STATE_STOPPED {
            return;
        }
        counter!("coparent_realtime_source_closed_total").increment(1);
        error!(
            viewer_id = %self.viewer_id,
            "change source closed unexpectedly; hub stopped"
        );
        self.shutdown.cancel();
        self.source.stop();
    }

    #[instrument(name = "hub.resync", skip(self), fields(viewer_id = %self.viewer_id), err)]
    async fn resync(&self) -> Result<UnreadState, StoreError> {
        counter!("coparent_realtime_resync_total").increment(1);

        let fetched = match self.store.fetch_unread_snapshot(self.viewer_id).await {
            Ok(fetched) => fetched,
            Err(err) => {
                counter!("coparent_realtime_resync_failures_total").increment(1);
                return Err(err);
            }
        };

        let snapshot = {
            let _dispatch = self.dispatch_guard();
            let snapshot = {
                let mut aggregator = self.aggregator();
                aggregator.apply_snapshot(&fetched);
                aggregator.snapshot()
            };
            self.registry.dispatch::<UnreadCountsChannel>(&snapshot);
            snapshot
        };
        info!(
            total = snapshot.total,
            threads = snapshot.per_thread.len(),
            "unread state resynced"
        );
        Ok(snapshot)
    }

    async fn handle(&self, event: SourceEvent) {
        match event {
            SourceEvent::Change(change) => self.apply_change(&change),
            SourceEvent::Reconnected(table) if self.resync_on_reconnect => {
                info!(table = %table, "change stream reconnected; resyncing");
                if let Err(err) = self.resync().await {
                    warn!(table = %table, error = %err, "resync after reconnect failed");
                }
            }
            SourceEvent::Reconnected(table) => {
                warn!(table = %table, "change stream reconnected; changes may have been missed");
            }
            SourceEvent::MembershipChanged { thread_id, user_id } => {
                let affects_viewer =
                    user_id == self.viewer_id || self.aggregator().covers_thread(&thread_id);
                if !affects_viewer {
                    trace!(thread_id = %thread_id, "membership change for another thread");
                    return;
                }
                info!(
                    thread_id = %thread_id,
                    user_id = %user_id,
                    "thread membership changed; resyncing"
                );
                if let Err(err) = self.resync().await {
                    warn!(
                        thread_id = %thread_id,
                        error = %err,
                        "resync after membership change failed"
                    );
                }
            }
        }
    }

    fn apply_change(&self, change: &ChangeEvent) {
        counter!(
            "coparent_realtime_events_total",
            "channel" => change.channel().as_str()
        )
        .increment(1);

        let changed = {
            let mut aggregator = self.aggregator();
            if !aggregator.admits(change) {
                trace!(channel = %change.channel(), "change outside the viewer's scope dropped");
                return;
            }
            match change {
                ChangeEvent::Message { message } => aggregator.apply_message_inserted(message),
                ChangeEvent::ReadReceipt { receipt } => {
                    aggregator.apply_read_receipt_updated(receipt)
                }
                ChangeEvent::CalendarEvent { .. } | ChangeEvent::Navigation { .. } => false,
            }
        };

        let report = match change {
            ChangeEvent::Message { message } => self.registry.dispatch::<MessageChannel>(message),
            ChangeEvent::ReadReceipt { receipt } => {
                self.registry.dispatch::<ReadReceiptChannel>(receipt)
            }
            ChangeEvent::CalendarEvent { event } => {
                self.registry.dispatch::<CalendarEventChannel>(event)
            }
            ChangeEvent::Navigation { path } => self.registry.dispatch::<NavigationChannel>(path),
        };
        if report.failed > 0 {
            debug!(channel = %change.channel(), failed = report.failed, "dispatch had failures");
        }

        if changed {
            self.dispatch_unread_counts();
        }
    }
}

impl Drop for HubInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.source.stop();
    }
}

async fn run_event_loop(
    hub: Weak<HubInner>,
    mut events: mpsc::UnboundedReceiver<SourceEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else {
            if let Some(inner) = hub.upgrade() {
                inner.source_closed();
            }
            break;
        };
        let Some(inner) = hub.upgrade() else {
            break;
        };
        inner.handle(event).await;
    }

    debug!("hub event loop finished");
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, HashSet},
        time::Duration,
    };

    use serde_json::{Value, json};
    use tokio::time::timeout;

    use super::*;
    use crate::source::{ChangeTable, ChannelTransport};
    use crate::store::{UnreadMessageRef, ViewerScope, test_implementations::ScriptedStore};

    const WAIT: Duration = Duration::from_secs(2);

    fn config() -> RealtimeConfig {
        RealtimeConfig {
            dedup_window: 64,
            ..RealtimeConfig::default()
        }
    }

    fn hub_with(store: Arc<ScriptedStore>) -> (RealtimeHub, Arc<ChannelTransport>, Uuid) {
        let viewer = Uuid::new_v4();
        let transport = ChannelTransport::new();
        let hub = RealtimeHub::new(viewer, &config(), store, transport.clone());
        (hub, transport, viewer)
    }

    fn message_insert(id: Uuid, thread: Uuid, sender: Uuid) -> Value {
        json!({
            "op": "INSERT",
            "record": {
                "id": id,
                "thread_id": thread,
                "sender_id": sender,
                "text": "pickup moved to 5pm",
                "created_at": "2025-05-01T12:00:00Z",
                "type": "text"
            }
        })
    }

    fn receipt_update(message: Uuid, user: Uuid) -> Value {
        json!({
            "op": "UPDATE",
            "record": {
                "message_id": message,
                "user_id": user,
                "read_at": "2025-05-01T12:10:00Z"
            }
        })
    }

    fn totals(hub: &RealtimeHub) -> mpsc::UnboundedReceiver<u64> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register_unread_counts_callback(move |state| {
            let _ = tx.send(state.total);
        });
        rx
    }

    async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn start_resyncs_then_goes_live() {
        let thread = Uuid::new_v4();
        let store = Arc::new(ScriptedStore::returning(HashMap::from([(thread, 2)])));
        let (hub, _transport, _) = hub_with(store);
        let mut totals = totals(&hub);

        assert_eq!(hub.state(), HubState::Uninitialized);
        hub.start().await.unwrap();

        assert_eq!(hub.state(), HubState::Live);
        assert_eq!(totals.try_recv().unwrap(), 2);
        assert_eq!(hub.unread_state().unread_in(&thread), 2);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let (hub, _transport, _) = hub_with(Arc::new(ScriptedStore::default()));
        hub.start().await.unwrap();

        let err = hub.start().await.unwrap_err();
        assert!(matches!(
            err,
            HubError::InvalidState {
                operation: "start",
                state: HubState::Live
            }
        ));
    }

    #[tokio::test]
    async fn resync_before_start_is_not_ready() {
        let (hub, _transport, _) = hub_with(Arc::new(ScriptedStore::default()));
        assert!(matches!(
            hub.request_full_resync().await,
            Err(HubError::NotReady)
        ));
    }

    #[tokio::test]
    async fn failed_initial_resync_still_goes_live() {
        let store = Arc::new(ScriptedStore::failing("connection refused"));
        let (hub, _transport, _) = hub_with(store.clone());

        hub.start().await.unwrap();

        assert_eq!(hub.state(), HubState::Live);
        assert_eq!(hub.unread_state(), UnreadState::default());
        assert!(matches!(
            hub.request_full_resync().await,
            Err(HubError::Resync(_))
        ));
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn failed_resync_keeps_previous_state() {
        let thread = Uuid::new_v4();
        let store = Arc::new(ScriptedStore::returning(HashMap::from([(thread, 3)])));
        store.push_err("timeout");
        let (hub, _transport, _) = hub_with(store);
        hub.start().await.unwrap();

        assert!(hub.request_full_resync().await.is_err());
        assert_eq!(hub.unread_state().total, 3);
    }

    #[tokio::test]
    async fn explicit_resync_notifies_even_without_change() {
        let thread = Uuid::new_v4();
        let store = Arc::new(ScriptedStore::returning(HashMap::from([(thread, 1)])));
        let (hub, _transport, _) = hub_with(store);
        let mut totals = totals(&hub);
        hub.start().await.unwrap();
        assert_eq!(totals.try_recv().unwrap(), 1);

        let state = hub.request_full_resync().await.unwrap();

        assert_eq!(state.total, 1);
        assert_eq!(totals.try_recv().unwrap(), 1);
    }

    #[tokio::test]
    async fn message_dispatch_precedes_unread_counts() {
        let (hub, transport, _) = hub_with(Arc::new(ScriptedStore::default()));
        let (tx, mut seen) = mpsc::unbounded_channel();
        let message_tx = tx.clone();
        hub.register_message_callback(move |_| {
            let _ = message_tx.send("message");
        });
        hub.register_unread_counts_callback(move |_| {
            let _ = tx.send("unreadCounts");
        });
        hub.start().await.unwrap();
        assert_eq!(next(&mut seen).await, "unreadCounts");

        transport.emit(
            ChangeTable::Messages,
            message_insert(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()),
        );

        assert_eq!(next(&mut seen).await, "message");
        assert_eq!(next(&mut seen).await, "unreadCounts");
    }

    #[tokio::test]
    async fn own_messages_do_not_touch_counts() {
        let (hub, transport, viewer) = hub_with(Arc::new(ScriptedStore::default()));
        let mut totals = totals(&hub);
        let (tx, mut messages) = mpsc::unbounded_channel();
        hub.register_message_callback(move |message| {
            let _ = tx.send(message.id);
        });
        hub.start().await.unwrap();
        assert_eq!(next(&mut totals).await, 0);

        let mine = Uuid::new_v4();
        transport.emit(
            ChangeTable::Messages,
            message_insert(mine, Uuid::new_v4(), viewer),
        );
        assert_eq!(next(&mut messages).await, mine);

        transport.emit(
            ChangeTable::Messages,
            message_insert(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()),
        );
        assert_eq!(next(&mut totals).await, 1);
    }

    #[tokio::test]
    async fn read_receipt_decrements_and_is_forwarded() {
        let (hub, transport, viewer) = hub_with(Arc::new(ScriptedStore::default()));
        let mut totals = totals(&hub);
        let (tx, mut receipts) = mpsc::unbounded_channel();
        hub.register_read_receipt_callback(move |receipt| {
            let _ = tx.send(receipt.message_id);
        });
        hub.start().await.unwrap();
        assert_eq!(next(&mut totals).await, 0);

        let message = Uuid::new_v4();
        transport.emit(
            ChangeTable::Messages,
            message_insert(message, Uuid::new_v4(), Uuid::new_v4()),
        );
        assert_eq!(next(&mut totals).await, 1);

        transport.emit(ChangeTable::ReadReceipts, receipt_update(message, viewer));
        assert_eq!(next(&mut receipts).await, message);
        assert_eq!(next(&mut totals).await, 0);
        assert!(!hub.resync_advised());
    }

    #[tokio::test]
    async fn calendar_and_navigation_are_forwarded() {
        let (hub, transport, viewer) = hub_with(Arc::new(ScriptedStore::default()));
        let (calendar_tx, mut calendar) = mpsc::unbounded_channel();
        hub.register_calendar_event_callback(move |event| {
            let _ = calendar_tx.send(event.title.clone());
        });
        let (nav_tx, mut navigation) = mpsc::unbounded_channel();
        hub.register_navigation_callback(move |path| {
            let _ = nav_tx.send(path.clone());
        });
        hub.start().await.unwrap();

        transport.emit(
            ChangeTable::CalendarEvents,
            json!({
                "op": "INSERT",
                "record": {
                    "id": Uuid::new_v4(),
                    "title": "Soccer practice",
                    "starts_at": "2025-05-03T09:00:00Z",
                    "created_by": Uuid::new_v4()
                }
            }),
        );
        transport.emit(
            ChangeTable::Navigation,
            json!({"op": "INSERT", "record": {"user_id": viewer, "path": "/threads/42"}}),
        );

        assert_eq!(next(&mut calendar).await, "Soccer practice");
        assert_eq!(next(&mut navigation).await, "/threads/42");
        assert_eq!(hub.unread_state(), UnreadState::default());
    }

    #[tokio::test]
    async fn reconnect_triggers_resync() {
        let thread = Uuid::new_v4();
        let store = Arc::new(ScriptedStore::returning(HashMap::from([(thread, 1)])));
        store.push_ok(HashMap::from([(thread, 4)]));
        let (hub, transport, _) = hub_with(store.clone());
        let mut totals = totals(&hub);
        hub.start().await.unwrap();
        assert_eq!(next(&mut totals).await, 1);

        assert!(transport.reconnect(ChangeTable::Messages));

        assert_eq!(next(&mut totals).await, 4);
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test]
    async fn reconnect_resync_can_be_disabled() {
        let store = Arc::new(ScriptedStore::default());
        let transport = ChannelTransport::new();
        let config = RealtimeConfig {
            resync_on_reconnect: false,
            ..config()
        };
        let hub = RealtimeHub::new(Uuid::new_v4(), &config, store.clone(), transport.clone());
        let (tx, mut messages) = mpsc::unbounded_channel();
        hub.register_message_callback(move |message| {
            let _ = tx.send(message.id);
        });
        hub.start().await.unwrap();

        let id = Uuid::new_v4();
        transport.reconnect(ChangeTable::Messages);
        transport.emit(
            ChangeTable::Messages,
            message_insert(id, Uuid::new_v4(), Uuid::new_v4()),
        );

        assert_eq!(next(&mut messages).await, id);
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn stop_is_terminal_and_idempotent() {
        let (hub, _transport, _) = hub_with(Arc::new(ScriptedStore::default()));
        hub.start().await.unwrap();

        hub.stop();
        hub.stop();

        assert_eq!(hub.state(), HubState::Stopped);
        assert!(matches!(
            hub.start().await,
            Err(HubError::InvalidState {
                state: HubState::Stopped,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn registration_before_start_receives_later_events() {
        let (hub, transport, _) = hub_with(Arc::new(ScriptedStore::default()));
        let (tx, mut messages) = mpsc::unbounded_channel();
        let disposer = hub.register_message_callback(move |message| {
            let _ = tx.send(message.id);
        });

        assert_eq!(hub.state(), HubState::Uninitialized);
        hub.start().await.unwrap();

        let id = Uuid::new_v4();
        transport.emit(
            ChangeTable::Messages,
            message_insert(id, Uuid::new_v4(), Uuid::new_v4()),
        );
        assert_eq!(next(&mut messages).await, id);
        assert!(!disposer.is_disposed());
    }

    #[tokio::test]
    async fn indexed_messages_are_not_double_counted() {
        let thread = Uuid::new_v4();
        let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
        let store = Arc::new(ScriptedStore::returning(HashMap::from([(thread, 2)])));
        store.set_index(
            [first, second]
                .into_iter()
                .map(|message_id| UnreadMessageRef {
                    message_id,
                    thread_id: thread,
                })
                .collect(),
        );
        let (hub, transport, viewer) = hub_with(store);
        let mut totals = totals(&hub);
        let (tx, mut messages) = mpsc::unbounded_channel();
        hub.register_message_callback(move |message| {
            let _ = tx.send(message.id);
        });
        hub.start().await.unwrap();
        assert_eq!(next(&mut totals).await, 2);

        transport.emit(
            ChangeTable::Messages,
            message_insert(first, thread, Uuid::new_v4()),
        );
        assert_eq!(next(&mut messages).await, first);
        assert_eq!(hub.unread_state().unread_in(&thread), 2);

        transport.emit(ChangeTable::ReadReceipts, receipt_update(first, viewer));
        assert_eq!(next(&mut totals).await, 1);
        assert_eq!(hub.unread_state().unread_in(&thread), 1);
    }

    #[tokio::test]
    async fn changes_outside_viewer_scope_are_dropped() {
        let (mine, foreign) = (Uuid::new_v4(), Uuid::new_v4());
        let partner = Uuid::new_v4();
        let store = Arc::new(ScriptedStore::returning(HashMap::from([(mine, 1)])));
        store.set_scope(ViewerScope {
            threads: HashSet::from([mine]),
            contacts: HashSet::from([partner]),
        });
        let (hub, transport, _) = hub_with(store);
        let mut totals = totals(&hub);
        let (tx, mut messages) = mpsc::unbounded_channel();
        hub.register_message_callback(move |message| {
            let _ = tx.send(message.id);
        });
        hub.start().await.unwrap();
        assert_eq!(next(&mut totals).await, 1);

        let stranger_message = Uuid::new_v4();
        let partner_message = Uuid::new_v4();
        transport.emit(
            ChangeTable::Messages,
            message_insert(stranger_message, foreign, Uuid::new_v4()),
        );
        transport.emit(
            ChangeTable::Messages,
            message_insert(partner_message, mine, partner),
        );

        assert_eq!(next(&mut messages).await, partner_message);
        assert_eq!(next(&mut totals).await, 2);
        let state = hub.unread_state();
        assert_eq!(state.unread_in(&foreign), 0);
        assert_eq!(state.unread_in(&mine), 2);
    }

    #[tokio::test]
    async fn joining_a_thread_triggers_resync() {
        let (known, joined) = (Uuid::new_v4(), Uuid::new_v4());
        let store = Arc::new(ScriptedStore::returning(HashMap::from([(known, 1)])));
        store.push_ok(HashMap::from([(known, 1), (joined, 3)]));
        store.set_scope(ViewerScope {
            threads: HashSet::from([known]),
            contacts: HashSet::new(),
        });
        let (hub, transport, viewer) = hub_with(store.clone());
        let mut totals = totals(&hub);
        hub.start().await.unwrap();
        assert_eq!(next(&mut totals).await, 1);

        transport.emit(
            ChangeTable::ThreadParticipants,
            json!({
                "op": "INSERT",
                "record": {"thread_id": Uuid::new_v4(), "user_id": Uuid::new_v4()}
            }),
        );
        transport.emit(
            ChangeTable::ThreadParticipants,
            json!({"op": "INSERT", "record": {"thread_id": joined, "user_id": viewer}}),
        );

        assert_eq!(next(&mut totals).await, 4);
        assert_eq!(store.calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn resync_during_slow_dispatch_is_not_overwritten() {
        let thread = Uuid::new_v4();
        let store = Arc::new(ScriptedStore::returning(HashMap::new()));
        store.push_ok(HashMap::from([(thread, 5)]));
        let (hub, transport, viewer) = hub_with(store);

        let published = Arc::new(Mutex::new(Vec::new()));
        let sink = published.clone();
        hub.register_unread_counts_callback(move |state| {
            sink.lock().unwrap().push(state.total);
        });
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let slowed = AtomicBool::new(false);
        hub.register_message_callback(move |_| {
            if !slowed.swap(true, Ordering::SeqCst) {
                let _ = started_tx.send(());
                std::thread::sleep(Duration::from_millis(400));
            }
        });
        let (nav_tx, mut navigation) = mpsc::unbounded_channel();
        hub.register_navigation_callback(move |path| {
            let _ = nav_tx.send(path.clone());
        });
        hub.start().await.unwrap();

        transport.emit(
            ChangeTable::Messages,
            message_insert(Uuid::new_v4(), thread, Uuid::new_v4()),
        );
        next(&mut started).await;
        assert_eq!(hub.request_full_resync().await.unwrap().total, 5);

        transport.emit(
            ChangeTable::Navigation,
            json!({"op": "INSERT", "record": {"user_id": viewer, "path": "/threads"}}),
        );
        assert_eq!(next(&mut navigation).await, "/threads");

        assert_eq!(published.lock().unwrap().last(), Some(&5));
        assert_eq!(hub.unread_state().total, 5);
    }

    #[tokio::test]
    async fn closed_source_stops_the_hub() {
        let (hub, transport, _) = hub_with(Arc::new(ScriptedStore::default()));
        hub.start().await.unwrap();

        transport.close_all();

        timeout(WAIT, async {
            while hub.state() != HubState::Stopped {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!transport.is_subscribed(ChangeTable::Messages));
    }
}
