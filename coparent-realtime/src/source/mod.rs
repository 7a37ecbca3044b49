//! Backend change subscription and payload normalization.
//!
//! A [`ChangeTransport`] delivers raw JSON envelopes per table with
//! at-least-once semantics and no ordering across tables.
//! [`ChangeEventSource`] opens one subscription per table and turns the
//! envelopes into [`ChangeEvent`]s. Redeliveries are forwarded untouched;
//! deduplication belongs to the consumers of events.

pub mod channel;
pub mod pg_notify;

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use shared::models::{
    CalendarEventRecord, ChangeEvent, MessageRecord, NavigationPush, ReadReceiptRecord,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

pub use channel::ChannelTransport;
pub use pg_notify::PgNotifyTransport;

/// Backend tables observed by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeTable {
    /// `messages`
    Messages,
    /// `read_receipts`
    ReadReceipts,
    /// `calendar_events`
    CalendarEvents,
    /// `navigation_pushes`
    Navigation,
    /// `thread_participants`
    ThreadParticipants,
}

impl ChangeTable {
    /// Every observed table.
    pub const ALL: [Self; 5] = [
        Self::Messages,
        Self::ReadReceipts,
        Self::CalendarEvents,
        Self::Navigation,
        Self::ThreadParticipants,
    ];

    /// Table name, also used as the notification channel name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Messages => "messages",
            Self::ReadReceipts => "read_receipts",
            Self::CalendarEvents => "calendar_events",
            Self::Navigation => "navigation_pushes",
            Self::ThreadParticipants => "thread_participants",
        }
    }
}

impl fmt::Display for ChangeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row operation reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    /// Row inserted.
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

/// Envelope carried by every notification: `{"op": "INSERT", "record": {...}}`.
#[derive(Debug, Clone, Deserialize)]
struct ChangeEnvelope {
    op: ChangeOp,
    record: Value,
}

/// Undecoded change as received from the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct RawChange {
    /// Table the change belongs to.
    pub table: ChangeTable,
    /// JSON envelope.
    pub payload: Value,
}

/// What a transport pushes into a table's sink.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    /// A row change.
    Change(RawChange),
    /// The subscription dropped and has been re-established; changes in
    /// between may have been missed.
    Reconnected,
}

/// What the source forwards to the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A normalized change.
    Change(ChangeEvent),
    /// A table subscription came back after a drop.
    Reconnected(ChangeTable),
    /// A participant joined or left a thread.
    MembershipChanged {
        /// Affected thread.
        thread_id: Uuid,
        /// Participant added or removed.
        user_id: Uuid,
    },
}

#[derive(Debug, Deserialize)]
struct ParticipantRow {
    thread_id: Uuid,
    user_id: Uuid,
}

/// Errors from the realtime transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The source was already started once.
    #[error("change source already started")]
    AlreadyStarted,
    /// A table subscription could not be established.
    #[error("failed to subscribe to {table}: {reason}")]
    Subscribe {
        /// Table that failed.
        table: ChangeTable,
        /// Transport message.
        reason: String,
    },
}

/// Backend realtime primitive: one subscription per table.
#[async_trait]
pub trait ChangeTransport: Send + Sync {
    /// Starts delivering `table`'s changes into `sink` until `shutdown` is cancelled.
    ///
    /// Transient connection loss is handled inside the transport and
    /// reported through [`TransportSignal::Reconnected`].
    ///
    /// # Errors
    /// Returns an error when the initial subscription cannot be established.
    async fn subscribe(
        &self,
        table: ChangeTable,
        sink: mpsc::UnboundedSender<TransportSignal>,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError>;
}

/// Turns an envelope into a [`ChangeEvent`].
///
/// Returns `Ok(None)` for changes the hub does not surface: deletes, message
/// edits and navigation pushes addressed to someone else.
///
/// # Errors
/// Returns the decoding error for malformed payloads.
pub fn decode_change(
    viewer_id: Uuid,
    table: ChangeTable,
    payload: Value,
) -> Result<Option<ChangeEvent>, serde_json::Error> {
    let ChangeEnvelope { op, record } = serde_json::from_value(payload)?;

    let event = match (table, op) {
        (_, ChangeOp::Delete)
        | (ChangeTable::Messages | ChangeTable::Navigation, ChangeOp::Update)
        | (ChangeTable::ThreadParticipants, _) => None,
        (ChangeTable::Messages, ChangeOp::Insert) => Some(ChangeEvent::Message {
            message: serde_json::from_value::<MessageRecord>(record)?,
        }),
        (ChangeTable::ReadReceipts, _) => Some(ChangeEvent::ReadReceipt {
            receipt: serde_json::from_value::<ReadReceiptRecord>(record)?,
        }),
        (ChangeTable::CalendarEvents, _) => Some(ChangeEvent::CalendarEvent {
            event: serde_json::from_value::<CalendarEventRecord>(record)?,
        }),
        (ChangeTable::Navigation, ChangeOp::Insert) => {
            let push = serde_json::from_value::<NavigationPush>(record)?;
            (push.user_id == viewer_id).then_some(ChangeEvent::Navigation { path: push.path })
        }
    };

    Ok(event)
}

/// Turns a `thread_participants` envelope into a membership change.
///
/// Inserts and deletes both change what the viewer may see.
///
/// # Errors
/// Returns the decoding error for malformed payloads.
pub fn decode_membership(payload: Value) -> Result<Option<SourceEvent>, serde_json::Error> {
    let ChangeEnvelope { op, record } = serde_json::from_value(payload)?;
    if op == ChangeOp::Update {
        return Ok(None);
    }

    let row = serde_json::from_value::<ParticipantRow>(record)?;
    Ok(Some(SourceEvent::MembershipChanged {
        thread_id: row.thread_id,
        user_id: row.user_id,
    }))
}

/// Opens the per-table subscriptions and normalizes what they deliver.
pub struct ChangeEventSource {
    transport: Arc<dyn ChangeTransport>,
    viewer_id: Uuid,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl fmt::Debug for ChangeEventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeEventSource")
            .field("viewer_id", &self.viewer_id)
            .field("started", &self.started.load(Ordering::SeqCst))
            .field("stopped", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl ChangeEventSource {
    /// Creates a source for `viewer_id` over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn ChangeTransport>, viewer_id: Uuid) -> Self {
        Self {
            transport,
            viewer_id,
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Subscribes to every table and forwards normalized events into `sink`.
    ///
    /// # Errors
    /// Returns [`TransportError::AlreadyStarted`] on a second call, or the
    /// transport's error when a table cannot be subscribed; in that case the
    /// subscriptions opened so far are torn down.
    pub async fn start(
        &self,
        sink: mpsc::UnboundedSender<SourceEvent>,
    ) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }

        for table in ChangeTable::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            if let Err(err) = self
                .transport
                .subscribe(table, tx, self.shutdown.child_token())
                .await
            {
                self.shutdown.cancel();
                return Err(err);
            }

            tokio::spawn(normalize(
                table,
                self.viewer_id,
                rx,
                sink.clone(),
                self.shutdown.clone(),
            ));
            debug!(table = %table, "table subscription opened");
        }

        info!(viewer_id = %self.viewer_id, "change source started");
        Ok(())
    }

    /// Tears down every subscription. Repeated calls are no-ops.
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            info!(viewer_id = %self.viewer_id, "change source stopped");
        }
    }
}

async fn normalize(
    table: ChangeTable,
    viewer_id: Uuid,
    mut signals: mpsc::UnboundedReceiver<TransportSignal>,
    sink: mpsc::UnboundedSender<SourceEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let signal = tokio::select! {
            () = shutdown.cancelled() => break,
            signal = signals.recv() => signal,
        };

        let event = match signal {
            None => break,
            Some(TransportSignal::Reconnected) => SourceEvent::Reconnected(table),
            Some(TransportSignal::Change(raw)) => {
                let decoded = if raw.table == ChangeTable::ThreadParticipants {
                    decode_membership(raw.payload)
                } else {
                    decode_change(viewer_id, raw.table, raw.payload)
                        .map(|event| event.map(SourceEvent::Change))
                };
                match decoded {
                    Ok(Some(event)) => event,
                    Ok(None) => {
                        trace!(table = %table, "change not surfaced");
                        continue;
                    }
                    Err(err) => {
                        warn!(table = %table, error = %err, "dropping malformed change payload");
                        continue;
                    }
                }
            }
        };

        if sink.send(event).is_err() {
            break;
        }
    }

    debug!(table = %table, "table normalizer finished");
}
