use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CalendarEventRecord, MessageRecord, ReadReceiptRecord};

/// Named category of event that consumers subscribe to independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelKind {
    /// Inserted messages.
    Message,
    /// Recomputed unread aggregate.
    UnreadCounts,
    /// Inserted or updated read receipts.
    ReadReceipt,
    /// Inserted or updated calendar events.
    CalendarEvent,
    /// Server-pushed navigation targets.
    Navigation,
}

impl ChannelKind {
    /// Every channel, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Message,
        Self::UnreadCounts,
        Self::ReadReceipt,
        Self::CalendarEvent,
        Self::Navigation,
    ];

    /// Stable name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::UnreadCounts => "unreadCounts",
            Self::ReadReceipt => "readReceipt",
            Self::CalendarEvent => "calendarEvent",
            Self::Navigation => "navigation",
        }
    }
}

impl std::fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row written to the navigation table to redirect one user, e.g. after
/// another participant added them to a new thread.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationPush {
    /// User the push is addressed to.
    pub user_id: Uuid,
    /// Client route to open.
    pub path: String,
}

/// Normalized change observed on the backend stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ChangeEvent {
    /// A message was inserted.
    Message {
        /// The inserted row.
        message: MessageRecord,
    },
    /// A read receipt was inserted or updated.
    ReadReceipt {
        /// The upserted row.
        receipt: ReadReceiptRecord,
    },
    /// A calendar event was inserted or updated.
    CalendarEvent {
        /// The upserted row.
        event: CalendarEventRecord,
    },
    /// The viewing user should be redirected.
    Navigation {
        /// Client route to open.
        path: String,
    },
}

impl ChangeEvent {
    /// Channel the event is dispatched on.
    #[must_use]
    pub const fn channel(&self) -> ChannelKind {
        match self {
            Self::Message { .. } => ChannelKind::Message,
            Self::ReadReceipt { .. } => ChannelKind::ReadReceipt,
            Self::CalendarEvent { .. } => ChannelKind::CalendarEvent,
            Self::Navigation { .. } => ChannelKind::Navigation,
        }
    }
}
