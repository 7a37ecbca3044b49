use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Timestamp;

/// Per-user, per-message read marker keyed by `(message_id, user_id)`.
///
/// A `None` read time means the receipt was created unread; a later upsert
/// with a read time marks the message read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReceiptRecord {
    /// Message the receipt refers to.
    pub message_id: Uuid,
    /// Reader.
    pub user_id: Uuid,
    /// When the message was read, if it has been.
    #[serde(default)]
    pub read_at: Option<Timestamp>,
}

impl ReadReceiptRecord {
    /// Whether the receipt marks the message read.
    #[must_use]
    pub const fn is_read(&self) -> bool {
        self.read_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn null_read_at_is_unread() {
        let receipt: ReadReceiptRecord = serde_json::from_value(json!({
            "message_id": Uuid::new_v4(),
            "user_id": Uuid::new_v4(),
            "read_at": null
        }))
        .unwrap();

        assert!(!receipt.is_read());
    }

    #[test]
    fn missing_read_at_is_unread() {
        let receipt: ReadReceiptRecord = serde_json::from_value(json!({
            "message_id": Uuid::new_v4(),
            "user_id": Uuid::new_v4()
        }))
        .unwrap();

        assert_eq!(receipt.read_at, None);
    }

    #[test]
    fn read_at_marks_read() {
        let receipt: ReadReceiptRecord = serde_json::from_value(json!({
            "message_id": Uuid::new_v4(),
            "user_id": Uuid::new_v4(),
            "read_at": "2025-05-01T12:00:00Z"
        }))
        .unwrap();

        assert!(receipt.is_read());
    }
}
