use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Timestamp;

/// Kind of message row. Unknown kinds written by newer backends decode as `Other`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Plain text written by a participant.
    #[default]
    Text,
    /// Message carrying an attachment reference.
    Attachment,
    /// Platform-generated notice (thread created, participant added).
    System,
    /// Any type this build does not know about.
    #[serde(other)]
    Other,
}

/// A message row as delivered by the change stream.
///
/// The same `id` may be observed more than once after a reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Message identifier.
    pub id: Uuid,
    /// Thread the message belongs to.
    pub thread_id: Uuid,
    /// Author of the message.
    pub sender_id: Uuid,
    /// Message body. Change notifications omit it, so it is empty there.
    #[serde(default)]
    pub text: String,
    /// Insert time on the backend.
    pub created_at: Timestamp,
    /// Row kind.
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
}

impl MessageRecord {
    /// Whether `user_id` wrote this message.
    #[must_use]
    pub fn is_from(&self, user_id: Uuid) -> bool {
        self.sender_id == user_id
    }
}
