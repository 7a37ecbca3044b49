use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Timestamp;

/// A shared calendar entry (custody exchange, appointment, school event).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEventRecord {
    /// Event identifier.
    pub id: Uuid,
    /// Short title shown on the calendar.
    pub title: String,
    /// Start of the event.
    pub starts_at: Timestamp,
    /// End of the event; open-ended when absent.
    #[serde(default)]
    pub ends_at: Option<Timestamp>,
    /// Whether the event spans whole days.
    #[serde(default)]
    pub all_day: bool,
    /// Participant who created the event.
    pub created_by: Uuid,
    /// Last modification time.
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn calendar_event_defaults_optional_fields() {
        let event: CalendarEventRecord = serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "title": "Handover at school",
            "starts_at": "2025-05-02T15:00:00Z",
            "created_by": Uuid::new_v4()
        }))
        .unwrap();

        assert_eq!(event.ends_at, None);
        assert!(!event.all_day);
        assert_eq!(event.updated_at, None);
    }
}
