//! Records observed on the backend change stream and the derived unread state.

pub mod calendar;
pub mod change_event;
pub mod message;
pub mod read_receipt;
pub mod timestamp;
pub mod unread;

pub use calendar::CalendarEventRecord;
pub use change_event::{ChangeEvent, ChannelKind, NavigationPush};
pub use message::{MessageRecord, MessageType};
pub use read_receipt::ReadReceiptRecord;
pub use timestamp::Timestamp;
pub use unread::{UnreadState, UnreadThreadSummary};
