//! Identifiers and marketplace records shared by the realtime engine.
//!
//! Row types mirror the backend's table schemas closely enough to be decoded
//! straight from change-notification payloads with `serde_json::from_value`.
//! Identifiers accept both textual and integer encodings since the backend
//! mixes UUID and serial primary keys across tables.

mod ids;
mod listing;
mod message;
mod notification;

pub use ids::{ClientId, ConversationId, MessageId, NotificationId, PropertyId, UserId};
pub use listing::{ListingStatus, ListingSummary, ModerationToast, ToastAction};
pub use message::{Conversation, Message};
pub use notification::{Notification, NotificationKind};

/// Timestamp type used by every record.
pub type Timestamp = chrono::DateTime<chrono::Utc>;
