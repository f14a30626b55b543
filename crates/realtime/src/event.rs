//! Typed domain events.

use hearth_primitives::{
	Conversation, ConversationId, ListingStatus, ListingSummary, Message, MessageId, Notification, NotificationId, PropertyId, Timestamp,
	UserId,
};
use serde::Serialize;

use crate::topic::TopicId;

/// Closed set of changes the engine reacts to.
///
/// Produced by [`crate::normalize::EventNormalizer`], except for
/// [`DomainEvent::UnreadCountSynced`] which comes from the fallback poller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
	MessageInserted {
		conversation_id: ConversationId,
		message: Message,
	},
	/// Content edit or read receipt.
	MessageUpdated {
		conversation_id: ConversationId,
		message: Message,
	},
	MessageDeleted {
		conversation_id: ConversationId,
		message_id: MessageId,
	},
	ConversationChanged {
		conversation: Conversation,
	},
	NotificationCreated {
		notification: Notification,
	},
	/// Read flag or content change of an existing notification.
	NotificationUpdated {
		notification: Notification,
	},
	NotificationDeleted {
		user_id: UserId,
		notification_id: NotificationId,
	},
	/// A listing entered the `pending` state.
	ListingSubmitted {
		listing: ListingSummary,
	},
	ListingStatusChanged {
		property_id: PropertyId,
		status: ListingStatus,
		previous: Option<ListingStatus>,
		listing: ListingSummary,
	},
	/// Non-status change to a listing.
	ListingUpdated {
		listing: ListingSummary,
	},
	/// Authoritative unread count obtained by polling.
	UnreadCountSynced {
		user_id: UserId,
		count: u64,
	},
}

impl DomainEvent {
	/// Short name for logs.
	pub const fn name(&self) -> &'static str {
		match self {
			Self::MessageInserted { .. } => "message_inserted",
			Self::MessageUpdated { .. } => "message_updated",
			Self::MessageDeleted { .. } => "message_deleted",
			Self::ConversationChanged { .. } => "conversation_changed",
			Self::NotificationCreated { .. } => "notification_created",
			Self::NotificationUpdated { .. } => "notification_updated",
			Self::NotificationDeleted { .. } => "notification_deleted",
			Self::ListingSubmitted { .. } => "listing_submitted",
			Self::ListingStatusChanged { .. } => "listing_status_changed",
			Self::ListingUpdated { .. } => "listing_updated",
			Self::UnreadCountSynced { .. } => "unread_count_synced",
		}
	}
}

/// A domain event attributed to exactly one topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
	pub topic: TopicId,
	pub event: DomainEvent,
	pub emitted_at: Timestamp,
}

impl Envelope {
	pub fn new(topic: TopicId, event: DomainEvent, emitted_at: Timestamp) -> Self {
		Self { topic, event, emitted_at }
	}
}
