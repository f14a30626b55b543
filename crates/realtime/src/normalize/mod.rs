//! Raw change to domain event mapping.
//!
//! Normalization is pure and stateless: the same topic and payload always
//! produce the same result, nothing is retried and nothing is reordered.
//! Payloads that cannot be mapped are logged and dropped, as are message and
//! notification rows addressed to a different conversation or user than the
//! topic they arrived on.

use hearth_primitives::{Conversation, ConversationId, ListingStatus, ListingSummary, Message, MessageId, Notification, NotificationId, UserId};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::NormalizeError;
use crate::event::{DomainEvent, Envelope};
use crate::payload::{Operation, RawChange};
use crate::topic::{Table, Topic, TopicId};

/// Key columns of a deleted message row.
#[derive(Deserialize)]
struct MessageKey {
	id: MessageId,
	conversation_id: ConversationId,
}

#[derive(Deserialize)]
struct NotificationKey {
	id: NotificationId,
	user_id: UserId,
}

/// Previous status column of an updated listing, when the backend sends it.
#[derive(Deserialize)]
struct PreviousStatus {
	#[serde(default)]
	status: Option<ListingStatus>,
}

/// Maps [`RawChange`] payloads to [`DomainEvent`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventNormalizer;

impl EventNormalizer {
	/// Normalizes a payload received on `topic`, logging and dropping failures.
	pub fn normalize(topic: &Topic, change: &RawChange) -> Option<Envelope> {
		match Self::try_normalize(topic, change) {
			Ok(event) => Some(Envelope::new(topic.id.clone(), event, change.timestamp)),
			Err(error) => {
				warn!(topic = %topic.id, table = %change.table, operation = %change.operation, error = %error, "dropping change payload");
				None
			}
		}
	}

	/// Normalizes a payload, reporting why it was rejected.
	pub fn try_normalize(topic: &Topic, change: &RawChange) -> Result<DomainEvent, NormalizeError> {
		let table = Table::parse(&change.table).ok_or_else(|| NormalizeError::UnknownTable(change.table.clone()))?;
		if table != topic.table() {
			return Err(NormalizeError::TableMismatch {
				topic: topic.id.clone(),
				table: change.table.clone(),
			});
		}
		if !topic.filter.operation.admits(change.operation) {
			return Err(NormalizeError::OperationFiltered {
				topic: topic.id.clone(),
				table: change.table.clone(),
				operation: change.operation,
			});
		}

		let event = match table {
			Table::Messages => messages(change),
			Table::Conversations => conversations(change),
			Table::Notifications => notifications(change),
			Table::Properties => properties(change),
		}?;
		if let Some(row_topic) = row_topic(&event)
			&& row_topic != topic.id
		{
			return Err(NormalizeError::ScopeMismatch {
				topic: topic.id.clone(),
				row_topic,
			});
		}
		Ok(event)
	}
}

/// Topic a row is addressed to, for tables whose topics are per-row scoped.
fn row_topic(event: &DomainEvent) -> Option<TopicId> {
	match event {
		DomainEvent::MessageInserted { conversation_id, .. }
		| DomainEvent::MessageUpdated { conversation_id, .. }
		| DomainEvent::MessageDeleted { conversation_id, .. } => Some(TopicId::conversation(conversation_id)),
		DomainEvent::NotificationCreated { notification } | DomainEvent::NotificationUpdated { notification } => {
			Some(TopicId::notifications(&notification.user_id))
		}
		DomainEvent::NotificationDeleted { user_id, .. } => Some(TopicId::notifications(user_id)),
		_ => None,
	}
}

fn decode<T: DeserializeOwned>(table: Table, value: &Value) -> Result<T, NormalizeError> {
	T::deserialize(value).map_err(|source| NormalizeError::MalformedRow {
		table: table.as_str().to_owned(),
		source,
	})
}

/// Row carrying the key columns of a delete. Prefers the old snapshot.
fn deleted_row(change: &RawChange) -> &Value {
	match &change.old_row {
		Some(old) if !old.is_null() => old,
		_ => &change.row,
	}
}

fn unsupported(table: Table, operation: Operation) -> NormalizeError {
	NormalizeError::UnsupportedOperation {
		table: table.as_str().to_owned(),
		operation,
	}
}

fn messages(change: &RawChange) -> Result<DomainEvent, NormalizeError> {
	match change.operation {
		Operation::Insert => {
			let message: Message = decode(Table::Messages, &change.row)?;
			Ok(DomainEvent::MessageInserted {
				conversation_id: message.conversation_id.clone(),
				message,
			})
		}
		Operation::Update => {
			let message: Message = decode(Table::Messages, &change.row)?;
			Ok(DomainEvent::MessageUpdated {
				conversation_id: message.conversation_id.clone(),
				message,
			})
		}
		Operation::Delete => {
			let key: MessageKey = decode(Table::Messages, deleted_row(change))?;
			Ok(DomainEvent::MessageDeleted {
				conversation_id: key.conversation_id,
				message_id: key.id,
			})
		}
	}
}

fn conversations(change: &RawChange) -> Result<DomainEvent, NormalizeError> {
	match change.operation {
		Operation::Insert | Operation::Update => Ok(DomainEvent::ConversationChanged {
			conversation: decode::<Conversation>(Table::Conversations, &change.row)?,
		}),
		Operation::Delete => Err(unsupported(Table::Conversations, Operation::Delete)),
	}
}

fn notifications(change: &RawChange) -> Result<DomainEvent, NormalizeError> {
	match change.operation {
		Operation::Insert => Ok(DomainEvent::NotificationCreated {
			notification: decode::<Notification>(Table::Notifications, &change.row)?,
		}),
		Operation::Update => Ok(DomainEvent::NotificationUpdated {
			notification: decode::<Notification>(Table::Notifications, &change.row)?,
		}),
		Operation::Delete => {
			let key: NotificationKey = decode(Table::Notifications, deleted_row(change))?;
			Ok(DomainEvent::NotificationDeleted {
				user_id: key.user_id,
				notification_id: key.id,
			})
		}
	}
}

fn properties(change: &RawChange) -> Result<DomainEvent, NormalizeError> {
	match change.operation {
		Operation::Insert => {
			let listing: ListingSummary = decode(Table::Properties, &change.row)?;
			if listing.status.is_pending() {
				Ok(DomainEvent::ListingSubmitted { listing })
			} else {
				Ok(DomainEvent::ListingUpdated { listing })
			}
		}
		Operation::Update => {
			let listing: ListingSummary = decode(Table::Properties, &change.row)?;
			// Without a previous status the change is treated as a status change; applying it is idempotent.
			let previous = match &change.old_row {
				Some(old) if !old.is_null() => decode::<PreviousStatus>(Table::Properties, old)?.status,
				_ => None,
			};
			if previous == Some(listing.status) {
				return Ok(DomainEvent::ListingUpdated { listing });
			}
			if listing.status.is_pending() && previous.is_some() {
				// Resubmission after rejection re-enters the queue.
				return Ok(DomainEvent::ListingSubmitted { listing });
			}
			Ok(DomainEvent::ListingStatusChanged {
				property_id: listing.id.clone(),
				status: listing.status,
				previous,
				listing,
			})
		}
		Operation::Delete => Err(unsupported(Table::Properties, Operation::Delete)),
	}
}
