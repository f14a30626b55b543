use serde::{Deserialize, Serialize};

use crate::{ClientId, ConversationId, MessageId, PropertyId, Timestamp, UserId};

/// One chat message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub conversation_id: ConversationId,
	pub sender_id: UserId,
	pub content: String,
	pub created_at: Timestamp,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub read_at: Option<Timestamp>,
	/// Idempotency key echoed back by the server for messages sent from this client.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub client_id: Option<ClientId>,
}

impl Message {
	/// Builds the local echo shown while a send is in flight.
	pub fn optimistic(client_id: ClientId, conversation_id: ConversationId, sender_id: UserId, content: impl Into<String>, now: Timestamp) -> Self {
		Self {
			id: MessageId::local(client_id),
			conversation_id,
			sender_id,
			content: content.into(),
			created_at: now,
			read_at: None,
			client_id: Some(client_id),
		}
	}

	pub fn is_read(&self) -> bool {
		self.read_at.is_some()
	}
}

/// Conversation row, as listed in a user's inbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
	pub id: ConversationId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub property_id: Option<PropertyId>,
	pub buyer_id: UserId,
	pub seller_id: UserId,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_message: Option<String>,
	pub updated_at: Timestamp,
}

impl Conversation {
	/// Both participants of the conversation.
	pub fn participants(&self) -> [&UserId; 2] {
		[&self.buyer_id, &self.seller_id]
	}

	pub fn involves(&self, user: &UserId) -> bool {
		self.participants().contains(&user)
	}
}
