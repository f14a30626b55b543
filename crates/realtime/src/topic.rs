//! Subscription topics.
//!
//! A [`Topic`] names one logical change stream (`conversation:42`,
//! `notifications:u1`, `moderation-queue`) together with the filter the
//! transport applies server-side and the user it is scoped to.

use std::fmt;

use hearth_primitives::{ConversationId, UserId};
use serde::{Deserialize, Serialize};

use crate::payload::Operation;

/// Stable textual identifier of a topic. Also the registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicId(String);

const MODERATION_QUEUE: &str = "moderation-queue";

impl TopicId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	/// Live transcript of one conversation.
	pub fn conversation(id: &ConversationId) -> Self {
		Self(format!("conversation:{id}"))
	}

	/// Inbox of conversations a user takes part in.
	pub fn conversations(user: &UserId) -> Self {
		Self(format!("conversations:{user}"))
	}

	pub fn notifications(user: &UserId) -> Self {
		Self(format!("notifications:{user}"))
	}

	pub fn moderation_queue() -> Self {
		Self(MODERATION_QUEUE.to_owned())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for TopicId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Backend tables that emit change notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
	Messages,
	Conversations,
	Notifications,
	Properties,
}

impl Table {
	/// Resolves a table name from a raw payload.
	pub fn parse(name: &str) -> Option<Self> {
		match name {
			"messages" => Some(Self::Messages),
			"conversations" => Some(Self::Conversations),
			"notifications" => Some(Self::Notifications),
			"properties" => Some(Self::Properties),
			_ => None,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Messages => "messages",
			Self::Conversations => "conversations",
			Self::Notifications => "notifications",
			Self::Properties => "properties",
		}
	}
}

impl fmt::Display for Table {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Which row operations a topic listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationFilter {
	Insert,
	Update,
	Delete,
	/// Every operation (`*`).
	All,
}

impl OperationFilter {
	pub fn admits(self, op: Operation) -> bool {
		match self {
			Self::All => true,
			Self::Insert => op == Operation::Insert,
			Self::Update => op == Operation::Update,
			Self::Delete => op == Operation::Delete,
		}
	}

	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Insert => "INSERT",
			Self::Update => "UPDATE",
			Self::Delete => "DELETE",
			Self::All => "*",
		}
	}
}

/// Server-side predicate attached to a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicFilter {
	pub table: Table,
	pub operation: OperationFilter,
	/// Row filter expression such as `conversation_id=eq.42`.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub row_filter: Option<String>,
}

/// A subscribable change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
	pub id: TopicId,
	pub filter: TopicFilter,
	/// Owner of the topic; `None` for shared topics like the moderation queue.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub scope: Option<UserId>,
}

impl Topic {
	/// Messages of one conversation, viewed by `viewer`.
	pub fn conversation(id: &ConversationId, viewer: &UserId) -> Self {
		Self {
			id: TopicId::conversation(id),
			filter: TopicFilter {
				table: Table::Messages,
				operation: OperationFilter::All,
				row_filter: Some(format!("conversation_id=eq.{id}")),
			},
			scope: Some(viewer.clone()),
		}
	}

	/// Conversation rows the user participates in. Row-level security scopes
	/// the stream, so no row filter is sent.
	pub fn conversations(user: &UserId) -> Self {
		Self {
			id: TopicId::conversations(user),
			filter: TopicFilter {
				table: Table::Conversations,
				operation: OperationFilter::All,
				row_filter: None,
			},
			scope: Some(user.clone()),
		}
	}

	pub fn notifications(user: &UserId) -> Self {
		Self {
			id: TopicId::notifications(user),
			filter: TopicFilter {
				table: Table::Notifications,
				operation: OperationFilter::All,
				row_filter: Some(format!("user_id=eq.{user}")),
			},
			scope: Some(user.clone()),
		}
	}

	/// Property rows, watched by admins for pending submissions and status changes.
	pub fn moderation_queue() -> Self {
		Self {
			id: TopicId::moderation_queue(),
			filter: TopicFilter {
				table: Table::Properties,
				operation: OperationFilter::All,
				row_filter: None,
			},
			scope: None,
		}
	}

	pub fn table(&self) -> Table {
		self.filter.table
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn topic_ids_follow_naming_scheme() {
		let user = UserId::from("u1");
		assert_eq!(TopicId::conversation(&ConversationId::from(42)).as_str(), "conversation:42");
		assert_eq!(TopicId::conversations(&user).as_str(), "conversations:u1");
		assert_eq!(TopicId::notifications(&user).as_str(), "notifications:u1");
		assert_eq!(TopicId::moderation_queue().as_str(), "moderation-queue");
	}

	#[test]
	fn conversation_topic_filters_by_conversation() {
		let topic = Topic::conversation(&ConversationId::from(42), &UserId::from("u1"));
		assert_eq!(topic.table(), Table::Messages);
		assert_eq!(topic.filter.row_filter.as_deref(), Some("conversation_id=eq.42"));
		assert_eq!(topic.scope, Some(UserId::from("u1")));
	}

	#[test]
	fn operation_filter_admits() {
		assert!(OperationFilter::All.admits(Operation::Delete));
		assert!(OperationFilter::Insert.admits(Operation::Insert));
		assert!(!OperationFilter::Insert.admits(Operation::Update));
	}

	#[test]
	fn table_names_parse() {
		assert_eq!(Table::parse("properties"), Some(Table::Properties));
		assert_eq!(Table::parse("profiles"), None);
	}
}
