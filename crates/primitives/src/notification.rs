use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{NotificationId, PropertyId, Timestamp, UserId};

/// Notification category, stored in the `type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
	NewMessage,
	ListingSubmitted,
	ListingApproved,
	ListingRejected,
	System,
	#[serde(other)]
	Other,
}

/// One notification row addressed to a single user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
	pub id: NotificationId,
	pub user_id: UserId,
	#[serde(rename = "type")]
	pub kind: NotificationKind,
	pub title: String,
	#[serde(default)]
	pub message: String,
	#[serde(default)]
	pub read: bool,
	pub created_at: Timestamp,
	/// Free-form payload; listing notifications carry `property_id`.
	#[serde(default, skip_serializing_if = "Value::is_null")]
	pub data: Value,
}

impl Notification {
	/// Property referenced by the notification payload, if any.
	pub fn property_id(&self) -> Option<PropertyId> {
		match self.data.get("property_id")? {
			Value::String(s) => Some(PropertyId::new(s.as_str())),
			Value::Number(n) => Some(PropertyId::new(n.to_string())),
			_ => None,
		}
	}

	/// Whether this row counts toward the owner's unread badge.
	pub fn is_unread(&self) -> bool {
		!self.read
	}
}
