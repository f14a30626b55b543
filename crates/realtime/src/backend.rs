//! Request/response collaborators: mutations and view refetches.

use std::fmt;

use async_trait::async_trait;
use hearth_primitives::{ClientId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ActionError, FetchError};
use crate::view::{ViewContents, ViewKey};

/// Mutation kinds understood by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
	SendMessage,
	ApproveListing,
	RejectListing,
	MarkNotificationRead,
	MarkAllNotificationsRead,
}

impl ActionKind {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::SendMessage => "send_message",
			Self::ApproveListing => "approve_listing",
			Self::RejectListing => "reject_listing",
			Self::MarkNotificationRead => "mark_notification_read",
			Self::MarkAllNotificationsRead => "mark_all_notifications_read",
		}
	}
}

impl fmt::Display for ActionKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// `{kind, targetId, params}` mutation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
	pub kind: ActionKind,
	pub target_id: String,
	#[serde(default)]
	pub params: Value,
	/// Idempotency key; echoed back on rows the mutation creates.
	pub client_id: ClientId,
}

#[async_trait]
pub trait MutationService: Send + Sync {
	async fn mutate(&self, request: MutationRequest) -> Result<(), ActionError>;
}

#[async_trait]
pub trait ViewFetcher: Send + Sync {
	/// Fetches authoritative contents for a view.
	async fn fetch(&self, key: &ViewKey) -> Result<ViewContents, FetchError>;

	/// Fallback poll used while the notifications stream is closed.
	async fn unread_count(&self, user: &UserId) -> Result<u64, FetchError>;
}
