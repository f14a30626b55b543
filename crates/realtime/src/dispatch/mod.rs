//! Optimistic user actions.
//!
//! [`ActionDispatcher::dispatch`] applies the expected outcome of an action
//! to the local views, records what is needed to undo it, and only then
//! issues the mutation. Success leaves reconciliation to the confirming
//! change event. Failure reverts the patch if the touched views have not
//! changed since, invalidates them otherwise, and raises a [`UserAlert`].
//! Actions are never retried.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use hearth_primitives::{
	ClientId, ConversationId, ListingStatus, Message, ModerationToast, Notification, NotificationId, PropertyId, UserId,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::backend::{ActionKind, MutationRequest, MutationService};
use crate::coherence::{Coherence, ContentEdit, OptimisticPatch};
use crate::error::ActionError;
use crate::reducer::{LocalReducerStore, ReadSnapshot};
use crate::topic::TopicId;
use crate::view::{ViewContents, ViewKey};

/// A user-initiated mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
	SendMessage {
		conversation_id: ConversationId,
		sender_id: UserId,
		content: String,
	},
	ApproveListing {
		property_id: PropertyId,
	},
	RejectListing {
		property_id: PropertyId,
		#[serde(default, skip_serializing_if = "Option::is_none")]
		reason: Option<String>,
	},
	MarkNotificationRead {
		user_id: UserId,
		notification_id: NotificationId,
	},
	MarkAllNotificationsRead {
		user_id: UserId,
	},
}

impl Action {
	pub fn kind(&self) -> ActionKind {
		match self {
			Self::SendMessage { .. } => ActionKind::SendMessage,
			Self::ApproveListing { .. } => ActionKind::ApproveListing,
			Self::RejectListing { .. } => ActionKind::RejectListing,
			Self::MarkNotificationRead { .. } => ActionKind::MarkNotificationRead,
			Self::MarkAllNotificationsRead { .. } => ActionKind::MarkAllNotificationsRead,
		}
	}

	fn target_id(&self) -> String {
		match self {
			Self::SendMessage { conversation_id, .. } => conversation_id.to_string(),
			Self::ApproveListing { property_id } | Self::RejectListing { property_id, .. } => property_id.to_string(),
			Self::MarkNotificationRead { notification_id, .. } => notification_id.to_string(),
			Self::MarkAllNotificationsRead { user_id } => user_id.to_string(),
		}
	}

	fn params(&self, client_id: ClientId) -> Value {
		match self {
			Self::SendMessage {
				conversation_id,
				sender_id,
				content,
			} => json!({
				"conversation_id": conversation_id,
				"sender_id": sender_id,
				"content": content,
				"client_id": client_id,
			}),
			Self::ApproveListing { .. } => json!({ "status": ListingStatus::Active }),
			Self::RejectListing { reason, .. } => json!({ "status": ListingStatus::Rejected, "reason": reason }),
			Self::MarkNotificationRead { user_id, .. } => json!({ "user_id": user_id, "read": true }),
			Self::MarkAllNotificationsRead { .. } => json!({ "read": true }),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PendingStatus {
	Pending,
	Confirmed,
	Failed,
}

/// State captured before an optimistic patch.
#[derive(Debug, Clone, PartialEq)]
pub enum RollbackSnapshot {
	/// Optimistic message to drop.
	Message { conversation_id: ConversationId, client_id: ClientId },
	Listing {
		property_id: PropertyId,
		previous: Option<ListingStatus>,
		/// Dismissed toast and its queue position.
		toast: Option<(usize, ModerationToast)>,
	},
	NotificationRead { previous: Option<Notification> },
	AllRead { user_id: UserId, notifications: Vec<Notification>, count: u64 },
}

impl RollbackSnapshot {
	/// Reverts reducer projections. Only an unconfirmed message is dropped
	/// unconditionally; other state is restored only over an unchanged view.
	fn revert(self, reducer: &mut LocalReducerStore, unchanged: bool) {
		match self {
			Self::Message {
				conversation_id,
				client_id,
			} => {
				reducer.remove_optimistic_message(&conversation_id, client_id);
			}
			Self::Listing {
				toast: Some((index, toast)), ..
			} if unchanged => {
				reducer.restore_toast(index, toast);
			}
			Self::NotificationRead { previous: Some(previous) } if unchanged => reducer.restore_read(previous),
			Self::AllRead {
				user_id,
				notifications,
				count,
			} if unchanged => reducer.restore_all_read(&user_id, ReadSnapshot { notifications, count }),
			_ => {}
		}
	}
}

/// An action awaiting its mutation result.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
	/// Client-generated idempotency key, forwarded as `client_id`.
	pub local_id: ClientId,
	pub kind: ActionKind,
	pub status: PendingStatus,
	pub rollback: RollbackSnapshot,
}

/// User-visible notices. Only action failures and degraded-mode changes are surfaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAlert {
	ActionFailed {
		local_id: ClientId,
		kind: ActionKind,
		message: String,
	},
	/// Live updates for a topic stopped; views fed by it may be outdated.
	Degraded { topic: TopicId },
	Recovered { topic: TopicId },
}

pub struct ActionDispatcher {
	coherence: Arc<Coherence>,
	mutations: Arc<dyn MutationService>,
	alerts: broadcast::Sender<UserAlert>,
	pending: Mutex<HashMap<ClientId, PendingAction>>,
	closed: AtomicBool,
}

impl ActionDispatcher {
	pub(crate) fn new(coherence: Arc<Coherence>, mutations: Arc<dyn MutationService>, alerts: broadcast::Sender<UserAlert>) -> Self {
		Self {
			coherence,
			mutations,
			alerts,
			pending: Mutex::new(HashMap::new()),
			closed: AtomicBool::new(false),
		}
	}

	/// Applies `action` optimistically and issues its mutation.
	pub async fn dispatch(&self, action: Action) -> Result<PendingAction, ActionError> {
		if self.closed.load(Ordering::Acquire) {
			return Err(ActionError::SessionClosed);
		}

		let local_id = ClientId::new();
		let kind = action.kind();
		let request = MutationRequest {
			kind,
			target_id: action.target_id(),
			params: action.params(local_id),
			client_id: local_id,
		};

		let (rollback, patch) = self.apply_optimistic(&action, local_id);
		let pending = PendingAction {
			local_id,
			kind,
			status: PendingStatus::Pending,
			rollback,
		};
		self.pending.lock().insert(local_id, pending.clone());
		debug!(action = %kind, local_id = %local_id, views = patch.touched().count(), "optimistic patch applied");

		let result = self.mutations.mutate(request).await;
		let mut pending = self.pending.lock().remove(&local_id).unwrap_or(pending);

		match result {
			Ok(()) => {
				pending.status = PendingStatus::Confirmed;
				debug!(action = %kind, local_id = %local_id, "mutation confirmed");
				Ok(pending)
			}
			Err(err) => {
				pending.status = PendingStatus::Failed;
				let snapshot = pending.rollback.clone();
				let restored = self.coherence.rollback(patch, |reducer, unchanged| snapshot.revert(reducer, unchanged));
				warn!(action = %kind, local_id = %local_id, error = %err, restored, "mutation failed, optimistic patch rolled back");
				let _ = self.alerts.send(UserAlert::ActionFailed {
					local_id,
					kind,
					message: err.to_string(),
				});
				Err(err)
			}
		}
	}

	fn apply_optimistic(&self, action: &Action, local_id: ClientId) -> (RollbackSnapshot, OptimisticPatch) {
		match action {
			Action::SendMessage {
				conversation_id,
				sender_id,
				content,
			} => {
				let message = Message::optimistic(local_id, conversation_id.clone(), sender_id.clone(), content.clone(), Utc::now());
				let streaming = [ViewKey::Transcript(conversation_id.clone())];
				let ((), patch) = self
					.coherence
					.apply_optimistic(&streaming, Vec::new(), |reducer| reducer.insert_optimistic_message(message));
				let rollback = RollbackSnapshot::Message {
					conversation_id: conversation_id.clone(),
					client_id: local_id,
				};
				(rollback, patch)
			}
			Action::ApproveListing { property_id } => self.moderate(property_id, ListingStatus::Active),
			Action::RejectListing { property_id, .. } => self.moderate(property_id, ListingStatus::Rejected),
			Action::MarkNotificationRead { user_id, notification_id } => {
				let streaming = [ViewKey::NotificationFeed(user_id.clone()), ViewKey::UnreadCount(user_id.clone())];
				let (previous, patch) = self
					.coherence
					.apply_optimistic(&streaming, Vec::new(), |reducer| reducer.mark_read(user_id, notification_id));
				(RollbackSnapshot::NotificationRead { previous }, patch)
			}
			Action::MarkAllNotificationsRead { user_id } => {
				let streaming = [ViewKey::NotificationFeed(user_id.clone()), ViewKey::UnreadCount(user_id.clone())];
				let (snapshot, patch) = self.coherence.apply_optimistic(&streaming, Vec::new(), |reducer| reducer.mark_all_read(user_id));
				let rollback = RollbackSnapshot::AllRead {
					user_id: user_id.clone(),
					notifications: snapshot.notifications,
					count: snapshot.count,
				};
				(rollback, patch)
			}
		}
	}

	/// Shows a moderation decision: record status, queue membership and toast.
	fn moderate(&self, property_id: &PropertyId, status: ListingStatus) -> (RollbackSnapshot, OptimisticPatch) {
		let record = ViewKey::Listing(property_id.clone());
		let previous = self
			.coherence
			.propagator()
			.peek(&record)
			.and_then(|view| view.listing().map(|listing| listing.status));
		let edits: Vec<(ViewKey, ContentEdit)> = vec![
			(record, set_listing_status(status)),
			(ViewKey::ModerationQueue, drop_from_queue(property_id.clone())),
		];
		let (toast, patch) = self
			.coherence
			.apply_optimistic(&[ViewKey::ModerationToasts], edits, |reducer| reducer.take_toast(property_id));
		let rollback = RollbackSnapshot::Listing {
			property_id: property_id.clone(),
			previous,
			toast,
		};
		(rollback, patch)
	}

	/// Actions whose mutation has not resolved yet.
	pub fn pending_actions(&self) -> Vec<PendingAction> {
		self.pending.lock().values().cloned().collect()
	}

	pub fn alerts(&self) -> broadcast::Receiver<UserAlert> {
		self.alerts.subscribe()
	}

	/// Rejects further dispatches. In-flight mutations still complete.
	pub(crate) fn close(&self) {
		self.closed.store(true, Ordering::Release);
	}
}

fn set_listing_status(status: ListingStatus) -> ContentEdit {
	Box::new(move |contents| {
		if let ViewContents::Listing(Some(listing)) = contents {
			listing.status = status;
		}
	})
}

fn drop_from_queue(property_id: PropertyId) -> ContentEdit {
	Box::new(move |contents| {
		if let ViewContents::Listings(listings) = contents {
			listings.retain(|listing| listing.id != property_id);
		}
	})
}
