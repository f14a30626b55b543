//! Which cached views an event touches, and how.

use hearth_primitives::ListingSummary;

use crate::event::DomainEvent;
use crate::view::{ViewContents, ViewKey};

/// What to do with one dependent view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
	/// The change is additive or replaces an exact record shape; update in place.
	Patch(ViewKey),
	/// Membership or ordering may change; mark stale and refetch.
	Invalidate(ViewKey),
}

impl Effect {
	pub fn key(&self) -> &ViewKey {
		match self {
			Self::Patch(key) | Self::Invalidate(key) => key,
		}
	}
}

/// Computes effects of `event` restricted to the currently cached views.
pub fn plan(event: &DomainEvent, cached: &[ViewKey]) -> Vec<Effect> {
	let is_cached = |key: &ViewKey| cached.contains(key);
	let conversation_lists = || cached.iter().filter(|k| matches!(k, ViewKey::ConversationList(_))).cloned();

	let effects: Vec<Effect> = match event {
		DomainEvent::MessageInserted { conversation_id, .. } => std::iter::once(Effect::Patch(ViewKey::Transcript(conversation_id.clone())))
			.chain(conversation_lists().map(Effect::Invalidate))
			.collect(),
		DomainEvent::MessageUpdated { conversation_id, .. } => vec![Effect::Patch(ViewKey::Transcript(conversation_id.clone()))],
		DomainEvent::MessageDeleted { conversation_id, .. } => std::iter::once(Effect::Invalidate(ViewKey::Transcript(conversation_id.clone())))
			.chain(conversation_lists().map(Effect::Invalidate))
			.collect(),
		DomainEvent::ConversationChanged { conversation } => conversation
			.participants()
			.into_iter()
			.map(|user| Effect::Invalidate(ViewKey::ConversationList(user.clone())))
			.collect(),
		DomainEvent::NotificationCreated { notification } => vec![
			Effect::Patch(ViewKey::NotificationFeed(notification.user_id.clone())),
			Effect::Patch(ViewKey::UnreadCount(notification.user_id.clone())),
		],
		DomainEvent::NotificationUpdated { notification } => vec![Effect::Patch(ViewKey::NotificationFeed(notification.user_id.clone()))],
		DomainEvent::NotificationDeleted { user_id, .. } => vec![
			Effect::Invalidate(ViewKey::NotificationFeed(user_id.clone())),
			Effect::Invalidate(ViewKey::UnreadCount(user_id.clone())),
		],
		DomainEvent::ListingSubmitted { listing } | DomainEvent::ListingStatusChanged { listing, .. } => vec![
			Effect::Patch(ViewKey::ModerationToasts),
			Effect::Patch(ViewKey::Listing(listing.id.clone())),
			Effect::Invalidate(ViewKey::ModerationQueue),
		],
		DomainEvent::ListingUpdated { listing } => vec![
			Effect::Patch(ViewKey::Listing(listing.id.clone())),
			Effect::Invalidate(ViewKey::ModerationQueue),
		],
		DomainEvent::UnreadCountSynced { user_id, .. } => vec![Effect::Patch(ViewKey::UnreadCount(user_id.clone()))],
	};

	effects.into_iter().filter(|effect| is_cached(effect.key())).collect()
}

/// Exact replacement contents for a non-streaming record view.
pub fn record_patch(event: &DomainEvent, key: &ViewKey) -> Option<ViewContents> {
	let ViewKey::Listing(property_id) = key else {
		return None;
	};
	let listing = event_listing(event)?;
	(listing.id == *property_id).then(|| ViewContents::Listing(Some(listing.clone())))
}

fn event_listing(event: &DomainEvent) -> Option<&ListingSummary> {
	match event {
		DomainEvent::ListingSubmitted { listing } | DomainEvent::ListingStatusChanged { listing, .. } | DomainEvent::ListingUpdated { listing } => {
			Some(listing)
		}
		_ => None,
	}
}

