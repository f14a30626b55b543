//! Authoritative projections for streaming views.
//!
//! [`LocalReducerStore`] owns the message transcripts, notification feeds,
//! unread counters and the moderation toast queue. Domain events are applied
//! as ordered, idempotent patches: an identity that was already applied is a
//! no-op, and a confirmed message replaces its optimistic echo in place.

use std::collections::{HashMap, VecDeque};

use hearth_primitives::{ClientId, ConversationId, Message, ModerationToast, Notification, NotificationId, PropertyId, UserId};
use tracing::trace;

use crate::event::{DomainEvent, Envelope};
use crate::view::{ViewContents, ViewKey};

mod timeline;

pub use timeline::{Entity, InsertOutcome, Timeline};

/// Non-negative unread badge count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnreadCounter(u64);

impl UnreadCounter {
	pub fn get(self) -> u64 {
		self.0
	}

	pub fn increment(&mut self) {
		self.0 = self.0.saturating_add(1);
	}

	/// Decrements by `n`, clamping at zero.
	pub fn decrement(&mut self, n: u64) {
		self.0 = self.0.saturating_sub(n);
	}

	pub fn reset(&mut self) {
		self.0 = 0;
	}

	/// Overwrites with an authoritative value.
	pub fn sync(&mut self, count: u64) {
		self.0 = count;
	}
}

/// Bounded admin toast queue, one toast per listing.
#[derive(Debug, Clone)]
pub struct ToastQueue {
	capacity: usize,
	toasts: VecDeque<ModerationToast>,
}

impl ToastQueue {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			toasts: VecDeque::new(),
		}
	}

	pub fn contains(&self, property_id: &PropertyId) -> bool {
		self.toasts.iter().any(|t| &t.property_id == property_id)
	}

	/// Queues a toast, evicting the oldest when full. Returns false for a listing already queued.
	pub fn push(&mut self, toast: ModerationToast) -> bool {
		if self.contains(&toast.property_id) {
			return false;
		}
		if self.toasts.len() >= self.capacity {
			self.toasts.pop_front();
		}
		self.toasts.push_back(toast);
		true
	}

	/// Removes the toast for a listing, returning it with its position.
	pub fn remove(&mut self, property_id: &PropertyId) -> Option<(usize, ModerationToast)> {
		let idx = self.toasts.iter().position(|t| &t.property_id == property_id)?;
		self.toasts.remove(idx).map(|toast| (idx, toast))
	}

	/// Puts a removed toast back at its former position.
	pub fn restore(&mut self, index: usize, toast: ModerationToast) -> bool {
		if self.contains(&toast.property_id) {
			return false;
		}
		let index = index.min(self.toasts.len());
		self.toasts.insert(index, toast);
		while self.toasts.len() > self.capacity {
			self.toasts.pop_front();
		}
		true
	}

	pub fn replace(&mut self, toasts: Vec<ModerationToast>) {
		self.toasts.clear();
		for toast in toasts {
			self.push(toast);
		}
	}

	pub fn items(&self) -> Vec<ModerationToast> {
		self.toasts.iter().cloned().collect()
	}

	pub fn len(&self) -> usize {
		self.toasts.len()
	}

	pub fn is_empty(&self) -> bool {
		self.toasts.is_empty()
	}
}

/// What applying an event did to one projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
	Appended,
	Reconciled { client_id: ClientId, conflict: bool },
	Updated,
	Removed,
	/// Identity already applied.
	Duplicate,
	/// Nothing to apply to.
	Ignored,
}

impl ApplyOutcome {
	/// Whether the projection changed.
	pub fn changed(self) -> bool {
		!matches!(self, Self::Duplicate | Self::Ignored)
	}
}

impl From<InsertOutcome> for ApplyOutcome {
	fn from(outcome: InsertOutcome) -> Self {
		match outcome {
			InsertOutcome::Appended => Self::Appended,
			InsertOutcome::Reconciled { client_id, conflict } => Self::Reconciled { client_id, conflict },
			InsertOutcome::Duplicate => Self::Duplicate,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
	pub key: ViewKey,
	pub outcome: ApplyOutcome,
}

impl Applied {
	fn new(key: ViewKey, outcome: impl Into<ApplyOutcome>) -> Self {
		Self {
			key,
			outcome: outcome.into(),
		}
	}
}

/// Notifications whose read flag was flipped by a mark-all-read, kept for rollback.
#[derive(Debug, Clone, Default)]
pub struct ReadSnapshot {
	pub notifications: Vec<Notification>,
	pub count: u64,
}

#[derive(Debug)]
pub struct LocalReducerStore {
	transcripts: HashMap<ConversationId, Timeline<Message>>,
	feeds: HashMap<UserId, Timeline<Notification>>,
	unread: HashMap<UserId, UnreadCounter>,
	toasts: ToastQueue,
	/// Bumped by [`LocalReducerStore::clear`].
	resets: u64,
}

impl LocalReducerStore {
	pub fn new(toast_capacity: usize) -> Self {
		Self {
			transcripts: HashMap::new(),
			feeds: HashMap::new(),
			unread: HashMap::new(),
			toasts: ToastQueue::new(toast_capacity),
			resets: 0,
		}
	}

	/// Applies one event to every projection it touches.
	pub fn apply(&mut self, envelope: &Envelope) -> Vec<Applied> {
		trace!(topic = %envelope.topic, event = envelope.event.name(), "reducer apply");
		match &envelope.event {
			DomainEvent::MessageInserted { conversation_id, message } => {
				let outcome = self.transcripts.entry(conversation_id.clone()).or_default().insert(message.clone());
				vec![Applied::new(ViewKey::Transcript(conversation_id.clone()), outcome)]
			}
			DomainEvent::MessageUpdated { conversation_id, message } => {
				let updated = self.transcripts.get_mut(conversation_id).is_some_and(|t| t.update(message.clone()));
				vec![Applied::new(ViewKey::Transcript(conversation_id.clone()), outcome_of(updated, ApplyOutcome::Updated))]
			}
			DomainEvent::MessageDeleted { conversation_id, message_id } => {
				let removed = self.transcripts.entry(conversation_id.clone()).or_default().remove(message_id).is_some();
				vec![Applied::new(ViewKey::Transcript(conversation_id.clone()), outcome_of(removed, ApplyOutcome::Removed))]
			}
			DomainEvent::ConversationChanged { .. } | DomainEvent::ListingUpdated { .. } => Vec::new(),
			DomainEvent::NotificationCreated { notification } => {
				let user = notification.user_id.clone();
				let outcome = self.feeds.entry(user.clone()).or_default().insert(notification.clone());
				let mut applied = vec![Applied::new(ViewKey::NotificationFeed(user.clone()), outcome)];
				if outcome == InsertOutcome::Appended && notification.is_unread() {
					self.unread.entry(user.clone()).or_default().increment();
					applied.push(Applied::new(ViewKey::UnreadCount(user), ApplyOutcome::Updated));
				}
				applied
			}
			DomainEvent::NotificationUpdated { notification } => {
				let user = notification.user_id.clone();
				let updated = self.feeds.get_mut(&user).is_some_and(|f| f.update(notification.clone()));
				vec![Applied::new(ViewKey::NotificationFeed(user), outcome_of(updated, ApplyOutcome::Updated))]
			}
			DomainEvent::NotificationDeleted { user_id, notification_id } => {
				let removed = self.feeds.entry(user_id.clone()).or_default().remove(notification_id).is_some();
				vec![Applied::new(ViewKey::NotificationFeed(user_id.clone()), outcome_of(removed, ApplyOutcome::Removed))]
			}
			DomainEvent::ListingSubmitted { listing } => {
				let pushed = self.toasts.push(ModerationToast::for_listing(listing));
				let outcome = if pushed { ApplyOutcome::Appended } else { ApplyOutcome::Duplicate };
				vec![Applied::new(ViewKey::ModerationToasts, outcome)]
			}
			DomainEvent::ListingStatusChanged {
				property_id, status, listing, ..
			} => {
				let outcome = if status.is_pending() {
					if self.toasts.push(ModerationToast::for_listing(listing)) {
						ApplyOutcome::Appended
					} else {
						ApplyOutcome::Duplicate
					}
				} else if self.toasts.remove(property_id).is_some() {
					ApplyOutcome::Removed
				} else {
					// Already dismissed, e.g. by an optimistic moderation action.
					ApplyOutcome::Duplicate
				};
				vec![Applied::new(ViewKey::ModerationToasts, outcome)]
			}
			DomainEvent::UnreadCountSynced { user_id, count } => {
				self.unread.entry(user_id.clone()).or_default().sync(*count);
				vec![Applied::new(ViewKey::UnreadCount(user_id.clone()), ApplyOutcome::Updated)]
			}
		}
	}

	/// Current projection for a streaming view.
	pub fn snapshot(&self, key: &ViewKey) -> Option<ViewContents> {
		match key {
			ViewKey::Transcript(id) => self.transcripts.get(id).map(|t| ViewContents::Messages(t.items())),
			ViewKey::NotificationFeed(user) => self.feeds.get(user).map(|f| ViewContents::Notifications(f.items())),
			ViewKey::UnreadCount(user) => self.unread.get(user).map(|c| ViewContents::Count(c.get())),
			ViewKey::ModerationToasts => Some(ViewContents::Toasts(self.toasts.items())),
			ViewKey::ConversationList(_) | ViewKey::ModerationQueue | ViewKey::Listing(_) => None,
		}
	}

	pub fn has_projection(&self, key: &ViewKey) -> bool {
		match key {
			ViewKey::Transcript(id) => self.transcripts.contains_key(id),
			ViewKey::NotificationFeed(user) => self.feeds.contains_key(user),
			ViewKey::UnreadCount(user) => self.unread.contains_key(user),
			ViewKey::ModerationToasts => true,
			_ => false,
		}
	}

	/// Reseeds a streaming projection from fetched contents. Returns false when
	/// the key is not streaming or the contents have the wrong shape.
	pub fn reseed(&mut self, key: &ViewKey, contents: ViewContents) -> bool {
		match (key, contents) {
			(ViewKey::Transcript(id), ViewContents::Messages(messages)) => {
				self.transcripts.entry(id.clone()).or_default().reseed(messages);
				true
			}
			(ViewKey::NotificationFeed(user), ViewContents::Notifications(notifications)) => {
				self.feeds.entry(user.clone()).or_default().reseed(notifications);
				true
			}
			(ViewKey::UnreadCount(user), ViewContents::Count(count)) => {
				self.unread.entry(user.clone()).or_default().sync(count);
				true
			}
			(ViewKey::ModerationToasts, ViewContents::Toasts(toasts)) => {
				self.toasts.replace(toasts);
				true
			}
			_ => false,
		}
	}

	pub fn evict(&mut self, key: &ViewKey) {
		match key {
			ViewKey::Transcript(id) => {
				self.transcripts.remove(id);
			}
			ViewKey::NotificationFeed(user) => {
				self.feeds.remove(user);
			}
			ViewKey::UnreadCount(user) => {
				self.unread.remove(user);
			}
			ViewKey::ModerationToasts => self.toasts.replace(Vec::new()),
			_ => {}
		}
	}

	pub fn clear(&mut self) {
		self.transcripts.clear();
		self.feeds.clear();
		self.unread.clear();
		self.toasts.replace(Vec::new());
		self.resets = self.resets.wrapping_add(1);
	}

	/// Number of times the store was cleared. State captured before a clear
	/// must not be written back after it.
	pub fn resets(&self) -> u64 {
		self.resets
	}

	pub fn transcript(&self, id: &ConversationId) -> Option<&Timeline<Message>> {
		self.transcripts.get(id)
	}

	pub fn feed(&self, user: &UserId) -> Option<&Timeline<Notification>> {
		self.feeds.get(user)
	}

	pub fn unread(&self, user: &UserId) -> u64 {
		self.unread.get(user).map_or(0, |c| c.get())
	}

	pub fn toasts(&self) -> &ToastQueue {
		&self.toasts
	}

	pub fn insert_optimistic_message(&mut self, message: Message) {
		self.transcripts.entry(message.conversation_id.clone()).or_default().insert_optimistic(message);
	}

	pub fn remove_optimistic_message(&mut self, conversation_id: &ConversationId, client_id: ClientId) -> bool {
		self.transcripts
			.get_mut(conversation_id)
			.and_then(|t| t.remove_optimistic(client_id))
			.is_some()
	}

	/// Marks one notification read, decrementing the counter if it was unread.
	/// Returns the notification as it was before.
	pub fn mark_read(&mut self, user: &UserId, id: &NotificationId) -> Option<Notification> {
		let previous = self.feeds.get_mut(user)?.modify(id, |n| n.read = true)?;
		if previous.is_unread() {
			self.unread.entry(user.clone()).or_default().decrement(1);
		}
		Some(previous)
	}

	/// Reverts [`LocalReducerStore::mark_read`].
	pub fn restore_read(&mut self, previous: Notification) {
		let user = previous.user_id.clone();
		let was_unread = previous.is_unread();
		let restored = self.feeds.get_mut(&user).is_some_and(|f| f.update(previous));
		if restored
			&& was_unread
			&& let Some(counter) = self.unread.get_mut(&user)
		{
			counter.increment();
		}
	}

	/// Marks every notification of `user` read and zeroes the counter.
	pub fn mark_all_read(&mut self, user: &UserId) -> ReadSnapshot {
		let notifications = self.feeds.get_mut(user).map_or_else(Vec::new, |f| {
			f.modify_all(|n| {
				let changed = !n.read;
				n.read = true;
				changed
			})
		});
		let counter = self.unread.entry(user.clone()).or_default();
		let count = counter.get();
		counter.reset();
		ReadSnapshot { notifications, count }
	}

	/// Reverts [`LocalReducerStore::mark_all_read`]. An evicted counter stays evicted.
	pub fn restore_all_read(&mut self, user: &UserId, snapshot: ReadSnapshot) {
		if let Some(feed) = self.feeds.get_mut(user) {
			for notification in snapshot.notifications {
				feed.update(notification);
			}
		}
		if let Some(counter) = self.unread.get_mut(user) {
			counter.sync(snapshot.count);
		}
	}

	pub fn take_toast(&mut self, property_id: &PropertyId) -> Option<(usize, ModerationToast)> {
		self.toasts.remove(property_id)
	}

	pub fn restore_toast(&mut self, index: usize, toast: ModerationToast) -> bool {
		self.toasts.restore(index, toast)
	}
}

fn outcome_of(applied: bool, outcome: ApplyOutcome) -> ApplyOutcome {
	if applied { outcome } else { ApplyOutcome::Ignored }
}
