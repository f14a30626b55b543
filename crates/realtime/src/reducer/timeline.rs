//! Ordered, deduplicated entity lists with optimistic entries.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;

use hearth_primitives::{ClientId, Message, MessageId, Notification, NotificationId};
use tracing::debug;

/// An item with a stable server identity.
pub trait Entity: Clone {
	type Id: Clone + Eq + Hash + fmt::Display;

	fn id(&self) -> &Self::Id;

	/// Idempotency key of the mutation that created this item, if it came from this client.
	fn client_id(&self) -> Option<ClientId> {
		None
	}

	/// Whether the confirmed form of an optimistic item differs in content.
	fn conflicts_with(&self, _confirmed: &Self) -> bool {
		false
	}
}

impl Entity for Message {
	type Id = MessageId;

	fn id(&self) -> &MessageId {
		&self.id
	}

	fn client_id(&self) -> Option<ClientId> {
		self.client_id
	}

	fn conflicts_with(&self, confirmed: &Self) -> bool {
		self.content != confirmed.content || self.sender_id != confirmed.sender_id
	}
}

impl Entity for Notification {
	type Id = NotificationId;

	fn id(&self) -> &NotificationId {
		&self.id
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
	Snapshot,
	Live,
	/// Local echo awaiting its server counterpart.
	Optimistic,
}

#[derive(Debug, Clone)]
struct Entry<T> {
	item: T,
	origin: Origin,
}

/// Result of [`Timeline::insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
	Appended,
	/// Replaced the optimistic entry carrying the same client id.
	Reconciled { client_id: ClientId, conflict: bool },
	/// Identity already applied; nothing changed.
	Duplicate,
}

/// Arrival-ordered list keyed by entity id.
///
/// Every id ever applied is remembered, so re-deliveries and inserts of
/// removed ids are no-ops.
#[derive(Debug, Clone)]
pub struct Timeline<T: Entity> {
	entries: Vec<Entry<T>>,
	seen: HashSet<T::Id>,
	removed: HashSet<T::Id>,
}

impl<T: Entity> Default for Timeline<T> {
	fn default() -> Self {
		Self {
			entries: Vec::new(),
			seen: HashSet::new(),
			removed: HashSet::new(),
		}
	}
}

impl<T: Entity> Timeline<T> {
	pub fn new() -> Self {
		Self::default()
	}

	/// Applies a server-confirmed item.
	pub fn insert(&mut self, item: T) -> InsertOutcome {
		let id = item.id().clone();
		if self.seen.contains(&id) || self.removed.contains(&id) {
			return InsertOutcome::Duplicate;
		}
		self.seen.insert(id.clone());

		if let Some(client_id) = item.client_id()
			&& let Some(entry) = self
				.entries
				.iter_mut()
				.find(|e| e.origin == Origin::Optimistic && e.item.client_id() == Some(client_id))
		{
			let conflict = entry.item.conflicts_with(&item);
			if conflict {
				debug!(id = %id, client_id = %client_id, "optimistic entry differs from server echo, server wins");
			}
			entry.item = item;
			entry.origin = Origin::Live;
			return InsertOutcome::Reconciled { client_id, conflict };
		}

		self.entries.push(Entry { item, origin: Origin::Live });
		InsertOutcome::Appended
	}

	/// Appends a local echo. It is replaced by [`Timeline::insert`] once confirmed.
	pub fn insert_optimistic(&mut self, item: T) {
		self.entries.push(Entry {
			item,
			origin: Origin::Optimistic,
		});
	}

	/// Removes a still-unconfirmed local echo.
	pub fn remove_optimistic(&mut self, client_id: ClientId) -> Option<T> {
		let idx = self
			.entries
			.iter()
			.position(|e| e.origin == Origin::Optimistic && e.item.client_id() == Some(client_id))?;
		Some(self.entries.remove(idx).item)
	}

	/// Replaces the item with the same id. Returns false when it is not present.
	pub fn update(&mut self, item: T) -> bool {
		match self.entries.iter_mut().find(|e| e.item.id() == item.id()) {
			Some(entry) => {
				entry.item = item;
				true
			}
			None => false,
		}
	}

	/// Mutates the item with the given id in place, returning its previous value.
	pub fn modify(&mut self, id: &T::Id, f: impl FnOnce(&mut T)) -> Option<T> {
		let entry = self.entries.iter_mut().find(|e| e.item.id() == id)?;
		let previous = entry.item.clone();
		f(&mut entry.item);
		Some(previous)
	}

	/// Applies `f` to every item, returning the previous values of those it changed.
	pub fn modify_all(&mut self, mut f: impl FnMut(&mut T) -> bool) -> Vec<T> {
		let mut previous = Vec::new();
		for entry in &mut self.entries {
			let before = entry.item.clone();
			if f(&mut entry.item) {
				previous.push(before);
			}
		}
		previous
	}

	pub fn remove(&mut self, id: &T::Id) -> Option<T> {
		self.removed.insert(id.clone());
		let idx = self.entries.iter().position(|e| e.item.id() == id)?;
		Some(self.entries.remove(idx).item)
	}

	/// Replaces confirmed contents with a fetched snapshot.
	///
	/// Resulting order: snapshot items, then live items the snapshot does not
	/// contain yet, then optimistic items the snapshot has not confirmed.
	pub fn reseed(&mut self, snapshot: Vec<T>) {
		let snapshot_ids: HashSet<T::Id> = snapshot.iter().map(|item| item.id().clone()).collect();
		let confirmed: HashSet<ClientId> = snapshot.iter().filter_map(Entity::client_id).collect();

		let mut entries: Vec<Entry<T>> = snapshot
			.into_iter()
			.filter(|item| !self.removed.contains(item.id()))
			.map(|item| Entry {
				item,
				origin: Origin::Snapshot,
			})
			.collect();
		let mut optimistic = Vec::new();
		for entry in self.entries.drain(..) {
			match entry.origin {
				Origin::Live if !snapshot_ids.contains(entry.item.id()) => entries.push(entry),
				Origin::Optimistic if entry.item.client_id().is_none_or(|c| !confirmed.contains(&c)) => optimistic.push(entry),
				_ => {}
			}
		}
		entries.extend(optimistic);

		self.seen.extend(snapshot_ids);
		self.entries = entries;
	}

	pub fn get(&self, id: &T::Id) -> Option<&T> {
		self.entries.iter().map(|e| &e.item).find(|item| item.id() == id)
	}

	pub fn items(&self) -> Vec<T> {
		self.entries.iter().map(|e| e.item.clone()).collect()
	}

	pub fn iter(&self) -> impl Iterator<Item = &T> {
		self.entries.iter().map(|e| &e.item)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	/// Number of local echoes still awaiting confirmation.
	pub fn pending(&self) -> usize {
		self.entries.iter().filter(|e| e.origin == Origin::Optimistic).count()
	}
}
