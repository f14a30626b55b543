//! Single entry point into the reducer and the propagator.
//!
//! Lock order is reducer, then propagator state. Listeners are invoked only
//! after both are released.

use parking_lot::Mutex;
use tracing::debug;

use crate::config::ViewsConfig;
use crate::error::FetchError;
use crate::event::Envelope;
use crate::propagate::{CacheCoherencePropagator, RefetchTicket, ViewListener, ViewStamp};
use crate::reducer::LocalReducerStore;
use crate::topic::TopicId;
use crate::view::{CachedView, ViewContents, ViewKey, ViewListenerId};

/// In-place edit of a fetched (non-streaming) view.
pub(crate) type ContentEdit = Box<dyn FnOnce(&mut ViewContents) + Send>;

/// Record of an optimistic patch, needed to roll it back.
#[derive(Debug, Default)]
pub(crate) struct OptimisticPatch {
	streaming: Vec<ViewKey>,
	/// Contents of edited fetched views before the edit.
	previous: Vec<(ViewKey, ViewContents)>,
	stamps: Vec<ViewStamp>,
	/// Reducer reset count when the patch was applied.
	resets: u64,
}

impl OptimisticPatch {
	pub(crate) fn touched(&self) -> impl Iterator<Item = &ViewKey> {
		self.stamps.iter().map(|s| &s.key)
	}
}

pub(crate) struct Coherence {
	reducer: Mutex<LocalReducerStore>,
	propagator: CacheCoherencePropagator,
}

impl Coherence {
	pub(crate) fn new(views: &ViewsConfig) -> Self {
		Self {
			reducer: Mutex::new(LocalReducerStore::new(views.toast_capacity)),
			propagator: CacheCoherencePropagator::new(views.coalesce_window()),
		}
	}

	pub(crate) fn propagator(&self) -> &CacheCoherencePropagator {
		&self.propagator
	}

	/// Runs one normalized event through the reducer and the propagator.
	pub(crate) fn ingest(&self, envelope: &Envelope) {
		let changed = {
			let mut reducer = self.reducer.lock();
			let applied = reducer.apply(envelope);
			self.propagator.on_domain_event(envelope, &applied, &reducer)
		};
		self.propagator.notify(&changed);
	}

	pub(crate) fn get_view(&self, key: &ViewKey) -> CachedView {
		let reducer = self.reducer.lock();
		self.propagator.get_view(key, &reducer)
	}

	pub(crate) fn subscribe(&self, key: ViewKey, listener: ViewListener) -> ViewListenerId {
		self.propagator.subscribe(key, listener)
	}

	pub(crate) fn unsubscribe(&self, id: ViewListenerId) -> bool {
		self.propagator.unsubscribe(id)
	}

	pub(crate) fn invalidate_topic(&self, topic: &TopicId) {
		let changed = self.propagator.invalidate_topic(topic);
		self.propagator.notify(&changed);
	}

	pub(crate) fn set_degraded(&self, topic: &TopicId, degraded: bool) {
		let changed = self.propagator.set_degraded(topic, degraded);
		self.propagator.notify(&changed);
	}

	pub(crate) fn install_refetch(&self, ticket: RefetchTicket, result: Result<ViewContents, FetchError>) {
		let installed = {
			let mut reducer = self.reducer.lock();
			self.propagator.install_refetch(ticket, result, &mut reducer)
		};
		if let Some(view) = installed {
			self.propagator.notify(&[view]);
		}
	}

	/// Drops a view and its projection.
	pub(crate) fn evict(&self, key: &ViewKey) {
		let mut reducer = self.reducer.lock();
		reducer.evict(key);
		self.propagator.evict(key);
	}

	pub(crate) fn clear(&self) {
		let mut reducer = self.reducer.lock();
		reducer.clear();
		self.propagator.clear();
	}

	#[cfg(test)]
	pub(crate) fn with_reducer<R>(&self, f: impl FnOnce(&LocalReducerStore) -> R) -> R {
		f(&self.reducer.lock())
	}

	/// Applies an optimistic change.
	///
	/// `f` edits the reducer projections; cached views in `streaming` are then
	/// re-read from the reducer, and each `edits` entry is applied to the
	/// matching fetched view if it is cached.
	pub(crate) fn apply_optimistic<R>(
		&self,
		streaming: &[ViewKey],
		edits: Vec<(ViewKey, ContentEdit)>,
		f: impl FnOnce(&mut LocalReducerStore) -> R,
	) -> (R, OptimisticPatch) {
		let mut patch = OptimisticPatch {
			streaming: streaming.to_vec(),
			..OptimisticPatch::default()
		};
		let (result, changed) = {
			let mut reducer = self.reducer.lock();
			patch.resets = reducer.resets();
			let result = f(&mut reducer);
			let mut changed = self.propagator.sync_from_reducer(streaming, &reducer);
			for (key, edit) in edits {
				if let Some((previous, view)) = self.propagator.modify_contents(&key, edit) {
					patch.previous.push((key, previous));
					changed.push(view);
				}
			}
			patch.stamps = changed.iter().map(|view| ViewStamp {
				key: view.key.clone(),
				version: view.version(),
			}).collect();
			(result, changed)
		};
		self.propagator.notify(&changed);
		(result, patch)
	}

	/// Reverts an optimistic change.
	///
	/// `revert` receives whether every touched view is unchanged since the
	/// patch. If so the views are restored; otherwise they are invalidated so
	/// the server state wins. Returns the unchanged flag.
	///
	/// Nothing is written back if the state was cleared since the patch.
	pub(crate) fn rollback(&self, patch: OptimisticPatch, revert: impl FnOnce(&mut LocalReducerStore, bool)) -> bool {
		let (unchanged, changed) = {
			let mut reducer = self.reducer.lock();
			if reducer.resets() != patch.resets {
				debug!(views = patch.stamps.len(), "state cleared since optimistic patch, skipping rollback");
				return false;
			}
			let unchanged = patch.stamps.iter().all(|stamp| self.propagator.unchanged_since(stamp));
			revert(&mut reducer, unchanged);
			let changed = if unchanged {
				let mut changed = self.propagator.sync_from_reducer(&patch.streaming, &reducer);
				for (key, previous) in patch.previous {
					changed.extend(self.propagator.replace_contents(&key, previous).map(|(_, view)| view));
				}
				changed
			} else {
				patch.stamps.iter().filter_map(|stamp| self.propagator.invalidate(&stamp.key)).collect()
			};
			(unchanged, changed)
		};
		self.propagator.notify(&changed);
		unchanged
	}
}

#[cfg(test)]
mod tests {
	use chrono::Utc;
	use hearth_primitives::{ConversationId, ListingStatus, ListingSummary, PropertyId, UserId};

	use super::*;
	use crate::event::DomainEvent;

	fn listing(status: ListingStatus) -> ListingSummary {
		ListingSummary {
			id: PropertyId::from(7),
			title: "Loft".into(),
			status,
			owner_id: UserId::from("o1"),
			updated_at: Utc::now(),
		}
	}

	fn set_status(status: ListingStatus) -> ContentEdit {
		Box::new(move |contents| {
			if let ViewContents::Listing(Some(listing)) = contents {
				listing.status = status;
			}
		})
	}

	fn coherence_with_record() -> (Coherence, ViewKey) {
		let coherence = Coherence::new(&ViewsConfig::default());
		let key = ViewKey::Listing(PropertyId::from(7));
		coherence.get_view(&key);
		let ticket = coherence.propagator.take_due(tokio::time::Instant::now()).remove(0);
		coherence.install_refetch(ticket, Ok(ViewContents::Listing(Some(listing(ListingStatus::Pending)))));
		(coherence, key)
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn rollback_restores_unchanged_views() {
		let (coherence, key) = coherence_with_record();
		let ((), patch) = coherence.apply_optimistic(&[], vec![(key.clone(), set_status(ListingStatus::Active))], |_| ());
		assert_eq!(coherence.get_view(&key).listing().map(|l| l.status), Some(ListingStatus::Active));

		assert!(coherence.rollback(patch, |_, _| {}));
		let view = coherence.get_view(&key);
		assert_eq!(view.listing().map(|l| l.status), Some(ListingStatus::Pending));
		assert!(!view.is_stale());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn rollback_invalidates_views_changed_since_patch() {
		let (coherence, key) = coherence_with_record();
		let ((), patch) = coherence.apply_optimistic(&[], vec![(key.clone(), set_status(ListingStatus::Active))], |_| ());

		coherence.ingest(&Envelope::new(
			TopicId::moderation_queue(),
			DomainEvent::ListingUpdated {
				listing: listing(ListingStatus::Active),
			},
			Utc::now(),
		));

		assert!(!coherence.rollback(patch, |_, unchanged| assert!(!unchanged)));
		assert!(coherence.get_view(&key).is_stale());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn rollback_after_clear_writes_nothing_back() {
		let (coherence, key) = coherence_with_record();
		let ((), patch) = coherence.apply_optimistic(&[], vec![(key.clone(), set_status(ListingStatus::Active))], |_| ());
		coherence.clear();

		assert!(!coherence.rollback(patch, |_, _| panic!("reverted into cleared state")));
		assert!(coherence.propagator.peek(&key).is_none());
	}

	#[tokio::test(flavor = "current_thread", start_paused = true)]
	async fn evict_drops_view_and_projection() {
		let coherence = Coherence::new(&ViewsConfig::default());
		let key = ViewKey::Transcript(ConversationId::from(42));
		coherence.get_view(&key);
		coherence.evict(&key);
		assert!(coherence.propagator.peek(&key).is_none());
		assert!(!coherence.with_reducer(|r| r.has_projection(&key)));
	}
}
