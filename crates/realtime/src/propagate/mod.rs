//! Cache coherence propagation.
//!
//! [`CacheCoherencePropagator`] owns every [`CachedView`]. For each domain
//! event it patches the dependent views whose change is additive or an exact
//! record replacement, and invalidates the ones whose membership or order may
//! change. Invalidations are coalesced: a view already queued for refetch is
//! not queued again, and watched views wait one coalescing window before the
//! refetch runs so a burst of events costs a single fetch.
//!
//! Each view carries a [`ViewEpoch`] bumped on invalidation, and on any patch
//! to a view whose refetch replaces rather than merges (records, counters,
//! toasts). A refetch is tagged with the epoch it was started under and
//! installed only if nothing superseded it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::FetchError;
use crate::event::Envelope;
use crate::reducer::{Applied, ApplyOutcome, LocalReducerStore};
use crate::topic::TopicId;
use crate::view::{CachedView, FreshnessState, ViewContents, ViewKey, ViewListenerId};

mod plan;

pub use plan::{Effect, plan, record_patch};

/// Callback invoked with the new state of a watched view.
pub type ViewListener = Arc<dyn Fn(&CachedView) + Send + Sync>;

/// Invalidation generation of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ViewEpoch(u64);

impl ViewEpoch {
	fn next(self) -> Self {
		Self(self.0.wrapping_add(1))
	}
}

/// A refetch ready to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefetchTicket {
	pub key: ViewKey,
	pub epoch: ViewEpoch,
}

/// Version of a view right after an optimistic patch, used to detect later changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewStamp {
	pub key: ViewKey,
	pub version: u64,
}

struct ViewSlot {
	view: CachedView,
	epoch: ViewEpoch,
}

#[derive(Default)]
struct PropagatorState {
	views: HashMap<ViewKey, ViewSlot>,
	/// Pending refetches and the instant each becomes due.
	queue: HashMap<ViewKey, Instant>,
	degraded: HashSet<TopicId>,
	listeners: HashMap<ViewListenerId, (ViewKey, ViewListener)>,
	next_listener: u64,
}

impl PropagatorState {
	fn watched(&self, key: &ViewKey) -> bool {
		self.listeners.values().any(|(k, _)| k == key)
	}

	fn cached_keys(&self) -> Vec<ViewKey> {
		self.views.keys().cloned().collect()
	}

	/// Marks a view stale and schedules its refetch if anyone watches it.
	fn invalidate(&mut self, key: &ViewKey, due: Instant) -> Option<CachedView> {
		let watched = self.watched(key);
		let slot = self.views.get_mut(key)?;
		slot.epoch = slot.epoch.next();
		slot.view.freshness.state = FreshnessState::Invalidated;
		slot.view.freshness.version += 1;
		let view = slot.view.clone();

		if self.queue.contains_key(key) {
			debug!(view = %key, "invalidation coalesced");
		} else if watched {
			self.queue.insert(key.clone(), due);
		}
		Some(view)
	}

	fn set_contents(&mut self, key: &ViewKey, contents: ViewContents) -> Option<CachedView> {
		let slot = self.views.get_mut(key)?;
		// A refetch in flight would overwrite this change when it lands.
		if !key.merges_refetch() {
			slot.epoch = slot.epoch.next();
		}
		slot.view.contents = contents;
		slot.view.freshness.version += 1;
		Some(slot.view.clone())
	}
}

pub struct CacheCoherencePropagator {
	state: Mutex<PropagatorState>,
	window: Duration,
	wake: Notify,
}

impl CacheCoherencePropagator {
	pub fn new(window: Duration) -> Self {
		Self {
			state: Mutex::new(PropagatorState::default()),
			window,
			wake: Notify::new(),
		}
	}

	pub fn coalesce_window(&self) -> Duration {
		self.window
	}

	/// Fans out one event that the reducer already applied.
	///
	/// Returns the views that changed; pass them to [`CacheCoherencePropagator::notify`]
	/// once every lock is released.
	pub fn on_domain_event(&self, envelope: &Envelope, applied: &[Applied], reducer: &LocalReducerStore) -> Vec<CachedView> {
		let mut state = self.state.lock();
		let effects = plan(&envelope.event, &state.cached_keys());
		let due = Instant::now() + self.window;
		let mut changed = Vec::new();
		let mut scheduled = false;

		for effect in effects {
			match effect {
				Effect::Patch(key) if key.is_streaming() => {
					let outcome = applied.iter().find(|a| a.key == key).map(|a| a.outcome);
					match outcome {
						Some(outcome) if outcome.changed() => match reducer.snapshot(&key) {
							Some(contents) => {
								trace!(view = %key, event = envelope.event.name(), "patching view");
								changed.extend(state.set_contents(&key, contents));
							}
							None => {
								scheduled = true;
								changed.extend(state.invalidate(&key, due));
							}
						},
						Some(ApplyOutcome::Ignored) => {
							scheduled = true;
							changed.extend(state.invalidate(&key, due));
						}
						_ => {}
					}
				}
				Effect::Patch(key) => match record_patch(&envelope.event, &key) {
					Some(contents) => changed.extend(state.set_contents(&key, contents)),
					None => {
						scheduled = true;
						changed.extend(state.invalidate(&key, due));
					}
				},
				Effect::Invalidate(key) => {
					scheduled = true;
					changed.extend(state.invalidate(&key, due));
				}
			}
		}
		drop(state);

		if scheduled {
			self.wake.notify_one();
		}
		changed
	}

	/// Invalidates a single view.
	pub fn invalidate(&self, key: &ViewKey) -> Option<CachedView> {
		let view = self.state.lock().invalidate(key, Instant::now() + self.window);
		self.wake.notify_one();
		view
	}

	/// Invalidates every cached view fed by `topic`.
	pub fn invalidate_topic(&self, topic: &TopicId) -> Vec<CachedView> {
		let mut state = self.state.lock();
		let due = Instant::now() + self.window;
		let keys: Vec<ViewKey> = state.views.keys().filter(|k| k.depends_on(topic)).cloned().collect();
		let changed: Vec<CachedView> = keys.iter().filter_map(|key| state.invalidate(key, due)).collect();
		drop(state);
		debug!(topic = %topic, views = changed.len(), "invalidated dependent views");
		self.wake.notify_one();
		changed
	}

	/// Flags every view fed by `topic` as degraded (or recovered).
	pub fn set_degraded(&self, topic: &TopicId, degraded: bool) -> Vec<CachedView> {
		let mut state = self.state.lock();
		let toggled = if degraded {
			state.degraded.insert(topic.clone())
		} else {
			state.degraded.remove(topic)
		};
		if !toggled {
			return Vec::new();
		}
		state
			.views
			.values_mut()
			.filter(|slot| slot.view.key.depends_on(topic))
			.map(|slot| {
				slot.view.freshness.degraded = degraded;
				slot.view.clone()
			})
			.collect()
	}

	pub fn is_degraded(&self, topic: &TopicId) -> bool {
		self.state.lock().degraded.contains(topic)
	}

	/// Returns a view, creating it on first read.
	///
	/// A stale view not yet queued is scheduled for an immediate refetch.
	pub fn get_view(&self, key: &ViewKey, reducer: &LocalReducerStore) -> CachedView {
		let mut state = self.state.lock();
		let degraded = state.degraded.contains(&key.topic());
		let slot = state.views.entry(key.clone()).or_insert_with(|| {
			let contents = reducer.snapshot(key).unwrap_or(ViewContents::Empty);
			let mut view = CachedView::new(key.clone(), contents);
			view.freshness.degraded = degraded;
			ViewSlot {
				view,
				epoch: ViewEpoch::default(),
			}
		});
		let view = slot.view.clone();

		let wake = view.is_stale() && !state.queue.contains_key(key);
		if wake {
			state.queue.insert(key.clone(), Instant::now());
		}
		drop(state);
		if wake {
			self.wake.notify_one();
		}
		view
	}

	/// Current state of a cached view without creating it.
	pub fn peek(&self, key: &ViewKey) -> Option<CachedView> {
		self.state.lock().views.get(key).map(|slot| slot.view.clone())
	}

	pub fn version(&self, key: &ViewKey) -> Option<u64> {
		self.state.lock().views.get(key).map(|slot| slot.view.freshness.version)
	}

	pub fn cached_keys(&self) -> Vec<ViewKey> {
		self.state.lock().cached_keys()
	}

	/// Registers a listener for a view; a stale view gets its refetch scheduled.
	pub fn subscribe(&self, key: ViewKey, listener: ViewListener) -> ViewListenerId {
		let mut state = self.state.lock();
		let id = ViewListenerId(state.next_listener);
		state.next_listener += 1;
		let stale = state.views.get(&key).is_some_and(|slot| slot.view.is_stale());
		if stale && !state.queue.contains_key(&key) {
			state.queue.insert(key.clone(), Instant::now());
			self.wake.notify_one();
		}
		state.listeners.insert(id, (key, listener));
		id
	}

	pub fn unsubscribe(&self, id: ViewListenerId) -> bool {
		self.state.lock().listeners.remove(&id).is_some()
	}

	/// Pops every refetch due at `now`.
	pub fn take_due(&self, now: Instant) -> Vec<RefetchTicket> {
		let mut state = self.state.lock();
		let due: Vec<ViewKey> = state.queue.iter().filter(|(_, at)| **at <= now).map(|(k, _)| k.clone()).collect();
		due.into_iter()
			.filter_map(|key| {
				state.queue.remove(&key);
				let epoch = state.views.get(&key)?.epoch;
				Some(RefetchTicket { key, epoch })
			})
			.collect()
	}

	/// Earliest pending refetch deadline.
	pub fn next_deadline(&self) -> Option<Instant> {
		self.state.lock().queue.values().min().copied()
	}

	pub fn is_queued(&self, key: &ViewKey) -> bool {
		self.state.lock().queue.contains_key(key)
	}

	/// Resolves once something was queued since the last call.
	pub async fn queued(&self) {
		self.wake.notified().await;
	}

	/// Installs a refetch result if the view is still live and not superseded.
	pub fn install_refetch(
		&self,
		ticket: RefetchTicket,
		result: Result<ViewContents, FetchError>,
		reducer: &mut LocalReducerStore,
	) -> Option<CachedView> {
		let RefetchTicket { key, epoch } = ticket;
		let mut state = self.state.lock();
		let Some(slot) = state.views.get(&key) else {
			debug!(view = %key, "dropping refetch for evicted view");
			return None;
		};
		if slot.epoch != epoch {
			debug!(view = %key, "refetch superseded by newer invalidation");
			if !state.queue.contains_key(&key) {
				state.queue.insert(key, Instant::now() + self.window);
				drop(state);
				self.wake.notify_one();
			}
			return None;
		}

		let contents = match result {
			Ok(contents) if contents.fits(&key) => contents,
			Ok(_) => {
				warn!(view = %key, "refetch returned contents of the wrong shape");
				return None;
			}
			Err(error) => {
				warn!(view = %key, error = %error, "refetch failed, view stays invalidated");
				return None;
			}
		};

		let contents = if key.is_streaming() {
			reducer.reseed(&key, contents);
			reducer.snapshot(&key).unwrap_or(ViewContents::Empty)
		} else {
			contents
		};

		let slot = state.views.get_mut(&key)?;
		slot.view.contents = contents;
		slot.view.freshness.state = FreshnessState::Fresh;
		slot.view.freshness.version += 1;
		slot.view.freshness.updated_at = Some(Utc::now());
		trace!(view = %key, version = slot.view.freshness.version, "refetch installed");
		Some(slot.view.clone())
	}

	/// Re-reads streaming views from the reducer after a local patch.
	pub fn sync_from_reducer(&self, keys: &[ViewKey], reducer: &LocalReducerStore) -> Vec<CachedView> {
		let mut state = self.state.lock();
		keys.iter()
			.filter_map(|key| {
				let contents = reducer.snapshot(key)?;
				state.set_contents(key, contents)
			})
			.collect()
	}

	/// Replaces a record view's contents, returning the previous ones.
	pub fn replace_contents(&self, key: &ViewKey, contents: ViewContents) -> Option<(ViewContents, CachedView)> {
		let mut state = self.state.lock();
		let slot = state.views.get_mut(key)?;
		slot.epoch = slot.epoch.next();
		let previous = std::mem::replace(&mut slot.view.contents, contents);
		slot.view.freshness.version += 1;
		Some((previous, slot.view.clone()))
	}

	/// Applies `f` to a list view's contents in place.
	pub fn modify_contents(&self, key: &ViewKey, f: impl FnOnce(&mut ViewContents)) -> Option<(ViewContents, CachedView)> {
		let mut state = self.state.lock();
		let slot = state.views.get_mut(key)?;
		slot.epoch = slot.epoch.next();
		let previous = slot.view.contents.clone();
		f(&mut slot.view.contents);
		slot.view.freshness.version += 1;
		Some((previous, slot.view.clone()))
	}

	pub fn stamp(&self, key: &ViewKey) -> Option<ViewStamp> {
		self.version(key).map(|version| ViewStamp { key: key.clone(), version })
	}

	/// Whether a view is unchanged since `stamp` (or no longer cached).
	pub fn unchanged_since(&self, stamp: &ViewStamp) -> bool {
		self.version(&stamp.key).is_none_or(|v| v == stamp.version)
	}

	pub fn evict(&self, key: &ViewKey) -> bool {
		let mut state = self.state.lock();
		state.queue.remove(key);
		state.views.remove(key).is_some()
	}

	/// Drops every view, pending refetch and listener.
	pub fn clear(&self) {
		let mut state = self.state.lock();
		state.views.clear();
		state.queue.clear();
		state.degraded.clear();
		state.listeners.clear();
	}

	/// Invokes listeners for changed views. Must be called without holding any engine lock.
	pub fn notify(&self, changed: &[CachedView]) {
		if changed.is_empty() {
			return;
		}
		let mut calls: Vec<(ViewListener, CachedView)> = Vec::new();
		{
			let state = self.state.lock();
			for view in changed {
				for (key, listener) in state.listeners.values() {
					if *key == view.key {
						calls.push((Arc::clone(listener), view.clone()));
					}
				}
			}
		}
		for (listener, view) in calls {
			listener(&view);
		}
	}
}

#[cfg(test)]
mod tests;
