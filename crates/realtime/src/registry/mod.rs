//! Topic subscription registry.
//!
//! Keeps at most one subscription per [`TopicId`], refcounted across
//! callers, and drives its `Connecting → Active → Reconnecting → Closed`
//! lifecycle. Every subscribe attempt gets a fresh [`SubscriptionId`]
//! generation so the router can discard changes delivered on a superseded
//! channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffConfig;
use crate::error::SubscriptionError;
use crate::topic::{Topic, TopicId};
use crate::transport::{RealtimeTransport, SubscribeRequest, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
	/// First handshake in flight.
	Connecting,
	Active,
	/// Channel lost or handshake failed; retrying with backoff.
	Reconnecting,
	/// Retry budget exhausted. Dependent views are degraded until a manual reconnect.
	Closed,
}

impl fmt::Display for SubscriptionState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Connecting => "connecting",
			Self::Active => "active",
			Self::Reconnecting => "reconnecting",
			Self::Closed => "closed",
		})
	}
}

/// Snapshot of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
	pub topic: TopicId,
	pub id: SubscriptionId,
	pub state: SubscriptionState,
	pub retry_count: u32,
	pub ref_count: usize,
}

/// Lifecycle transitions the session reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
	/// First successful handshake.
	Activated { topic: TopicId },
	/// Back to `Active` after a reconnect; dependent views must be invalidated.
	Resumed { topic: TopicId },
	/// Retries exhausted; the subscription is `Closed`.
	Degraded { topic: TopicId, attempts: u32 },
}

struct Subscription {
	topic: Topic,
	id: SubscriptionId,
	state: SubscriptionState,
	retry_count: u32,
	ref_count: usize,
	cancel: CancellationToken,
	/// Flips to true once the first handshake resolved.
	settled: watch::Sender<bool>,
}

impl Subscription {
	fn info(&self) -> SubscriptionInfo {
		SubscriptionInfo {
			topic: self.topic.id.clone(),
			id: self.id,
			state: self.state,
			retry_count: self.retry_count,
			ref_count: self.ref_count,
		}
	}
}

/// Registry indices under one lock.
///
/// `subscriptions` and `id_index` must change together. Slot ids are stable
/// per topic; generations increase on every attempt.
struct RegistryState {
	subscriptions: HashMap<TopicId, Subscription>,
	/// Current subscription id of each live topic.
	id_index: HashMap<SubscriptionId, TopicId>,
	slot_ids: HashMap<TopicId, u32>,
	slot_gens: HashMap<TopicId, u32>,
	next_slot: u32,
}

impl RegistryState {
	fn new() -> Self {
		Self {
			subscriptions: HashMap::new(),
			id_index: HashMap::new(),
			slot_ids: HashMap::new(),
			slot_gens: HashMap::new(),
			next_slot: 0,
		}
	}

	fn slot_for(&mut self, topic: &TopicId) -> u32 {
		if let Some(&slot) = self.slot_ids.get(topic) {
			return slot;
		}
		let slot = self.next_slot;
		self.next_slot += 1;
		self.slot_ids.insert(topic.clone(), slot);
		slot
	}

	/// Mints the id for a new attempt on `topic`.
	fn next_id(&mut self, topic: &TopicId) -> SubscriptionId {
		let slot = self.slot_for(topic);
		let generation = self.slot_gens.get(topic).copied().unwrap_or(0) + 1;
		self.slot_gens.insert(topic.clone(), generation);
		SubscriptionId::new(slot, generation)
	}

	/// Points `topic` at a fresh attempt id, retiring the previous one.
	fn rotate_id(&mut self, topic: &TopicId) -> Option<SubscriptionId> {
		let id = self.next_id(topic);
		let sub = self.subscriptions.get_mut(topic)?;
		let previous = std::mem::replace(&mut sub.id, id);
		self.id_index.remove(&previous);
		self.id_index.insert(id, topic.clone());
		Some(id)
	}

	fn any_closed(&self) -> bool {
		self.subscriptions.values().any(|s| s.state == SubscriptionState::Closed)
	}
}

/// Releases callers joined on a first handshake, also when the leading
/// caller is dropped mid-handshake.
struct HandshakeSettled(watch::Sender<bool>);

impl Drop for HandshakeSettled {
	fn drop(&mut self) {
		self.0.send_replace(true);
	}
}

enum Admission {
	Reused(SubscriptionInfo),
	Join(watch::Receiver<bool>),
	Lead(SubscriptionId, HandshakeSettled),
}

enum AttemptOutcome {
	Active(SubscriptionInfo),
	Failed(SubscriptionInfo),
	/// Torn down or superseded while the handshake was in flight.
	Gone,
}

struct RegistryInner {
	state: Mutex<RegistryState>,
	transport: Arc<dyn RealtimeTransport>,
	backoff: BackoffConfig,
	events: mpsc::UnboundedSender<RegistryEvent>,
	degraded: watch::Sender<bool>,
}

impl RegistryInner {
	fn refresh_degraded(&self, state: &RegistryState) {
		let closed = state.any_closed();
		self.degraded.send_if_modified(|current| {
			let changed = *current != closed;
			*current = closed;
			changed
		});
	}

	fn emit(&self, event: RegistryEvent) {
		if self.events.send(event).is_err() {
			debug!("registry event receiver dropped");
		}
	}

	/// Records the result of a handshake for attempt `id`.
	fn complete_attempt(&self, topic: &TopicId, id: SubscriptionId, result: Result<(), SubscriptionError>) -> AttemptOutcome {
		let mut state = self.state.lock();
		let current = state.subscriptions.get_mut(topic).filter(|sub| sub.id == id);
		let Some(sub) = current else {
			drop(state);
			debug!(topic = %topic, subscription = %id, "handshake completed for retired attempt");
			if result.is_ok() {
				let transport = self.transport.clone();
				tokio::spawn(async move {
					let _ = transport.unsubscribe(id).await;
				});
			}
			return AttemptOutcome::Gone;
		};

		match result {
			Ok(()) => {
				let previous = sub.state;
				sub.state = SubscriptionState::Active;
				sub.retry_count = 0;
				let info = sub.info();
				self.refresh_degraded(&state);
				drop(state);
				if previous == SubscriptionState::Connecting {
					info!(topic = %topic, subscription = %id, "subscription active");
					self.emit(RegistryEvent::Activated { topic: topic.clone() });
				} else {
					info!(topic = %topic, subscription = %id, "subscription resumed");
					self.emit(RegistryEvent::Resumed { topic: topic.clone() });
				}
				AttemptOutcome::Active(info)
			}
			Err(err) => {
				warn!(topic = %topic, subscription = %id, error = %err, "subscribe handshake failed");
				sub.state = SubscriptionState::Reconnecting;
				AttemptOutcome::Failed(sub.info())
			}
		}
	}
}

/// Refcounted topic subscriptions with reconnect and degraded mode.
#[derive(Clone)]
pub struct SubscriptionRegistry {
	inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
	/// Creates a registry and the receiver for its lifecycle events.
	pub fn new(transport: Arc<dyn RealtimeTransport>, backoff: BackoffConfig) -> (Self, mpsc::UnboundedReceiver<RegistryEvent>) {
		let (events, rx) = mpsc::unbounded_channel();
		let registry = Self {
			inner: Arc::new(RegistryInner {
				state: Mutex::new(RegistryState::new()),
				transport,
				backoff,
				events,
				degraded: watch::Sender::new(false),
			}),
		};
		(registry, rx)
	}

	/// Subscribes to `topic`, or adds a reference to the existing subscription.
	///
	/// Only the first caller performs the handshake; concurrent callers wait
	/// for its outcome. A failed handshake is retried in the background; the
	/// returned info then reports `Reconnecting`.
	pub async fn subscribe(&self, topic: Topic) -> Result<SubscriptionInfo, SubscriptionError> {
		let admission = {
			let mut state = self.inner.state.lock();
			if let Some(sub) = state.subscriptions.get_mut(&topic.id) {
				sub.ref_count += 1;
				debug!(topic = %topic.id, refs = sub.ref_count, state = %sub.state, "reusing subscription");
				if sub.state == SubscriptionState::Connecting {
					Admission::Join(sub.settled.subscribe())
				} else {
					Admission::Reused(sub.info())
				}
			} else {
				let id = state.next_id(&topic.id);
				let settled = watch::Sender::new(false);
				state.id_index.insert(id, topic.id.clone());
				state.subscriptions.insert(
					topic.id.clone(),
					Subscription {
						topic: topic.clone(),
						id,
						state: SubscriptionState::Connecting,
						retry_count: 0,
						ref_count: 1,
						cancel: CancellationToken::new(),
						settled: settled.clone(),
					},
				);
				Admission::Lead(id, HandshakeSettled(settled))
			}
		};

		let (id, _settled) = match admission {
			Admission::Reused(info) => return Ok(info),
			Admission::Join(mut settled) => {
				// An error means the subscription was dropped, which `get` reports below.
				let _ = settled.wait_for(|done| *done).await;
				return self.get(&topic.id).ok_or(SubscriptionError::TornDown(topic.id));
			}
			Admission::Lead(id, settled) => (id, settled),
		};

		debug!(topic = %topic.id, subscription = %id, "subscribing");
		let result = self.inner.transport.subscribe(SubscribeRequest::for_topic(id, &topic)).await;
		match self.inner.complete_attempt(&topic.id, id, result) {
			AttemptOutcome::Active(info) => Ok(info),
			AttemptOutcome::Failed(info) => {
				self.spawn_reconnect(&topic.id);
				Ok(info)
			}
			AttemptOutcome::Gone => Err(SubscriptionError::TornDown(topic.id)),
		}
	}

	/// Drops one reference; tears the channel down when none remain.
	///
	/// Returns true if the subscription was torn down.
	pub async fn unsubscribe(&self, topic: &TopicId) -> bool {
		let id = {
			let mut state = self.inner.state.lock();
			let Some(sub) = state.subscriptions.get_mut(topic) else {
				return false;
			};
			sub.ref_count = sub.ref_count.saturating_sub(1);
			if sub.ref_count > 0 {
				return false;
			}
			let Some(sub) = state.subscriptions.remove(topic) else {
				return false;
			};
			state.id_index.remove(&sub.id);
			sub.cancel.cancel();
			self.inner.refresh_degraded(&state);
			sub.id
		};
		debug!(topic = %topic, subscription = %id, "tearing down subscription");
		if let Err(err) = self.inner.transport.unsubscribe(id).await {
			warn!(topic = %topic, subscription = %id, error = %err, "transport unsubscribe failed");
		}
		true
	}

	/// Tears down every subscription regardless of reference counts.
	pub async fn unsubscribe_all(&self) {
		let ids: Vec<(TopicId, SubscriptionId)> = {
			let mut state = self.inner.state.lock();
			state.id_index.clear();
			let drained: Vec<_> = state
				.subscriptions
				.drain()
				.map(|(topic, sub)| {
					sub.cancel.cancel();
					(topic, sub.id)
				})
				.collect();
			self.inner.refresh_degraded(&state);
			drained
		};
		for (topic, id) in ids {
			if let Err(err) = self.inner.transport.unsubscribe(id).await {
				warn!(topic = %topic, subscription = %id, error = %err, "transport unsubscribe failed");
			}
		}
	}

	/// Handles loss of the channel behind `id`. Stale ids are ignored.
	pub fn handle_disconnect(&self, id: SubscriptionId) -> bool {
		let topic = {
			let mut state = self.inner.state.lock();
			let Some(topic) = state.id_index.get(&id).cloned() else {
				debug!(subscription = %id, "disconnect for stale subscription");
				return false;
			};
			let Some(sub) = state.subscriptions.get_mut(&topic) else {
				return false;
			};
			if sub.id != id || sub.state != SubscriptionState::Active {
				return false;
			}
			sub.state = SubscriptionState::Reconnecting;
			sub.retry_count = 0;
			topic
		};
		warn!(topic = %topic, subscription = %id, "subscription dropped, reconnecting");
		self.spawn_reconnect(&topic);
		true
	}

	/// Restarts a `Closed` subscription with a fresh retry budget.
	pub fn reconnect(&self, topic: &TopicId) -> bool {
		{
			let mut state = self.inner.state.lock();
			let Some(sub) = state.subscriptions.get_mut(topic) else {
				return false;
			};
			if sub.state != SubscriptionState::Closed {
				return false;
			}
			sub.state = SubscriptionState::Reconnecting;
			sub.retry_count = 0;
			self.inner.refresh_degraded(&state);
		}
		info!(topic = %topic, "manual reconnect");
		self.spawn_reconnect(topic);
		true
	}

	fn spawn_reconnect(&self, topic: &TopicId) {
		let Some((topic, cancel)) = ({
			let state = self.inner.state.lock();
			state.subscriptions.get(topic).map(|sub| (sub.topic.clone(), sub.cancel.clone()))
		}) else {
			return;
		};
		tokio::spawn(reconnect_loop(self.inner.clone(), topic, cancel));
	}

	/// Whether `id` is the current attempt of a live subscription.
	pub fn is_current(&self, id: SubscriptionId) -> bool {
		let state = self.inner.state.lock();
		state
			.id_index
			.get(&id)
			.and_then(|topic| state.subscriptions.get(topic))
			.is_some_and(|sub| sub.id == id)
	}

	/// Topic served by a current subscription id.
	pub fn topic_for(&self, id: SubscriptionId) -> Option<Topic> {
		let state = self.inner.state.lock();
		let topic = state.id_index.get(&id)?;
		state.subscriptions.get(topic).filter(|sub| sub.id == id).map(|sub| sub.topic.clone())
	}

	pub fn get(&self, topic: &TopicId) -> Option<SubscriptionInfo> {
		self.inner.state.lock().subscriptions.get(topic).map(Subscription::info)
	}

	pub fn state(&self, topic: &TopicId) -> Option<SubscriptionState> {
		self.inner.state.lock().subscriptions.get(topic).map(|sub| sub.state)
	}

	pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
		let mut infos: Vec<_> = self.inner.state.lock().subscriptions.values().map(Subscription::info).collect();
		infos.sort_by(|a, b| a.topic.cmp(&b.topic));
		infos
	}

	/// True while any subscription is `Closed`.
	pub fn degraded(&self) -> watch::Receiver<bool> {
		self.inner.degraded.subscribe()
	}

	pub fn backoff(&self) -> &BackoffConfig {
		&self.inner.backoff
	}
}

/// Retries a subscription until it is active, torn down, or out of budget.
async fn reconnect_loop(inner: Arc<RegistryInner>, topic: Topic, cancel: CancellationToken) {
	loop {
		let attempt = {
			let mut state = inner.state.lock();
			let Some(sub) = state.subscriptions.get_mut(&topic.id) else {
				return;
			};
			if sub.state != SubscriptionState::Reconnecting {
				return;
			}
			if !inner.backoff.can_retry(sub.retry_count) {
				let attempts = sub.retry_count;
				sub.state = SubscriptionState::Closed;
				inner.refresh_degraded(&state);
				drop(state);
				error!(topic = %topic.id, attempts, "subscription closed after exhausting retries, entering degraded mode");
				inner.emit(RegistryEvent::Degraded {
					topic: topic.id.clone(),
					attempts,
				});
				return;
			}
			let attempt = sub.retry_count;
			sub.retry_count += 1;
			attempt
		};

		let delay = inner.backoff.delay_for(attempt);
		debug!(topic = %topic.id, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
		tokio::select! {
			_ = cancel.cancelled() => return,
			_ = tokio::time::sleep(delay) => {}
		}

		let rotated = inner.state.lock().rotate_id(&topic.id);
		let Some(id) = rotated else {
			return;
		};
		warn!(topic = %topic.id, subscription = %id, attempt = attempt + 1, "reconnecting");
		let result = inner.transport.subscribe(SubscribeRequest::for_topic(id, &topic)).await;
		match inner.complete_attempt(&topic.id, id, result) {
			AttemptOutcome::Active(_) | AttemptOutcome::Gone => return,
			AttemptOutcome::Failed(_) => {}
		}
	}
}
