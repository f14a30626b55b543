//! Realtime session and change-event router.
//!
//! # Purpose
//!
//! - Tie the realtime engine to one logged-in user: start on login, tear everything down on logout.
//! - Own the background tasks that move change events into cached views and keep stale views refetched.
//!
//! # Mental model
//!
//! - [`crate::session::RealtimeSession`] is the integration root. It owns a [`crate::registry::SubscriptionRegistry`],
//!   the reducer/propagator pair and an [`crate::dispatch::ActionDispatcher`].
//! - The router task is the event pump: transport events become [`crate::event::Envelope`]s via
//!   [`crate::normalize::EventNormalizer`] and are applied through the reducer, then fanned out by the
//!   [`crate::propagate::CacheCoherencePropagator`].
//! - The refetch task drains the propagator's coalesced refetch queue against [`crate::backend::ViewFetcher`].
//! - The poll task keeps the unread counter roughly correct while the notifications channel is down.
//!
//! # Key types
//!
//! | Type | Meaning | Constraints | Constructed / mutated in |
//! |---|---|---|---|
//! | [`crate::session::RealtimeSession`] | Per-login engine root | Must be started inside a Tokio runtime | [`crate::session::RealtimeSession::start`] |
//! | [`crate::session::SessionBackends`] | Transport, mutation and fetch collaborators | Transport event stream can be taken once | caller |
//! | [`crate::registry::SubscriptionRegistry`] | One refcounted channel per topic | Must singleflight the handshake per topic | `SubscriptionRegistry::subscribe` |
//! | [`crate::transport::SubscriptionId`] | Slot + generation of a channel attempt | Generation bumps on every reconnect | `RegistryState::next_id`, `RegistryState::rotate_id` |
//! | [`crate::reducer::LocalReducerStore`] | Projections behind streaming views | Apply must be idempotent per entity id | `LocalReducerStore::apply` |
//! | [`crate::view::CachedView`] | Versioned view snapshot | Version bumps on every content or freshness change | propagator |
//! | [`crate::dispatch::PendingAction`] | Optimistic action awaiting its mutation | Carries the `client_id` echoed by the backend | [`crate::dispatch::ActionDispatcher::dispatch`] |
//! | [`crate::dispatch::UserAlert`] | User-visible notice | Only action failures and degraded transitions | router, dispatcher |
//!
//! # Invariants
//!
//! - Must singleflight the subscribe handshake per topic.
//! - Must drop transport events from stale subscription generations.
//! - Must process transport events sequentially in delivery order.
//! - Re-applying an already applied entity must be a no-op.
//! - An optimistic entry and its echo must collapse into exactly one entry.
//! - Unread counters must never go negative.
//! - `Reconnecting -> Active` must invalidate every dependent view.
//! - A refetch result must not overwrite a view invalidated after the fetch started.
//! - A failed action must restore unchanged views and invalidate changed ones.
//! - No lock may be held across a handshake, mutation or fetch.
//!
//! # Data flow
//!
//! - [`crate::session::RealtimeSession::start`] subscribes `notifications:{user}`, `conversations:{user}` and, for
//!   admins, `moderation-queue`. Opening a conversation subscribes `conversation:{id}`.
//! - The transport emits [`crate::transport::TransportEvent`]s; the router consumes them:
//!   - Generation filter: ids not current in the registry are dropped.
//!   - `Change`: normalized against the subscription's topic, then applied and propagated.
//!   - `Dropped`: handed to the registry, which reconnects with backoff.
//!   - `Closed`: stops the router.
//! - Registry lifecycle events are consumed by the same router:
//!   - `Resumed`: dependent views are invalidated and lose their degraded flag.
//!   - `Degraded`: dependent views are flagged and a [`crate::dispatch::UserAlert::Degraded`] is raised.
//! - Invalidations queue coalesced refetches; the refetch task installs results through the epoch check.
//!
//! # Lifecycle
//!
//! - Start: validate config, take the transport event stream, spawn router/refetch/poll tasks, subscribe the user topics.
//! - Running: views are read synchronously with [`crate::session::RealtimeSession::get_view`]; actions go through
//!   [`crate::session::RealtimeSession::dispatch`].
//! - Shutdown: reject new actions, cancel tasks, tear every channel down and clear all cached state.
//!   Dropping a session without shutdown still cancels its tasks.
//!
//! # Concurrency and ordering
//!
//! - Router ordering: a single task applies events in the order received; there is no cross-topic ordering.
//! - Lock order: reducer, then propagator state. Listeners run after both are released.
//! - Refetches run one at a time; a result is installed only if the view's epoch is unchanged.
//!
//! # Failure modes and recovery
//!
//! - Malformed or unexpected change: logged and dropped; the view may lag until the next invalidation.
//! - Channel drop: reconnect with jittered exponential backoff; on exhaustion the topic is `Closed`, its views are
//!   flagged degraded and the unread counter falls back to polling. Recovery: [`crate::session::RealtimeSession::reconnect`].
//! - Refetch failure: logged; the view stays invalidated and is retried on the next read.
//! - Mutation failure: optimistic patch rolled back, alert raised, never retried.
//!
//! # Recipes
//!
//! ## Add a new topic
//!
//! - Add a [`crate::topic::TopicId`] constructor and a [`crate::topic::Topic`] with its table filter.
//! - Teach [`crate::normalize::EventNormalizer`] the table's row shapes.
//! - Map the new events to view effects in `propagate::plan`.
//!
//! ## Add a new action
//!
//! - Add an [`crate::dispatch::Action`] variant and its [`crate::backend::ActionKind`].
//! - Build its optimistic patch in `ActionDispatcher::apply_optimistic` with a matching
//!   [`crate::dispatch::RollbackSnapshot`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use hearth_primitives::{ConversationId, UserId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::backend::{MutationService, ViewFetcher};
use crate::coherence::Coherence;
use crate::config::EngineConfig;
use crate::dispatch::{Action, ActionDispatcher, PendingAction, UserAlert};
use crate::error::ActionError;
use crate::event::{DomainEvent, Envelope};
use crate::normalize::EventNormalizer;
use crate::registry::{RegistryEvent, SubscriptionInfo, SubscriptionRegistry, SubscriptionState};
use crate::topic::{Topic, TopicId};
use crate::transport::{RealtimeTransport, TransportEvent};
use crate::view::{CachedView, ViewKey, ViewListenerId};
use crate::{Error, Result};

const ALERT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
	Member,
	/// Also receives the moderation queue.
	Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
	pub id: UserId,
	pub role: Role,
}

impl SessionUser {
	pub fn member(id: impl Into<UserId>) -> Self {
		Self {
			id: id.into(),
			role: Role::Member,
		}
	}

	pub fn admin(id: impl Into<UserId>) -> Self {
		Self {
			id: id.into(),
			role: Role::Admin,
		}
	}

	pub fn is_admin(&self) -> bool {
		self.role == Role::Admin
	}
}

/// External collaborators of a session.
#[derive(Clone)]
pub struct SessionBackends {
	pub transport: Arc<dyn RealtimeTransport>,
	pub mutations: Arc<dyn MutationService>,
	pub fetcher: Arc<dyn ViewFetcher>,
}

/// Realtime engine for one logged-in user.
pub struct RealtimeSession {
	user: SessionUser,
	coherence: Arc<Coherence>,
	registry: SubscriptionRegistry,
	dispatcher: ActionDispatcher,
	alerts: broadcast::Sender<UserAlert>,
	cancel: CancellationToken,
	tasks: Mutex<Vec<JoinHandle<()>>>,
	closed: AtomicBool,
}

impl RealtimeSession {
	/// Starts the engine for `user` and subscribes the user's topics.
	///
	/// Must be called from within a Tokio runtime.
	pub async fn start(config: EngineConfig, user: SessionUser, backends: SessionBackends) -> Result<Self> {
		if tokio::runtime::Handle::try_current().is_err() {
			return Err(Error::NoRuntime);
		}
		config.validate()?;

		let transport_events = backends.transport.subscribe_events()?;
		let (registry, registry_events) = SubscriptionRegistry::new(backends.transport.clone(), config.backoff.clone());
		let coherence = Arc::new(Coherence::new(&config.views));
		let (alerts, _) = broadcast::channel(ALERT_CAPACITY);
		let dispatcher = ActionDispatcher::new(coherence.clone(), backends.mutations.clone(), alerts.clone());
		let cancel = CancellationToken::new();

		let router = Router {
			registry: registry.clone(),
			coherence: coherence.clone(),
			alerts: alerts.clone(),
		};
		let tasks = vec![
			tokio::spawn(router.run(transport_events, registry_events, cancel.clone())),
			tokio::spawn(refetch_loop(coherence.clone(), backends.fetcher.clone(), cancel.clone())),
			tokio::spawn(poll_unread(
				registry.clone(),
				coherence.clone(),
				backends.fetcher.clone(),
				user.id.clone(),
				config.polling.interval(),
				cancel.clone(),
			)),
		];

		let session = Self {
			user,
			coherence,
			registry,
			dispatcher,
			alerts,
			cancel,
			tasks: Mutex::new(tasks),
			closed: AtomicBool::new(false),
		};

		session.registry.subscribe(Topic::notifications(&session.user.id)).await?;
		session.registry.subscribe(Topic::conversations(&session.user.id)).await?;
		if session.user.is_admin() {
			session.registry.subscribe(Topic::moderation_queue()).await?;
		}
		info!(user = %session.user.id, role = ?session.user.role, "realtime session started");
		Ok(session)
	}

	pub fn user(&self) -> &SessionUser {
		&self.user
	}

	/// Subscribes the live channel of a conversation transcript.
	pub async fn open_conversation(&self, id: &ConversationId) -> Result<SubscriptionInfo> {
		self.ensure_open()?;
		Ok(self.registry.subscribe(Topic::conversation(id, &self.user.id)).await?)
	}

	/// Releases a conversation; the transcript is dropped once no one holds it.
	pub async fn close_conversation(&self, id: &ConversationId) -> bool {
		let torn_down = self.registry.unsubscribe(&TopicId::conversation(id)).await;
		if torn_down {
			self.coherence.evict(&ViewKey::Transcript(id.clone()));
		}
		torn_down
	}

	/// Current snapshot of a view. Never blocks; a stale view is refetched in the background.
	pub fn get_view(&self, key: &ViewKey) -> CachedView {
		self.coherence.get_view(key)
	}

	pub fn subscribe_to_view(&self, key: ViewKey, listener: impl Fn(&CachedView) + Send + Sync + 'static) -> ViewListenerId {
		self.coherence.subscribe(key, Arc::new(listener))
	}

	pub fn unsubscribe_from_view(&self, id: ViewListenerId) -> bool {
		self.coherence.unsubscribe(id)
	}

	pub async fn dispatch(&self, action: Action) -> Result<PendingAction, ActionError> {
		self.dispatcher.dispatch(action).await
	}

	pub fn pending_actions(&self) -> Vec<PendingAction> {
		self.dispatcher.pending_actions()
	}

	pub fn alerts(&self) -> broadcast::Receiver<UserAlert> {
		self.alerts.subscribe()
	}

	/// True while any topic has exhausted its reconnect budget.
	pub fn degraded(&self) -> watch::Receiver<bool> {
		self.registry.degraded()
	}

	pub fn subscription(&self, topic: &TopicId) -> Option<SubscriptionInfo> {
		self.registry.get(topic)
	}

	pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
		self.registry.subscriptions()
	}

	/// Retries a `Closed` topic with a fresh retry budget.
	pub fn reconnect(&self, topic: &TopicId) -> bool {
		self.registry.reconnect(topic)
	}

	/// Tears the session down. Further actions fail with [`ActionError::SessionClosed`].
	pub async fn shutdown(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		self.dispatcher.close();
		self.cancel.cancel();
		self.registry.unsubscribe_all().await;
		self.coherence.clear();

		let tasks = std::mem::take(&mut *self.tasks.lock());
		for task in tasks {
			if let Err(err) = task.await
				&& err.is_panic()
			{
				error!(user = %self.user.id, error = %err, "session task panicked");
			}
		}
		info!(user = %self.user.id, "realtime session shut down");
	}

	fn ensure_open(&self) -> Result<()> {
		if self.closed.load(Ordering::Acquire) {
			return Err(Error::SessionClosed);
		}
		Ok(())
	}
}

impl Drop for RealtimeSession {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

/// Event pump from the transport and the registry into the views.
struct Router {
	registry: SubscriptionRegistry,
	coherence: Arc<Coherence>,
	alerts: broadcast::Sender<UserAlert>,
}

impl Router {
	async fn run(
		self,
		mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
		mut registry_events: mpsc::UnboundedReceiver<RegistryEvent>,
		cancel: CancellationToken,
	) {
		loop {
			tokio::select! {
				biased;
				() = cancel.cancelled() => break,
				Some(event) = registry_events.recv() => self.on_registry_event(event),
				event = transport_events.recv() => {
					let Some(event) = event else {
						warn!("transport event stream ended");
						break;
					};
					if !self.on_transport_event(event) {
						break;
					}
				}
			}
		}
		debug!("session router stopped");
	}

	/// Returns false once the transport is closed.
	fn on_transport_event(&self, event: TransportEvent) -> bool {
		match event {
			TransportEvent::Change { subscription, change } => {
				let Some(topic) = self.registry.topic_for(subscription) else {
					debug!(subscription = %subscription, "dropping change from stale subscription");
					return true;
				};
				if let Some(envelope) = EventNormalizer::normalize(&topic, &change) {
					trace!(topic = %topic.id, event = envelope.event.name(), "routing event");
					self.coherence.ingest(&envelope);
				}
			}
			TransportEvent::Dropped { subscription, reason } => {
				if !self.registry.handle_disconnect(subscription) {
					debug!(subscription = %subscription, reason = %reason, "ignoring drop of stale subscription");
				}
			}
			TransportEvent::Closed => {
				warn!("transport closed");
				return false;
			}
		}
		true
	}

	fn on_registry_event(&self, event: RegistryEvent) {
		match event {
			RegistryEvent::Activated { topic } => trace!(topic = %topic, "topic live"),
			RegistryEvent::Resumed { topic } => {
				let recovered = self.coherence.propagator().is_degraded(&topic);
				self.coherence.set_degraded(&topic, false);
				self.coherence.invalidate_topic(&topic);
				if recovered {
					info!(topic = %topic, "topic recovered from degraded mode");
					let _ = self.alerts.send(UserAlert::Recovered { topic });
				}
			}
			RegistryEvent::Degraded { topic, attempts } => {
				error!(topic = %topic, attempts, "live updates unavailable, views degraded");
				self.coherence.set_degraded(&topic, true);
				let _ = self.alerts.send(UserAlert::Degraded { topic });
			}
		}
	}
}

/// Drains due refetches one at a time.
async fn refetch_loop(coherence: Arc<Coherence>, fetcher: Arc<dyn ViewFetcher>, cancel: CancellationToken) {
	let propagator = coherence.propagator();
	loop {
		let deadline = propagator.next_deadline();
		tokio::select! {
			() = cancel.cancelled() => break,
			() = propagator.queued() => {}
			() = sleep_until(deadline) => {}
		}

		for ticket in propagator.take_due(Instant::now()) {
			trace!(view = %ticket.key, "refetching view");
			let result = tokio::select! {
				() = cancel.cancelled() => return,
				result = fetcher.fetch(&ticket.key) => result,
			};
			coherence.install_refetch(ticket, result);
		}
	}
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline).await,
		None => std::future::pending().await,
	}
}

/// Polls the unread count while the notifications channel is `Closed`.
async fn poll_unread(
	registry: SubscriptionRegistry,
	coherence: Arc<Coherence>,
	fetcher: Arc<dyn ViewFetcher>,
	user: UserId,
	interval: Duration,
	cancel: CancellationToken,
) {
	let topic = TopicId::notifications(&user);
	let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

	loop {
		tokio::select! {
			() = cancel.cancelled() => break,
			_ = ticker.tick() => {}
		}
		if registry.state(&topic) != Some(SubscriptionState::Closed) {
			continue;
		}

		let result = tokio::select! {
			() = cancel.cancelled() => break,
			result = fetcher.unread_count(&user) => result,
		};
		match result {
			Ok(count) => {
				debug!(user = %user, count, "polled unread count");
				let event = DomainEvent::UnreadCountSynced {
					user_id: user.clone(),
					count,
				};
				coherence.ingest(&Envelope::new(topic.clone(), event, Utc::now()));
			}
			Err(err) => warn!(user = %user, error = %err, "unread count poll failed"),
		}
	}
}

pub(crate) mod invariants;

#[cfg(test)]
mod tests;
