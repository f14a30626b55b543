use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use hearth_primitives::{ListingStatus, ListingSummary, MessageId, PropertyId, Timestamp};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};

use super::*;
use crate::backend::MutationRequest;
use crate::backoff::BackoffConfig;
use crate::error::FetchError;
use crate::payload::RawChange;
use crate::transport::MemoryTransport;
use crate::view::ViewContents;

pub(crate) fn ts() -> Timestamp {
	Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub(crate) fn message_row(id: u64) -> Value {
	json!({
		"id": id,
		"conversation_id": 42,
		"sender_id": "u2",
		"content": format!("m{id}"),
		"created_at": "2026-03-01T12:00:00Z",
	})
}

pub(crate) fn conv() -> ConversationId {
	ConversationId::from(42)
}

/// Mutation and fetch backend serving canned view contents.
#[derive(Default)]
pub(crate) struct FakeBackend {
	pub(crate) views: Mutex<HashMap<ViewKey, ViewContents>>,
	pub(crate) unread: AtomicU64,
	pub(crate) reject_mutations: AtomicBool,
	pub(crate) mutations: Mutex<Vec<MutationRequest>>,
}

impl FakeBackend {
	pub(crate) fn serve(&self, key: ViewKey, contents: ViewContents) {
		self.views.lock().insert(key, contents);
	}
}

#[async_trait]
impl MutationService for FakeBackend {
	async fn mutate(&self, request: MutationRequest) -> Result<(), ActionError> {
		self.mutations.lock().push(request);
		if self.reject_mutations.load(Ordering::Relaxed) {
			return Err(ActionError::Rejected("forbidden".into()));
		}
		Ok(())
	}
}

#[async_trait]
impl ViewFetcher for FakeBackend {
	async fn fetch(&self, key: &ViewKey) -> Result<ViewContents, FetchError> {
		self.views.lock().get(key).cloned().ok_or_else(|| FetchError::Unsupported(key.clone()))
	}

	async fn unread_count(&self, _user: &UserId) -> Result<u64, FetchError> {
		Ok(self.unread.load(Ordering::Relaxed))
	}
}

pub(crate) struct Fixture {
	pub(crate) transport: Arc<MemoryTransport>,
	pub(crate) backend: Arc<FakeBackend>,
	pub(crate) session: RealtimeSession,
}

pub(crate) fn config() -> EngineConfig {
	EngineConfig {
		backoff: BackoffConfig {
			base_delay_ms: 100,
			max_delay_ms: 1_000,
			jitter_factor: 0.0,
			max_retries: 2,
		},
		..EngineConfig::default()
	}
}

pub(crate) async fn start_with(user: SessionUser, prepare: impl FnOnce(&MemoryTransport, &FakeBackend)) -> Fixture {
	let transport = Arc::new(MemoryTransport::new());
	let backend = Arc::new(FakeBackend::default());
	prepare(&transport, &backend);
	let backends = SessionBackends {
		transport: transport.clone(),
		mutations: backend.clone(),
		fetcher: backend.clone(),
	};
	let session = RealtimeSession::start(config(), user, backends).await.unwrap();
	Fixture {
		transport,
		backend,
		session,
	}
}

/// Lets background tasks drain; the paused clock advances by `ms`.
pub(crate) async fn settle(ms: u64) {
	tokio::time::sleep(Duration::from_millis(ms)).await;
}

fn transcript() -> ViewKey {
	ViewKey::Transcript(conv())
}

fn message_ids(view: &CachedView) -> Vec<MessageId> {
	view.messages().iter().map(|m| m.id.clone()).collect()
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn start_subscribes_user_topics() {
	let member = start_with(SessionUser::member("u1"), |_, _| {}).await;
	let topics: Vec<TopicId> = member.session.subscriptions().into_iter().map(|s| s.topic).collect();
	assert_eq!(topics, vec![TopicId::new("conversations:u1"), TopicId::new("notifications:u1")]);

	let admin = start_with(SessionUser::admin("a1"), |_, _| {}).await;
	let queue = admin.session.subscription(&TopicId::moderation_queue()).unwrap();
	assert_eq!(queue.state, SubscriptionState::Active);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn invalid_config_is_rejected() {
	let transport = Arc::new(MemoryTransport::new());
	let backend = Arc::new(FakeBackend::default());
	let mut config = config();
	config.backoff.jitter_factor = 2.0;
	let backends = SessionBackends {
		transport,
		mutations: backend.clone(),
		fetcher: backend,
	};
	let result = RealtimeSession::start(config, SessionUser::member("u1"), backends).await;
	assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn transcript_collapses_duplicate_delivery() {
	let fx = start_with(SessionUser::member("u1"), |_, backend| {
		backend.serve(transcript(), ViewContents::Messages(Vec::new()));
	})
	.await;
	fx.session.open_conversation(&conv()).await.unwrap();
	assert!(fx.session.get_view(&transcript()).is_stale());
	settle(1).await;
	assert!(!fx.session.get_view(&transcript()).is_stale());

	let topic = TopicId::conversation(&conv());
	for id in [1, 1, 2] {
		assert!(fx.transport.push(&topic, RawChange::insert("messages", message_row(id), ts())));
	}
	settle(1).await;

	let view = fx.session.get_view(&transcript());
	assert_eq!(message_ids(&view), vec![MessageId::from(1), MessageId::from(2)]);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn resumed_topic_invalidates_and_refetches_watched_views() {
	let fx = start_with(SessionUser::member("u1"), |_, backend| {
		backend.serve(transcript(), ViewContents::Messages(Vec::new()));
	})
	.await;
	let topic = TopicId::conversation(&conv());
	let before = fx.session.open_conversation(&conv()).await.unwrap();

	let seen = Arc::new(Mutex::new(Vec::new()));
	let sink = seen.clone();
	fx.session.subscribe_to_view(transcript(), move |view| sink.lock().push(view.is_stale()));
	fx.session.get_view(&transcript());
	settle(1).await;
	assert_eq!(*seen.lock(), vec![false]);

	assert!(fx.transport.drop_channel(&topic));
	settle(1_000).await;

	let after = fx.session.subscription(&topic).unwrap();
	assert_eq!(after.state, SubscriptionState::Active);
	assert_eq!(after.id.generation, before.id.generation + 1);
	assert_eq!(*seen.lock(), vec![false, true, false]);

	// Late change from the dropped channel.
	fx.transport.push_to(before.id, RawChange::insert("messages", message_row(9), ts()));
	settle(1).await;
	assert!(fx.session.get_view(&transcript()).messages().is_empty());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn exhausted_reconnect_degrades_and_polls_unread() {
	let notifications = TopicId::notifications(&UserId::from("u1"));
	let fx = start_with(SessionUser::member("u1"), |transport, backend| {
		transport.fail_handshakes(&TopicId::notifications(&UserId::from("u1")), 100);
		backend.unread.store(5, Ordering::Relaxed);
	})
	.await;
	let mut alerts = fx.session.alerts();

	settle(1_000).await;
	assert_eq!(fx.session.subscription(&notifications).map(|s| s.state), Some(SubscriptionState::Closed));
	assert!(*fx.session.degraded().borrow());
	assert_eq!(alerts.try_recv(), Ok(UserAlert::Degraded { topic: notifications.clone() }));

	settle(30_000).await;
	let unread = fx.session.get_view(&ViewKey::UnreadCount(UserId::from("u1")));
	assert_eq!(unread.count(), Some(5));
	assert!(unread.is_degraded());

	fx.transport.fail_handshakes(&notifications, 0);
	assert!(fx.session.reconnect(&notifications));
	settle(1_000).await;
	assert_eq!(alerts.try_recv(), Ok(UserAlert::Recovered { topic: notifications.clone() }));
	assert!(!*fx.session.degraded().borrow());
	assert!(!fx.session.get_view(&ViewKey::UnreadCount(UserId::from("u1"))).is_degraded());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failed_approval_reverts_and_alerts() {
	let listing = ListingSummary {
		id: PropertyId::from(7),
		title: "Loft".into(),
		status: ListingStatus::Pending,
		owner_id: UserId::from("o1"),
		updated_at: ts(),
	};
	let record = ViewKey::Listing(PropertyId::from(7));
	let fx = start_with(SessionUser::admin("a1"), |_, backend| {
		backend.serve(record.clone(), ViewContents::Listing(Some(listing.clone())));
		backend.reject_mutations.store(true, Ordering::Relaxed);
	})
	.await;
	let mut alerts = fx.session.alerts();
	fx.session.get_view(&record);
	settle(1).await;

	let result = fx.session.dispatch(Action::ApproveListing { property_id: PropertyId::from(7) }).await;
	assert_eq!(result, Err(ActionError::Rejected("forbidden".into())));
	assert_eq!(fx.session.get_view(&record).listing().map(|l| l.status), Some(ListingStatus::Pending));
	assert!(matches!(alerts.try_recv(), Ok(UserAlert::ActionFailed { .. })));
	assert!(fx.session.pending_actions().is_empty());
	assert_eq!(fx.backend.mutations.lock().len(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn closing_last_reference_evicts_transcript() {
	let fx = start_with(SessionUser::member("u1"), |_, _| {}).await;
	fx.session.open_conversation(&conv()).await.unwrap();
	let info = fx.session.open_conversation(&conv()).await.unwrap();
	assert_eq!(info.ref_count, 2);
	fx.session.get_view(&transcript());

	assert!(!fx.session.close_conversation(&conv()).await);
	assert!(fx.session.coherence.propagator().peek(&transcript()).is_some());
	assert!(fx.session.close_conversation(&conv()).await);
	assert!(fx.session.coherence.propagator().peek(&transcript()).is_none());
	assert!(fx.transport.active(&TopicId::conversation(&conv())).is_none());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn shutdown_tears_down_everything() {
	let fx = start_with(SessionUser::member("u1"), |_, _| {}).await;
	fx.session.open_conversation(&conv()).await.unwrap();
	fx.session.get_view(&transcript());

	fx.session.shutdown().await;
	assert!(fx.session.subscriptions().is_empty());
	assert!(fx.transport.active(&TopicId::conversation(&conv())).is_none());
	assert!(fx.session.coherence.propagator().cached_keys().is_empty());

	let action = Action::MarkAllNotificationsRead { user_id: UserId::from("u1") };
	assert_eq!(fx.session.dispatch(action).await, Err(ActionError::SessionClosed));
	assert!(matches!(fx.session.open_conversation(&conv()).await, Err(Error::SessionClosed)));
	assert!(fx.backend.mutations.lock().is_empty());
}
