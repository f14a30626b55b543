use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{TimeZone, Utc};
use hearth_primitives::{
	Conversation, ConversationId, ListingStatus, ListingSummary, Message, MessageId, ModerationToast, Notification, NotificationId,
	NotificationKind, PropertyId, Timestamp, UserId,
};
use pretty_assertions::assert_eq;

use super::*;
use crate::event::DomainEvent;

const WINDOW: Duration = Duration::from_millis(150);

fn ts() -> Timestamp {
	Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

fn message(id: &str) -> Message {
	Message {
		id: MessageId::from(id),
		conversation_id: ConversationId::from(42),
		sender_id: UserId::from("u2"),
		content: id.to_owned(),
		created_at: ts(),
		read_at: None,
		client_id: None,
	}
}

fn listing(status: ListingStatus) -> ListingSummary {
	ListingSummary {
		id: PropertyId::from(7),
		title: "Loft".into(),
		status,
		owner_id: UserId::from("o1"),
		updated_at: ts(),
	}
}

fn transcript() -> ViewKey {
	ViewKey::Transcript(ConversationId::from(42))
}

fn inbox() -> ViewKey {
	ViewKey::ConversationList(UserId::from("u1"))
}

struct Harness {
	reducer: LocalReducerStore,
	propagator: CacheCoherencePropagator,
}

impl Harness {
	fn new() -> Self {
		Self {
			reducer: LocalReducerStore::new(10),
			propagator: CacheCoherencePropagator::new(WINDOW),
		}
	}

	fn ingest(&mut self, event: DomainEvent) -> Vec<CachedView> {
		let envelope = Envelope::new(TopicId::new("test"), event, ts());
		let applied = self.reducer.apply(&envelope);
		self.propagator.on_domain_event(&envelope, &applied, &self.reducer)
	}

	fn get(&self, key: &ViewKey) -> CachedView {
		self.propagator.get_view(key, &self.reducer)
	}

	/// Completes every due refetch with `contents`.
	fn refetch_all(&mut self, contents: impl Fn(&ViewKey) -> ViewContents) {
		for ticket in self.propagator.take_due(Instant::now()) {
			let result = Ok(contents(&ticket.key));
			self.propagator.install_refetch(ticket, result, &mut self.reducer);
		}
	}
}

fn inserted(id: &str) -> DomainEvent {
	DomainEvent::MessageInserted {
		conversation_id: ConversationId::from(42),
		message: message(id),
	}
}

fn unread_notification(id: &str) -> Notification {
	Notification {
		id: NotificationId::from(id),
		user_id: UserId::from("u1"),
		kind: NotificationKind::NewMessage,
		title: "New message".into(),
		message: String::new(),
		read: false,
		created_at: ts(),
		data: serde_json::Value::Null,
	}
}

fn noop_listener() -> ViewListener {
	Arc::new(|_: &CachedView| {})
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn first_read_creates_stale_view_and_queues_refetch() {
	let h = Harness::new();
	let view = h.get(&inbox());
	assert!(view.is_stale());
	assert_eq!(view.contents, ViewContents::Empty);
	assert!(h.propagator.is_queued(&inbox()));
	assert_eq!(h.propagator.take_due(Instant::now()).len(), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn streaming_views_are_patched_in_place() {
	let mut h = Harness::new();
	h.get(&transcript());
	h.refetch_all(|_| ViewContents::Messages(vec![message("m0")]));
	let fresh = h.get(&transcript());
	assert!(!fresh.is_stale());

	let changed = h.ingest(inserted("m1"));
	assert_eq!(changed.len(), 1);
	let view = h.get(&transcript());
	assert!(!view.is_stale());
	assert_eq!(view.version(), fresh.version() + 1);
	let ids: Vec<_> = view.messages().iter().map(|m| m.id.to_string()).collect();
	assert_eq!(ids, vec!["m0", "m1"]);

	// Re-delivery leaves the view untouched.
	assert!(h.ingest(inserted("m1")).is_empty());
	assert_eq!(h.get(&transcript()).version(), view.version());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn uncached_views_are_not_created_by_events() {
	let mut h = Harness::new();
	assert!(h.ingest(inserted("m1")).is_empty());
	assert!(h.propagator.cached_keys().is_empty());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn invalidations_within_window_coalesce_into_one_refetch() {
	let mut h = Harness::new();
	h.get(&inbox());
	h.refetch_all(|_| ViewContents::Conversations(Vec::new()));
	h.propagator.subscribe(inbox(), noop_listener());

	h.ingest(inserted("m1"));
	h.ingest(inserted("m2"));
	h.ingest(inserted("m3"));
	assert!(h.get(&inbox()).is_stale());
	assert!(h.propagator.take_due(Instant::now()).is_empty());

	tokio::time::advance(WINDOW).await;
	let due = h.propagator.take_due(Instant::now());
	assert_eq!(due.len(), 1);
	assert_eq!(due[0].key, inbox());
	assert!(!h.propagator.is_queued(&inbox()));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn unwatched_views_refetch_lazily() {
	let mut h = Harness::new();
	h.get(&inbox());
	h.refetch_all(|_| ViewContents::Conversations(Vec::new()));

	h.ingest(inserted("m1"));
	assert!(!h.propagator.is_queued(&inbox()));
	assert!(h.get(&inbox()).is_stale());
	assert!(h.propagator.is_queued(&inbox()));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn superseded_refetch_is_discarded() {
	let mut h = Harness::new();
	h.get(&inbox());
	let ticket = h.propagator.take_due(Instant::now()).remove(0);

	h.propagator.invalidate(&inbox());
	let installed = h
		.propagator
		.install_refetch(ticket, Ok(ViewContents::Conversations(Vec::new())), &mut h.reducer);
	assert!(installed.is_none());
	assert!(h.get(&inbox()).is_stale());
	assert!(h.propagator.is_queued(&inbox()));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn refetch_for_evicted_view_is_dropped() {
	let mut h = Harness::new();
	h.get(&transcript());
	let ticket = h.propagator.take_due(Instant::now()).remove(0);
	assert!(h.propagator.evict(&transcript()));
	let installed = h
		.propagator
		.install_refetch(ticket, Ok(ViewContents::Messages(vec![message("m1")])), &mut h.reducer);
	assert!(installed.is_none());
	assert!(h.propagator.peek(&transcript()).is_none());
	assert!(!h.reducer.has_projection(&transcript()));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn failed_refetch_leaves_view_invalidated() {
	let mut h = Harness::new();
	h.get(&inbox());
	let ticket = h.propagator.take_due(Instant::now()).remove(0);
	let error = FetchError::Failed {
		key: inbox(),
		reason: "timeout".into(),
	};
	assert!(h.propagator.install_refetch(ticket, Err(error), &mut h.reducer).is_none());
	assert!(h.get(&inbox()).is_stale());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn reconnect_invalidates_every_dependent_view() {
	let mut h = Harness::new();
	let user = UserId::from("u1");
	let feed = ViewKey::NotificationFeed(user.clone());
	let unread = ViewKey::UnreadCount(user.clone());
	for key in [&feed, &unread, &inbox()] {
		h.get(key);
	}
	h.refetch_all(|key| match key {
		ViewKey::NotificationFeed(_) => ViewContents::Notifications(Vec::new()),
		ViewKey::UnreadCount(_) => ViewContents::Count(0),
		_ => ViewContents::Conversations(Vec::new()),
	});
	assert!(!h.get(&feed).is_stale());

	let changed = h.propagator.invalidate_topic(&TopicId::notifications(&user));
	assert_eq!(changed.len(), 2);
	assert!(h.get(&feed).is_stale());
	assert!(h.get(&unread).is_stale());
	assert!(!h.get(&inbox()).is_stale());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn conversation_change_invalidates_participant_lists() {
	let mut h = Harness::new();
	h.get(&inbox());
	h.refetch_all(|_| ViewContents::Conversations(Vec::new()));
	let changed = h.ingest(DomainEvent::ConversationChanged {
		conversation: Conversation {
			id: ConversationId::from(42),
			property_id: None,
			buyer_id: UserId::from("u1"),
			seller_id: UserId::from("o1"),
			last_message: Some("hi".into()),
			updated_at: ts(),
		},
	});
	assert_eq!(changed.len(), 1);
	assert!(changed[0].is_stale());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn listing_record_is_patched_and_queue_invalidated() {
	let mut h = Harness::new();
	let record = ViewKey::Listing(PropertyId::from(7));
	h.get(&record);
	h.get(&ViewKey::ModerationQueue);
	h.refetch_all(|key| match key {
		ViewKey::Listing(_) => ViewContents::Listing(Some(listing(ListingStatus::Pending))),
		_ => ViewContents::Listings(vec![listing(ListingStatus::Pending)]),
	});

	h.ingest(DomainEvent::ListingStatusChanged {
		property_id: PropertyId::from(7),
		status: ListingStatus::Active,
		previous: Some(ListingStatus::Pending),
		listing: listing(ListingStatus::Active),
	});
	let view = h.get(&record);
	assert_eq!(view.listing().map(|l| l.status), Some(ListingStatus::Active));
	assert!(!view.is_stale());
	assert!(h.get(&ViewKey::ModerationQueue).is_stale());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn degraded_flag_follows_topic() {
	let h = Harness::new();
	let topic = TopicId::moderation_queue();
	h.get(&ViewKey::ModerationToasts);
	let changed = h.propagator.set_degraded(&topic, true);
	assert_eq!(changed.len(), 1);
	assert!(h.get(&ViewKey::ModerationToasts).is_degraded());
	// Views created while degraded inherit the flag.
	assert!(h.get(&ViewKey::ModerationQueue).is_degraded());
	assert!(h.propagator.set_degraded(&topic, true).is_empty());
	h.propagator.set_degraded(&topic, false);
	assert!(!h.get(&ViewKey::ModerationToasts).is_degraded());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn listeners_receive_changed_views() {
	let mut h = Harness::new();
	let calls = Arc::new(AtomicUsize::new(0));
	let seen = calls.clone();
	h.get(&transcript());
	h.refetch_all(|_| ViewContents::Messages(Vec::new()));
	let id = h.propagator.subscribe(
		transcript(),
		Arc::new(move |view: &CachedView| {
			assert_eq!(view.key, ViewKey::Transcript(ConversationId::from(42)));
			seen.fetch_add(1, Ordering::SeqCst);
		}),
	);

	let changed = h.ingest(inserted("m1"));
	h.propagator.notify(&changed);
	assert_eq!(calls.load(Ordering::SeqCst), 1);

	assert!(h.propagator.unsubscribe(id));
	let changed = h.ingest(inserted("m2"));
	h.propagator.notify(&changed);
	assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn live_count_change_supersedes_refetch_in_flight() {
	let mut h = Harness::new();
	let counter = ViewKey::UnreadCount(UserId::from("u1"));
	let feed = ViewKey::NotificationFeed(UserId::from("u1"));
	h.get(&counter);
	h.get(&feed);
	h.refetch_all(|key| match key {
		ViewKey::UnreadCount(_) => ViewContents::Count(0),
		_ => ViewContents::Notifications(Vec::new()),
	});
	assert_eq!(h.get(&counter).count(), Some(0));

	h.propagator.invalidate(&counter);
	h.get(&counter);
	let ticket = h.propagator.take_due(Instant::now()).remove(0);
	assert_eq!(ticket.key, counter);

	h.ingest(DomainEvent::NotificationCreated {
		notification: unread_notification("n1"),
	});
	assert_eq!(h.get(&counter).count(), Some(1));

	// The fetch started before n1 arrived.
	let installed = h.propagator.install_refetch(ticket, Ok(ViewContents::Count(0)), &mut h.reducer);
	assert!(installed.is_none());
	let view = h.get(&counter);
	assert_eq!(view.count(), Some(1));
	assert_eq!(h.reducer.unread(&UserId::from("u1")), 1);
	assert!(view.is_stale());
	assert_eq!(h.get(&feed).notifications().iter().filter(|n| n.is_unread()).count(), 1);

	tokio::time::advance(WINDOW).await;
	h.refetch_all(|_| ViewContents::Count(1));
	let view = h.get(&counter);
	assert!(!view.is_stale());
	assert_eq!(view.count(), Some(1));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn live_toast_supersedes_refetch_in_flight() {
	let mut h = Harness::new();
	let toasts = ViewKey::ModerationToasts;
	h.get(&toasts);
	h.refetch_all(|_| ViewContents::Toasts(Vec::new()));

	h.propagator.invalidate(&toasts);
	h.get(&toasts);
	let ticket = h.propagator.take_due(Instant::now()).remove(0);

	h.ingest(DomainEvent::ListingSubmitted {
		listing: listing(ListingStatus::Pending),
	});
	let installed = h.propagator.install_refetch(ticket, Ok(ViewContents::Toasts(Vec::new())), &mut h.reducer);
	assert!(installed.is_none());
	assert_eq!(h.get(&toasts).toasts(), &[ModerationToast::for_listing(&listing(ListingStatus::Pending))]);
	assert!(h.reducer.toasts().contains(&PropertyId::from(7)));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn live_message_merges_into_refetch_in_flight() {
	let mut h = Harness::new();
	h.get(&transcript());
	let ticket = h.propagator.take_due(Instant::now()).remove(0);

	h.ingest(inserted("m1"));
	let installed = h
		.propagator
		.install_refetch(ticket, Ok(ViewContents::Messages(vec![message("m0")])), &mut h.reducer);
	let ids: Vec<_> = installed.map(|view| view.messages().iter().map(|m| m.id.to_string()).collect()).unwrap_or_default();
	assert_eq!(ids, vec!["m0", "m1"]);
}
