//! Machine-checkable invariant proofs for the realtime session.

use std::sync::atomic::Ordering;
use std::time::Duration;

use hearth_primitives::{ConversationId, MessageId, Notification, NotificationId, NotificationKind, UserId};
use serde_json::Value;
use tokio::time::Instant;

use super::super::tests::{conv, message_row, settle, start_with, ts};
use super::super::SessionUser;
use crate::dispatch::Action;
use crate::event::{DomainEvent, Envelope};
use crate::payload::RawChange;
use crate::propagate::CacheCoherencePropagator;
use crate::reducer::{LocalReducerStore, UnreadCounter};
use crate::topic::TopicId;
use crate::view::{CachedView, ViewContents, ViewKey};

fn transcript() -> ViewKey {
	ViewKey::Transcript(conv())
}

fn transcript_ids(view: &CachedView) -> Vec<MessageId> {
	view.messages().iter().map(|m| m.id.clone()).collect()
}

fn notification(id: &str) -> Notification {
	Notification {
		id: NotificationId::from(id),
		user_id: UserId::from("u1"),
		kind: NotificationKind::NewMessage,
		title: "New message".into(),
		message: String::new(),
		read: false,
		created_at: ts(),
		data: Value::Null,
	}
}

#[cfg_attr(test, tokio::test(flavor = "current_thread", start_paused = true))]
pub(crate) async fn test_concurrent_open_performs_one_handshake() {
	let fx = start_with(SessionUser::member("u1"), |_, _| {}).await;
	let topic = TopicId::conversation(&conv());
	fx.transport.hold_handshakes();

	let first_conv = conv();
	let (first, second) = tokio::join!(fx.session.open_conversation(&first_conv), async {
		fx.transport.release_handshakes();
		fx.session.open_conversation(&conv()).await
	});
	assert_eq!(first.unwrap().id, second.unwrap().id);
	assert_eq!(fx.transport.subscribe_count(&topic), 1);
	assert_eq!(fx.session.subscription(&topic).map(|s| s.ref_count), Some(2));
}

#[cfg_attr(test, tokio::test(flavor = "current_thread", start_paused = true))]
pub(crate) async fn test_router_drops_stale_generation_changes() {
	let fx = start_with(SessionUser::member("u1"), |_, backend| {
		backend.serve(transcript(), ViewContents::Messages(Vec::new()));
	})
	.await;
	let before = fx.session.open_conversation(&conv()).await.unwrap();
	fx.session.get_view(&transcript());
	fx.transport.drop_channel(&TopicId::conversation(&conv()));
	settle(1_000).await;

	fx.transport.push_to(before.id, RawChange::insert("messages", message_row(1), ts()));
	settle(1).await;
	assert!(fx.session.get_view(&transcript()).messages().is_empty());
}

#[cfg_attr(test, tokio::test(flavor = "current_thread", start_paused = true))]
pub(crate) async fn test_router_preserves_delivery_order() {
	let fx = start_with(SessionUser::member("u1"), |_, backend| {
		backend.serve(transcript(), ViewContents::Messages(Vec::new()));
	})
	.await;
	fx.session.open_conversation(&conv()).await.unwrap();
	fx.session.get_view(&transcript());
	settle(1).await;

	let topic = TopicId::conversation(&conv());
	for id in [3, 1, 2] {
		fx.transport.push(&topic, RawChange::insert("messages", message_row(id), ts()));
	}
	settle(1).await;
	assert_eq!(
		transcript_ids(&fx.session.get_view(&transcript())),
		vec![MessageId::from(3), MessageId::from(1), MessageId::from(2)]
	);
}

#[cfg_attr(test, test)]
pub(crate) fn test_redelivery_is_noop() {
	let mut store = LocalReducerStore::new(10);
	let envelope = Envelope::new(
		TopicId::notifications(&UserId::from("u1")),
		DomainEvent::NotificationCreated {
			notification: notification("n1"),
		},
		ts(),
	);
	store.apply(&envelope);
	store.apply(&envelope);
	assert_eq!(store.feed(&UserId::from("u1")).map(|f| f.len()), Some(1));
	assert_eq!(store.unread(&UserId::from("u1")), 1);
}

#[cfg_attr(test, tokio::test(flavor = "current_thread", start_paused = true))]
pub(crate) async fn test_optimistic_send_and_echo_collapse() {
	let fx = start_with(SessionUser::member("u2"), |_, backend| {
		backend.serve(transcript(), ViewContents::Messages(Vec::new()));
	})
	.await;
	fx.session.open_conversation(&conv()).await.unwrap();
	fx.session.get_view(&transcript());
	settle(1).await;

	let pending = fx
		.session
		.dispatch(Action::SendMessage {
			conversation_id: ConversationId::from(42),
			sender_id: UserId::from("u2"),
			content: "m7".into(),
		})
		.await
		.unwrap();
	assert_eq!(fx.session.get_view(&transcript()).messages().len(), 1);

	let mut echo = message_row(7);
	echo["client_id"] = serde_json::to_value(pending.local_id).unwrap();
	fx.transport.push(&TopicId::conversation(&conv()), RawChange::insert("messages", echo, ts()));
	settle(1).await;

	let view = fx.session.get_view(&transcript());
	assert_eq!(transcript_ids(&view), vec![MessageId::from(7)]);
}

#[cfg_attr(test, test)]
pub(crate) fn test_unread_counter_never_negative() {
	let mut counter = UnreadCounter::default();
	counter.increment();
	counter.decrement(5);
	assert_eq!(counter.get(), 0);

	let mut store = LocalReducerStore::new(10);
	let user = UserId::from("u1");
	store.mark_all_read(&user);
	store.mark_all_read(&user);
	assert_eq!(store.unread(&user), 0);
}

#[cfg_attr(test, tokio::test(flavor = "current_thread", start_paused = true))]
pub(crate) async fn test_resume_invalidates_dependent_views() {
	let fx = start_with(SessionUser::member("u1"), |_, backend| {
		backend.serve(transcript(), ViewContents::Messages(Vec::new()));
	})
	.await;
	fx.session.open_conversation(&conv()).await.unwrap();
	fx.session.get_view(&transcript());
	settle(1).await;
	let version = fx.session.get_view(&transcript()).version();

	fx.transport.drop_channel(&TopicId::conversation(&conv()));
	settle(1_000).await;

	let view = fx.session.get_view(&transcript());
	assert!(view.is_stale());
	assert!(view.version() > version);
}

#[cfg_attr(test, tokio::test(flavor = "current_thread", start_paused = true))]
pub(crate) async fn test_superseded_refetch_is_discarded() {
	let propagator = CacheCoherencePropagator::new(Duration::from_millis(150));
	let mut reducer = LocalReducerStore::new(10);
	let key = ViewKey::ModerationQueue;

	propagator.get_view(&key, &reducer);
	let ticket = propagator.take_due(Instant::now()).remove(0);
	propagator.invalidate(&key);

	let installed = propagator.install_refetch(ticket, Ok(ViewContents::Listings(Vec::new())), &mut reducer);
	assert!(installed.is_none());
	assert!(propagator.get_view(&key, &reducer).is_stale());
}

#[cfg_attr(test, tokio::test(flavor = "current_thread", start_paused = true))]
pub(crate) async fn test_failed_action_restores_unchanged_views() {
	let user = UserId::from("u1");
	let feed = ViewKey::NotificationFeed(user.clone());
	let unread = ViewKey::UnreadCount(user.clone());
	let fx = start_with(SessionUser::member("u1"), |_, backend| {
		backend.serve(feed.clone(), ViewContents::Notifications(vec![notification("n1")]));
		backend.serve(unread.clone(), ViewContents::Count(1));
		backend.reject_mutations.store(true, Ordering::Relaxed);
	})
	.await;
	fx.session.get_view(&feed);
	fx.session.get_view(&unread);
	settle(1).await;

	let result = fx
		.session
		.dispatch(Action::MarkNotificationRead {
			user_id: user.clone(),
			notification_id: NotificationId::from("n1"),
		})
		.await;
	assert!(result.is_err());
	assert_eq!(fx.session.get_view(&unread).count(), Some(1));
	assert!(fx.session.get_view(&feed).notifications()[0].is_unread());
}
