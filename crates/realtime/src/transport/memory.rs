//! In-process transport.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use super::{RealtimeTransport, SubscribeRequest, SubscriptionId, TransportEvent};
use crate::error::SubscriptionError;
use crate::payload::RawChange;
use crate::topic::TopicId;

#[derive(Default)]
struct MemoryState {
	/// Open subscriptions and the topic each one serves.
	active: HashMap<SubscriptionId, TopicId>,
	/// Remaining handshakes to reject, per topic.
	failures: HashMap<TopicId, u32>,
	/// Subscribe attempts seen, per topic.
	attempts: HashMap<TopicId, usize>,
	requests: Vec<SubscribeRequest>,
}

/// Transport backed by in-memory channels.
///
/// Changes are injected with [`MemoryTransport::push`]; channel loss and
/// handshake failures can be simulated per topic.
pub struct MemoryTransport {
	tx: mpsc::UnboundedSender<TransportEvent>,
	rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
	state: Mutex<MemoryState>,
	held: watch::Sender<bool>,
}

impl Default for MemoryTransport {
	fn default() -> Self {
		Self::new()
	}
}

impl MemoryTransport {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		Self {
			tx,
			rx: Mutex::new(Some(rx)),
			state: Mutex::new(MemoryState::default()),
			held: watch::Sender::new(false),
		}
	}

	/// Delivers a change on the current subscription for `topic`.
	///
	/// Returns false when the topic has no open subscription.
	pub fn push(&self, topic: &TopicId, change: RawChange) -> bool {
		let Some(subscription) = self.active(topic) else {
			return false;
		};
		self.push_to(subscription, change)
	}

	/// Delivers a change tagged with an explicit subscription id, open or not.
	pub fn push_to(&self, subscription: SubscriptionId, change: RawChange) -> bool {
		trace!(subscription = %subscription, table = %change.table, "memory transport push");
		self.tx.send(TransportEvent::Change { subscription, change }).is_ok()
	}

	/// Simulates loss of the channel serving `topic`.
	pub fn drop_channel(&self, topic: &TopicId) -> bool {
		let id = {
			let mut state = self.state.lock();
			let Some(id) = state.active.iter().find(|(_, t)| *t == topic).map(|(id, _)| *id) else {
				return false;
			};
			state.active.remove(&id);
			id
		};
		self.tx
			.send(TransportEvent::Dropped {
				subscription: id,
				reason: "connection reset".into(),
			})
			.is_ok()
	}

	/// Rejects the next `count` handshakes for `topic`.
	pub fn fail_handshakes(&self, topic: &TopicId, count: u32) {
		self.state.lock().failures.insert(topic.clone(), count);
	}

	/// Holds every handshake until [`MemoryTransport::release_handshakes`].
	pub fn hold_handshakes(&self) {
		self.held.send_replace(true);
	}

	pub fn release_handshakes(&self) {
		self.held.send_replace(false);
	}

	/// Open subscription serving `topic`, if any.
	pub fn active(&self, topic: &TopicId) -> Option<SubscriptionId> {
		self.state.lock().active.iter().filter(|(_, t)| *t == topic).map(|(id, _)| *id).max()
	}

	/// Number of subscribe attempts made for `topic`.
	pub fn subscribe_count(&self, topic: &TopicId) -> usize {
		self.state.lock().attempts.get(topic).copied().unwrap_or(0)
	}

	/// Every subscribe request received, in order.
	pub fn requests(&self) -> Vec<SubscribeRequest> {
		self.state.lock().requests.clone()
	}

	/// Ends the event stream.
	pub fn close(&self) {
		let _ = self.tx.send(TransportEvent::Closed);
	}
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
	fn subscribe_events(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, SubscriptionError> {
		self.rx.lock().take().ok_or_else(|| SubscriptionError::Unavailable("event stream already taken".into()))
	}

	async fn subscribe(&self, request: SubscribeRequest) -> Result<(), SubscriptionError> {
		{
			let mut state = self.state.lock();
			*state.attempts.entry(request.topic.clone()).or_default() += 1;
			state.requests.push(request.clone());
		}

		let mut held = self.held.subscribe();
		if held.wait_for(|held| !*held).await.is_err() {
			return Err(SubscriptionError::Unavailable("transport dropped".into()));
		}

		let mut state = self.state.lock();
		if let Some(remaining) = state.failures.get_mut(&request.topic)
			&& *remaining > 0
		{
			*remaining -= 1;
			return Err(SubscriptionError::Handshake {
				topic: request.topic,
				reason: "handshake rejected".into(),
			});
		}
		state.active.insert(request.id, request.topic);
		Ok(())
	}

	async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SubscriptionError> {
		self.state.lock().active.remove(&id);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use chrono::Utc;
	use hearth_primitives::UserId;

	use super::*;
	use crate::topic::Topic;

	#[tokio::test(flavor = "current_thread")]
	async fn push_routes_to_active_subscription() {
		let transport = MemoryTransport::new();
		let mut events = transport.subscribe_events().unwrap();
		let topic = Topic::notifications(&UserId::from("u1"));
		let id = SubscriptionId::new(0, 1);

		assert!(!transport.push(&topic.id, RawChange::insert("notifications", serde_json::Value::Null, Utc::now())));
		transport.subscribe(SubscribeRequest::for_topic(id, &topic)).await.unwrap();
		assert!(transport.push(&topic.id, RawChange::insert("notifications", serde_json::Value::Null, Utc::now())));

		match events.recv().await.unwrap() {
			TransportEvent::Change { subscription, .. } => assert_eq!(subscription, id),
			other => panic!("unexpected event {other:?}"),
		}
		assert!(transport.subscribe_events().is_err());
	}

	#[tokio::test(flavor = "current_thread")]
	async fn failed_handshakes_are_counted() {
		let transport = MemoryTransport::new();
		let topic = Topic::moderation_queue();
		transport.fail_handshakes(&topic.id, 1);

		let first = transport.subscribe(SubscribeRequest::for_topic(SubscriptionId::new(0, 1), &topic)).await;
		assert!(matches!(first, Err(SubscriptionError::Handshake { .. })));
		transport.subscribe(SubscribeRequest::for_topic(SubscriptionId::new(0, 2), &topic)).await.unwrap();

		assert_eq!(transport.subscribe_count(&topic.id), 2);
		assert_eq!(transport.active(&topic.id), Some(SubscriptionId::new(0, 2)));
	}

	#[tokio::test(flavor = "current_thread")]
	async fn drop_channel_emits_dropped() {
		let transport = MemoryTransport::new();
		let mut events = transport.subscribe_events().unwrap();
		let topic = Topic::moderation_queue();
		let id = SubscriptionId::new(3, 1);
		transport.subscribe(SubscribeRequest::for_topic(id, &topic)).await.unwrap();

		assert!(transport.drop_channel(&topic.id));
		assert_eq!(transport.active(&topic.id), None);
		match events.recv().await.unwrap() {
			TransportEvent::Dropped { subscription, .. } => assert_eq!(subscription, id),
			other => panic!("unexpected event {other:?}"),
		}
	}
}
