//! Change-stream transport abstraction.
//!
//! The transport is an opaque push channel: `subscribe` performs the
//! handshake for one filtered stream and resolves once the server accepted
//! it; changes and channel failures for every subscription then arrive,
//! tagged with the [`SubscriptionId`] that requested them, on the single
//! receiver returned by [`RealtimeTransport::subscribe_events`].

use std::fmt;

use async_trait::async_trait;
use hearth_primitives::UserId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::SubscriptionError;
use crate::payload::RawChange;
use crate::topic::{OperationFilter, Table, Topic, TopicId};

mod memory;

pub use memory::MemoryTransport;

/// Identity of one subscribe attempt: a stable slot per topic plus a
/// generation bumped on every (re)subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId {
	pub slot: u32,
	pub generation: u32,
}

impl SubscriptionId {
	pub const fn new(slot: u32, generation: u32) -> Self {
		Self { slot, generation }
	}
}

impl fmt::Display for SubscriptionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "sub#{}.{}", self.slot, self.generation)
	}
}

/// Subscribe call sent to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
	pub id: SubscriptionId,
	pub topic: TopicId,
	pub table: Table,
	pub operation: OperationFilter,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub filter: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub scope: Option<UserId>,
}

impl SubscribeRequest {
	pub fn for_topic(id: SubscriptionId, topic: &Topic) -> Self {
		Self {
			id,
			topic: topic.id.clone(),
			table: topic.filter.table,
			operation: topic.filter.operation,
			filter: topic.filter.row_filter.clone(),
			scope: topic.scope.clone(),
		}
	}
}

/// Events pushed by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
	/// A row change on an active subscription.
	Change { subscription: SubscriptionId, change: RawChange },
	/// The channel behind a subscription was lost.
	Dropped { subscription: SubscriptionId, reason: String },
	/// The transport shut down; no further events follow.
	Closed,
}

/// Pluggable change-stream transport.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
	/// Takes the event receiver. Can only be called once.
	fn subscribe_events(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, SubscriptionError>;

	/// Opens a subscription and resolves after the handshake.
	async fn subscribe(&self, request: SubscribeRequest) -> Result<(), SubscriptionError>;

	/// Closes a subscription. Unknown ids are ignored.
	async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), SubscriptionError>;
}
