//! Cached client views and their keys.

use std::fmt;
use std::str::FromStr;

use hearth_primitives::{Conversation, ConversationId, ListingSummary, Message, ModerationToast, Notification, PropertyId, Timestamp, UserId};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::topic::TopicId;

/// Identity of a cached view.
///
/// Textual forms: `transcript:42`, `conversations:u1`, `notifications:u1`,
/// `unread:u1`, `moderation-queue`, `moderation-toasts`, `listing:7`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ViewKey {
	/// Open chat transcript.
	Transcript(ConversationId),
	ConversationList(UserId),
	NotificationFeed(UserId),
	UnreadCount(UserId),
	/// Pending listings awaiting moderation.
	ModerationQueue,
	ModerationToasts,
	Listing(PropertyId),
}

/// Shape of a view's contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewKind {
	List,
	Record,
	Counter,
}

impl ViewKey {
	pub fn kind(&self) -> ViewKind {
		match self {
			Self::Listing(_) => ViewKind::Record,
			Self::UnreadCount(_) => ViewKind::Counter,
			_ => ViewKind::List,
		}
	}

	/// Whether the view mirrors a reducer projection rather than a fetched snapshot.
	pub fn is_streaming(&self) -> bool {
		matches!(self, Self::Transcript(_) | Self::NotificationFeed(_) | Self::UnreadCount(_) | Self::ModerationToasts)
	}

	/// Whether a refetch result is merged with live entries instead of replacing
	/// the projection outright.
	pub fn merges_refetch(&self) -> bool {
		matches!(self, Self::Transcript(_) | Self::NotificationFeed(_))
	}

	/// Topic whose events keep this view current.
	pub fn topic(&self) -> TopicId {
		match self {
			Self::Transcript(id) => TopicId::conversation(id),
			Self::ConversationList(user) => TopicId::conversations(user),
			Self::NotificationFeed(user) | Self::UnreadCount(user) => TopicId::notifications(user),
			Self::ModerationQueue | Self::ModerationToasts | Self::Listing(_) => TopicId::moderation_queue(),
		}
	}

	pub fn depends_on(&self, topic: &TopicId) -> bool {
		self.topic() == *topic
	}
}

impl fmt::Display for ViewKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Transcript(id) => write!(f, "transcript:{id}"),
			Self::ConversationList(user) => write!(f, "conversations:{user}"),
			Self::NotificationFeed(user) => write!(f, "notifications:{user}"),
			Self::UnreadCount(user) => write!(f, "unread:{user}"),
			Self::ModerationQueue => f.write_str("moderation-queue"),
			Self::ModerationToasts => f.write_str("moderation-toasts"),
			Self::Listing(id) => write!(f, "listing:{id}"),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid view key `{0}`")]
pub struct ParseViewKeyError(String);

impl FromStr for ViewKey {
	type Err = ParseViewKeyError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"moderation-queue" => return Ok(Self::ModerationQueue),
			"moderation-toasts" => return Ok(Self::ModerationToasts),
			_ => {}
		}
		let (prefix, id) = s.split_once(':').ok_or_else(|| ParseViewKeyError(s.to_owned()))?;
		if id.is_empty() {
			return Err(ParseViewKeyError(s.to_owned()));
		}
		match prefix {
			"transcript" => Ok(Self::Transcript(id.into())),
			"conversations" => Ok(Self::ConversationList(id.into())),
			"notifications" => Ok(Self::NotificationFeed(id.into())),
			"unread" => Ok(Self::UnreadCount(id.into())),
			"listing" => Ok(Self::Listing(id.into())),
			_ => Err(ParseViewKeyError(s.to_owned())),
		}
	}
}

impl Serialize for ViewKey {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_str(self)
	}
}

impl<'de> Deserialize<'de> for ViewKey {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let text = String::deserialize(deserializer)?;
		text.parse().map_err(serde::de::Error::custom)
	}
}

/// View payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "items", rename_all = "snake_case")]
pub enum ViewContents {
	/// Never loaded.
	Empty,
	Messages(Vec<Message>),
	Conversations(Vec<Conversation>),
	Notifications(Vec<Notification>),
	Count(u64),
	Listings(Vec<ListingSummary>),
	Listing(Option<ListingSummary>),
	Toasts(Vec<ModerationToast>),
}

impl ViewContents {
	pub fn is_empty(&self) -> bool {
		match self {
			Self::Empty => true,
			Self::Messages(v) => v.is_empty(),
			Self::Conversations(v) => v.is_empty(),
			Self::Notifications(v) => v.is_empty(),
			Self::Count(n) => *n == 0,
			Self::Listings(v) => v.is_empty(),
			Self::Listing(r) => r.is_none(),
			Self::Toasts(v) => v.is_empty(),
		}
	}

	/// Whether these contents have the shape expected for `key`.
	pub fn fits(&self, key: &ViewKey) -> bool {
		matches!(
			(key, self),
			(_, Self::Empty)
				| (ViewKey::Transcript(_), Self::Messages(_))
				| (ViewKey::ConversationList(_), Self::Conversations(_))
				| (ViewKey::NotificationFeed(_), Self::Notifications(_))
				| (ViewKey::UnreadCount(_), Self::Count(_))
				| (ViewKey::ModerationQueue, Self::Listings(_))
				| (ViewKey::ModerationToasts, Self::Toasts(_))
				| (ViewKey::Listing(_), Self::Listing(_))
		)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FreshnessState {
	/// Contents reflect every event seen so far.
	Fresh,
	/// Contents may be outdated; a refetch is pending or will run on next read.
	Invalidated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Freshness {
	/// Bumped on every patch, invalidation and refetch install.
	pub version: u64,
	pub state: FreshnessState,
	/// Set while the view's topic is closed and the view cannot follow live changes.
	pub degraded: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub updated_at: Option<Timestamp>,
}

/// A view as handed to consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedView {
	pub key: ViewKey,
	pub kind: ViewKind,
	pub contents: ViewContents,
	pub freshness: Freshness,
}

impl CachedView {
	pub(crate) fn new(key: ViewKey, contents: ViewContents) -> Self {
		Self {
			kind: key.kind(),
			key,
			contents,
			freshness: Freshness {
				version: 0,
				state: FreshnessState::Invalidated,
				degraded: false,
				updated_at: None,
			},
		}
	}

	pub fn is_stale(&self) -> bool {
		self.freshness.state == FreshnessState::Invalidated
	}

	pub fn is_degraded(&self) -> bool {
		self.freshness.degraded
	}

	pub fn version(&self) -> u64 {
		self.freshness.version
	}

	pub fn messages(&self) -> &[Message] {
		match &self.contents {
			ViewContents::Messages(v) => v,
			_ => &[],
		}
	}

	pub fn notifications(&self) -> &[Notification] {
		match &self.contents {
			ViewContents::Notifications(v) => v,
			_ => &[],
		}
	}

	pub fn toasts(&self) -> &[ModerationToast] {
		match &self.contents {
			ViewContents::Toasts(v) => v,
			_ => &[],
		}
	}

	pub fn listings(&self) -> &[ListingSummary] {
		match &self.contents {
			ViewContents::Listings(v) => v,
			_ => &[],
		}
	}

	pub fn listing(&self) -> Option<&ListingSummary> {
		match &self.contents {
			ViewContents::Listing(r) => r.as_ref(),
			_ => None,
		}
	}

	pub fn count(&self) -> Option<u64> {
		match self.contents {
			ViewContents::Count(n) => Some(n),
			_ => None,
		}
	}
}

/// Handle returned by `subscribe_to_view`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewListenerId(pub u64);

impl fmt::Display for ViewListenerId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "listener#{}", self.0)
	}
}
