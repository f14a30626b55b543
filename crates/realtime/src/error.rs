//! Error taxonomy.
//!
//! Only [`ActionError`] and degraded-mode transitions ever reach the user;
//! subscription and normalization failures are absorbed where they occur.

use std::io;

use crate::topic::TopicId;
use crate::view::ViewKey;

/// Handshake or channel failure. Retried with backoff inside the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
	#[error("handshake for {topic} failed: {reason}")]
	Handshake { topic: TopicId, reason: String },
	#[error("transport unavailable: {0}")]
	Unavailable(String),
	#[error("subscription for {0} was torn down")]
	TornDown(TopicId),
}

/// Raw payload that cannot be mapped to a domain event. Dropped, never retried.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
	#[error("unrecognized table `{0}`")]
	UnknownTable(String),
	#[error("table `{table}` does not belong to topic {topic}")]
	TableMismatch { topic: TopicId, table: String },
	#[error("row belongs to {row_topic}, not topic {topic}")]
	ScopeMismatch { topic: TopicId, row_topic: TopicId },
	#[error("{operation} on `{table}` is filtered out by topic {topic}")]
	OperationFiltered { topic: TopicId, table: String, operation: crate::payload::Operation },
	#[error("{operation} on `{table}` is not supported")]
	UnsupportedOperation { table: String, operation: crate::payload::Operation },
	#[error("malformed `{table}` row: {source}")]
	MalformedRow {
		table: String,
		#[source]
		source: serde_json::Error,
	},
}

/// Mutation rejected by the backend. Rolled back and surfaced, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionError {
	#[error("rejected: {0}")]
	Rejected(String),
	#[error("mutation service unavailable: {0}")]
	Unavailable(String),
	#[error("session closed")]
	SessionClosed,
}

/// Refetch or poll failure. The view stays invalidated and is retried on the next read.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
	#[error("fetch of {key} failed: {reason}")]
	Failed { key: ViewKey, reason: String },
	#[error("no fetcher for {0}")]
	Unsupported(ViewKey),
	#[error("unread count unavailable: {0}")]
	Unread(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("failed to read config: {0}")]
	Io(#[from] io::Error),
	#[error("failed to parse config: {0}")]
	Parse(#[from] toml::de::Error),
	#[error("invalid config: {0}")]
	Invalid(String),
}
