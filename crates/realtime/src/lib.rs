//! Realtime event-to-cache coherence for the marketplace client.
//!
//! The crate consumes a backend change-notification stream (row inserts,
//! updates and deletes on messages, conversations, notifications and
//! properties) and keeps several independently cached client views
//! consistent with it.
//!
//! - [`registry::SubscriptionRegistry`]: one refcounted subscription per
//!   [`topic::Topic`], with reconnect/backoff and degraded mode.
//! - [`normalize::EventNormalizer`]: raw [`payload::RawChange`] to typed
//!   [`event::DomainEvent`].
//! - [`reducer::LocalReducerStore`]: authoritative projections for streaming
//!   views, applied idempotently.
//! - [`propagate::CacheCoherencePropagator`]: patch-or-invalidate fan-out to
//!   [`view::CachedView`]s, with coalesced refetch.
//! - [`dispatch::ActionDispatcher`]: optimistic mutations with rollback.
//! - [`session::RealtimeSession`]: wires everything to a transport and the
//!   backend collaborators for the lifetime of a login.
//!
//! Collaborators are pluggable through [`transport::RealtimeTransport`],
//! [`backend::MutationService`] and [`backend::ViewFetcher`];
//! [`transport::MemoryTransport`] is an in-process implementation used by
//! tests and the replay tool.

pub mod backend;
pub mod backoff;
mod coherence;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod normalize;
pub mod payload;
pub mod propagate;
pub mod reducer;
pub mod registry;
pub mod session;
pub mod topic;
pub mod transport;
pub mod view;

pub use backend::{ActionKind, MutationRequest, MutationService, ViewFetcher};
pub use config::EngineConfig;
pub use dispatch::{Action, ActionDispatcher, PendingAction, PendingStatus, UserAlert};
pub use error::{ActionError, ConfigError, FetchError, NormalizeError, SubscriptionError};
pub use event::{DomainEvent, Envelope};
pub use payload::{Operation, RawChange};
pub use registry::{SubscriptionInfo, SubscriptionRegistry, SubscriptionState};
pub use session::{RealtimeSession, Role, SessionBackends, SessionUser};
pub use topic::{Topic, TopicId};
pub use transport::{MemoryTransport, RealtimeTransport, SubscriptionId, TransportEvent};
pub use view::{CachedView, ViewContents, ViewKey, ViewKind, ViewListenerId};

/// A convenient type alias for `Result` with `E` = [`enum@Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Session-level errors.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
	/// A topic subscription could not be established or was torn down.
	#[error(transparent)]
	Subscription(#[from] SubscriptionError),
	/// A user action was rejected.
	#[error(transparent)]
	Action(#[from] ActionError),
	/// Engine configuration is unreadable or invalid.
	#[error(transparent)]
	Config(#[from] ConfigError),
	/// The session must be started from within a Tokio runtime.
	#[error("no tokio runtime available")]
	NoRuntime,
	/// The session was shut down.
	#[error("session closed")]
	SessionClosed,
}
