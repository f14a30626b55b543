use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Wire encodings accepted for a primary key.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
	Text(String),
	Signed(i64),
	Unsigned(u64),
}

impl RawId {
	fn into_string(self) -> String {
		match self {
			Self::Text(s) => s,
			Self::Signed(n) => n.to_string(),
			Self::Unsigned(n) => n.to_string(),
		}
	}
}

macro_rules! define_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Wraps a raw identifier.
			pub fn new(id: impl Into<String>) -> Self {
				Self(id.into())
			}

			/// Returns the identifier text.
			pub fn as_str(&self) -> &str {
				&self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl From<&str> for $name {
			fn from(id: &str) -> Self {
				Self(id.to_owned())
			}
		}

		impl From<String> for $name {
			fn from(id: String) -> Self {
				Self(id)
			}
		}

		impl From<u64> for $name {
			fn from(id: u64) -> Self {
				Self(id.to_string())
			}
		}

		impl<'de> Deserialize<'de> for $name {
			fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
				RawId::deserialize(deserializer).map(|raw| Self(raw.into_string()))
			}
		}
	};
}

define_id!(
	/// Account identifier.
	UserId
);
define_id!(
	/// Chat conversation between a buyer and a listing owner.
	ConversationId
);
define_id!(
	/// Chat message identifier. Optimistic messages use [`MessageId::local`].
	MessageId
);
define_id!(
	/// Notification row identifier.
	NotificationId
);
define_id!(
	/// Property listing identifier.
	PropertyId
);

const LOCAL_PREFIX: &str = "local:";

impl MessageId {
	/// Placeholder id for an optimistic message that the server has not echoed yet.
	pub fn local(client_id: ClientId) -> Self {
		Self(format!("{LOCAL_PREFIX}{client_id}"))
	}

	/// Returns true for placeholder ids minted by [`MessageId::local`].
	pub fn is_local(&self) -> bool {
		self.0.starts_with(LOCAL_PREFIX)
	}
}

/// Client-generated idempotency key attached to every optimistic mutation.
///
/// The key is forwarded with the mutation and echoed back in the confirming
/// row, which is what lets the reducer swap an optimistic entry for its
/// confirmed counterpart exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(Uuid);

impl ClientId {
	/// Mints a fresh random key.
	pub fn new() -> Self {
		Self(Uuid::new_v4())
	}

	/// Wraps an existing UUID.
	pub const fn from_uuid(uuid: Uuid) -> Self {
		Self(uuid)
	}

	/// Returns the underlying UUID.
	pub const fn as_uuid(&self) -> &Uuid {
		&self.0
	}
}

impl Default for ClientId {
	fn default() -> Self {
		Self::new()
	}
}

impl fmt::Display for ClientId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.fmt(f)
	}
}
