use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{PropertyId, Timestamp, UserId};

/// Moderation/publication status of a property listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
	/// Submitted and waiting for an admin decision.
	Pending,
	Active,
	Rejected,
	Sold,
	Rented,
	Inactive,
}

impl ListingStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Active => "active",
			Self::Rejected => "rejected",
			Self::Sold => "sold",
			Self::Rented => "rented",
			Self::Inactive => "inactive",
		}
	}

	pub const fn is_pending(self) -> bool {
		matches!(self, Self::Pending)
	}
}

impl fmt::Display for ListingStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// The subset of a `properties` row the realtime views care about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingSummary {
	pub id: PropertyId,
	pub title: String,
	pub status: ListingStatus,
	pub owner_id: UserId,
	pub updated_at: Timestamp,
}

/// Follow-up action offered on a moderation toast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastAction {
	Approve,
	Reject,
}

/// Admin toast announcing a listing that awaits moderation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationToast {
	pub property_id: PropertyId,
	pub title: String,
	pub owner_id: UserId,
	pub submitted_at: Timestamp,
	pub actions: Vec<ToastAction>,
}

impl ModerationToast {
	/// Toast for a freshly submitted listing, offering approve and reject.
	pub fn for_listing(listing: &ListingSummary) -> Self {
		Self {
			property_id: listing.id.clone(),
			title: listing.title.clone(),
			owner_id: listing.owner_id.clone(),
			submitted_at: listing.updated_at,
			actions: vec![ToastAction::Approve, ToastAction::Reject],
		}
	}
}
