//! Raw change payloads as delivered by the transport.

use std::fmt;

use hearth_primitives::Timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Row operation kind. Accepts both `insert` and `INSERT` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
	#[serde(alias = "INSERT")]
	Insert,
	#[serde(alias = "UPDATE")]
	Update,
	#[serde(alias = "DELETE")]
	Delete,
}

impl fmt::Display for Operation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			Self::Insert => "insert",
			Self::Update => "update",
			Self::Delete => "delete",
		})
	}
}

/// One row-level change, before normalization.
///
/// Ordered within a topic, unordered across topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
	pub operation: Operation,
	/// Source table name; left as text so unknown tables can be reported.
	pub table: String,
	/// New row snapshot. For deletes the backend may send only the key columns.
	#[serde(default)]
	pub row: Value,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub old_row: Option<Value>,
	pub timestamp: Timestamp,
}

impl RawChange {
	pub fn insert(table: impl Into<String>, row: Value, timestamp: Timestamp) -> Self {
		Self {
			operation: Operation::Insert,
			table: table.into(),
			row,
			old_row: None,
			timestamp,
		}
	}

	pub fn update(table: impl Into<String>, row: Value, old_row: Option<Value>, timestamp: Timestamp) -> Self {
		Self {
			operation: Operation::Update,
			table: table.into(),
			row,
			old_row,
			timestamp,
		}
	}

	pub fn delete(table: impl Into<String>, old_row: Value, timestamp: Timestamp) -> Self {
		Self {
			operation: Operation::Delete,
			table: table.into(),
			row: Value::Null,
			old_row: Some(old_row),
			timestamp,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn decodes_uppercase_operations() {
		let change: RawChange = serde_json::from_value(serde_json::json!({
			"operation": "UPDATE",
			"table": "properties",
			"row": { "id": 7 },
			"timestamp": "2026-01-02T03:04:05Z",
		}))
		.unwrap();
		assert_eq!(change.operation, Operation::Update);
		assert_eq!(change.old_row, None);
	}
}
