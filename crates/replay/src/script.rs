//! NDJSON replay scripts.
//!
//! One step per line; blank lines and `#` comments are skipped:
//!
//! ```text
//! {"op": "serve", "view": "transcript:42", "contents": {"type": "messages", "items": []}}
//! {"op": "open", "conversation": 42}
//! {"op": "print", "view": "transcript:42"}
//! {"op": "change", "topic": "conversation:42", "change": {"operation": "insert", "table": "messages", ...}}
//! ```

use anyhow::Context;
use hearth_primitives::ConversationId;
use hearth_realtime::{Action, RawChange, TopicId, ViewContents, ViewKey};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Step {
	/// Contents the fake backend returns for a view refetch.
	Serve { view: ViewKey, contents: ViewContents },
	/// Count returned by the unread fallback poll.
	Unread { count: u64 },
	Open { conversation: ConversationId },
	Close { conversation: ConversationId },
	/// Prints every later update of a view.
	Watch { view: ViewKey },
	Change { topic: TopicId, change: RawChange },
	/// Simulates loss of a topic's channel.
	Drop { topic: TopicId },
	FailHandshakes { topic: TopicId, count: u32 },
	Reconnect { topic: TopicId },
	RejectMutations { enabled: bool },
	Dispatch { action: Action },
	Wait { ms: u64 },
	Print { view: ViewKey },
}

pub fn parse(source: &str) -> anyhow::Result<Vec<Step>> {
	source
		.lines()
		.enumerate()
		.filter(|(_, line)| {
			let line = line.trim();
			!line.is_empty() && !line.starts_with('#')
		})
		.map(|(index, line)| serde_json::from_str(line).with_context(|| format!("script line {}", index + 1)))
		.collect()
}
