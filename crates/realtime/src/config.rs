//! Engine configuration.
//!
//! Every field has a default so an empty TOML document is a valid config:
//!
//! ```toml
//! [backoff]
//! base_delay_ms = 500
//! max_delay_ms = 30000
//! jitter_factor = 0.2
//! max_retries = 6
//!
//! [views]
//! coalesce_window_ms = 150
//! toast_capacity = 20
//!
//! [polling]
//! interval_secs = 30
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffConfig;
use crate::error::ConfigError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
	/// Reconnect policy for dropped subscriptions.
	pub backoff: BackoffConfig,
	pub views: ViewsConfig,
	/// Fallback polling while the notifications topic is closed.
	pub polling: PollingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ViewsConfig {
	/// Window inside which repeated invalidations of one view collapse into a single refetch.
	#[serde(default = "default_coalesce_window_ms")]
	pub coalesce_window_ms: u64,
	/// Maximum number of moderation toasts kept on screen.
	#[serde(default = "default_toast_capacity")]
	pub toast_capacity: usize,
}

fn default_coalesce_window_ms() -> u64 {
	150
}

fn default_toast_capacity() -> usize {
	20
}

impl Default for ViewsConfig {
	fn default() -> Self {
		Self {
			coalesce_window_ms: default_coalesce_window_ms(),
			toast_capacity: default_toast_capacity(),
		}
	}
}

impl ViewsConfig {
	pub fn coalesce_window(&self) -> Duration {
		Duration::from_millis(self.coalesce_window_ms)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollingConfig {
	#[serde(default = "default_poll_interval_secs")]
	pub interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
	30
}

impl Default for PollingConfig {
	fn default() -> Self {
		Self {
			interval_secs: default_poll_interval_secs(),
		}
	}
}

impl PollingConfig {
	pub fn interval(&self) -> Duration {
		Duration::from_secs(self.interval_secs)
	}
}

impl EngineConfig {
	/// Parses and validates a TOML document.
	pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
		let config: Self = toml::from_str(source)?;
		config.validate()?;
		Ok(config)
	}

	/// Reads, parses and validates a TOML file.
	pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let source = std::fs::read_to_string(path)?;
		Self::from_toml(&source)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.backoff.max_retries == 0 {
			return Err(ConfigError::Invalid("backoff.max_retries must be at least 1".into()));
		}
		if !(0.0..=1.0).contains(&self.backoff.jitter_factor) {
			return Err(ConfigError::Invalid(format!(
				"backoff.jitter_factor must be within [0, 1], got {}",
				self.backoff.jitter_factor
			)));
		}
		if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
			return Err(ConfigError::Invalid("backoff.base_delay_ms exceeds backoff.max_delay_ms".into()));
		}
		if self.views.toast_capacity == 0 {
			return Err(ConfigError::Invalid("views.toast_capacity must be at least 1".into()));
		}
		if self.polling.interval_secs == 0 {
			return Err(ConfigError::Invalid("polling.interval_secs must be at least 1".into()));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	#[test]
	fn empty_document_yields_defaults() {
		let config = EngineConfig::from_toml("").unwrap();
		assert_eq!(config, EngineConfig::default());
		assert_eq!(config.views.coalesce_window(), Duration::from_millis(150));
		assert_eq!(config.polling.interval(), Duration::from_secs(30));
	}

	#[test]
	fn partial_sections_keep_remaining_defaults() {
		let config = EngineConfig::from_toml(
			r#"
			[backoff]
			max_retries = 3

			[views]
			toast_capacity = 5
			"#,
		)
		.unwrap();
		assert_eq!(config.backoff.max_retries, 3);
		assert_eq!(config.backoff.base_delay_ms, BackoffConfig::default().base_delay_ms);
		assert_eq!(config.views.toast_capacity, 5);
		assert_eq!(config.views.coalesce_window_ms, 150);
	}

	#[test]
	fn rejects_out_of_range_values() {
		for source in [
			"[backoff]\nmax_retries = 0",
			"[backoff]\njitter_factor = 1.5",
			"[backoff]\nbase_delay_ms = 10\nmax_delay_ms = 5",
			"[views]\ntoast_capacity = 0",
			"[polling]\ninterval_secs = 0",
		] {
			let err = EngineConfig::from_toml(source).unwrap_err();
			assert!(matches!(err, ConfigError::Invalid(_)), "{source}: {err}");
		}
	}

	#[test]
	fn rejects_unknown_keys() {
		let err = EngineConfig::from_toml("[views]\nwindow = 3").unwrap_err();
		assert!(matches!(err, ConfigError::Parse(_)));
	}
}
