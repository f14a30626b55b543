//! Exponential reconnect backoff.
//!
//! ```text
//! attempt   nominal (base=500ms)   with jitter 0.2
//!    0          500ms              400ms - 600ms
//!    1            1s               800ms - 1.2s
//!    2            2s               1.6s - 2.4s
//!   ...
//!    n     min(base * 2^n, max)
//! ```

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_JITTER_FACTOR: f64 = 0.2;
const DEFAULT_MAX_RETRIES: u32 = 6;

/// Reconnect policy for a dropped subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffConfig {
	/// Delay before the first retry.
	#[serde(default = "default_base_delay")]
	pub base_delay_ms: u64,
	/// Ceiling applied after doubling.
	#[serde(default = "default_max_delay")]
	pub max_delay_ms: u64,
	/// Relative spread applied to each delay, in `[0, 1]`.
	#[serde(default = "default_jitter")]
	pub jitter_factor: f64,
	/// Attempts allowed before the subscription is closed and degraded mode begins.
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
}

fn default_base_delay() -> u64 {
	DEFAULT_BASE_DELAY_MS
}

fn default_max_delay() -> u64 {
	DEFAULT_MAX_DELAY_MS
}

fn default_jitter() -> f64 {
	DEFAULT_JITTER_FACTOR
}

fn default_max_retries() -> u32 {
	DEFAULT_MAX_RETRIES
}

impl Default for BackoffConfig {
	fn default() -> Self {
		Self {
			base_delay_ms: DEFAULT_BASE_DELAY_MS,
			max_delay_ms: DEFAULT_MAX_DELAY_MS,
			jitter_factor: DEFAULT_JITTER_FACTOR,
			max_retries: DEFAULT_MAX_RETRIES,
		}
	}
}

impl fmt::Display for BackoffConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"backoff(base={}ms, max={}ms, jitter={:.0}%, retries={})",
			self.base_delay_ms,
			self.max_delay_ms,
			self.jitter_factor * 100.0,
			self.max_retries
		)
	}
}

impl BackoffConfig {
	/// Delay without jitter: `base * 2^attempt`, capped at `max_delay_ms`.
	pub fn nominal_delay(&self, attempt: u32) -> Duration {
		let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
		let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
		Duration::from_millis(ms)
	}

	/// Delay to sleep before retry number `attempt` (zero-based), with jitter.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let nominal = self.nominal_delay(attempt);
		if self.jitter_factor <= 0.0 || nominal.is_zero() {
			return nominal;
		}
		let spread = self.jitter_factor.min(1.0);
		let scale = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
		nominal.mul_f64(scale)
	}

	/// Whether another attempt is allowed after `attempts` failed ones.
	pub fn can_retry(&self, attempts: u32) -> bool {
		attempts < self.max_retries
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn no_jitter() -> BackoffConfig {
		BackoffConfig {
			jitter_factor: 0.0,
			..BackoffConfig::default()
		}
	}

	#[test]
	fn delay_doubles_until_capped() {
		let cfg = no_jitter();
		assert_eq!(cfg.delay_for(0), Duration::from_millis(500));
		assert_eq!(cfg.delay_for(1), Duration::from_millis(1_000));
		assert_eq!(cfg.delay_for(3), Duration::from_millis(4_000));
		assert_eq!(cfg.delay_for(10), Duration::from_millis(30_000));
		assert_eq!(cfg.delay_for(200), Duration::from_millis(30_000));
	}

	#[test]
	fn jitter_stays_within_factor() {
		let cfg = BackoffConfig::default();
		for attempt in 0..8 {
			let nominal = cfg.nominal_delay(attempt).as_secs_f64();
			let actual = cfg.delay_for(attempt).as_secs_f64();
			assert!(actual >= nominal * 0.8 - 1e-9, "attempt {attempt}: {actual} < {nominal}");
			assert!(actual <= nominal * 1.2 + 1e-9, "attempt {attempt}: {actual} > {nominal}");
		}
	}

	#[test]
	fn retry_budget_is_bounded() {
		let cfg = BackoffConfig {
			max_retries: 3,
			..no_jitter()
		};
		assert!(cfg.can_retry(0));
		assert!(cfg.can_retry(2));
		assert!(!cfg.can_retry(3));
	}
}
