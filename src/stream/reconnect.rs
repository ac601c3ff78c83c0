//! Reconnect delay policy for the stream connection.

use backoff::{ExponentialBackoff, backoff::Backoff};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
	pub base_delay: Duration,
	pub max_delay: Duration,
	/// Failures tolerated before the connection is declared failed.
	pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
	fn default() -> Self {
		Self {
			base_delay: Duration::from_millis(1_000),
			max_delay: Duration::from_millis(30_000),
			max_attempts: 10,
		}
	}
}

impl ReconnectPolicy {
	/// Delay before reconnect attempt `attempt` (1-based): `min(base * 2^(attempt-1), max)`.
	pub fn delay_for(&self, attempt: u32) -> Duration {
		let exponent = attempt.saturating_sub(1).min(31);
		self.base_delay
			.saturating_mul(1u32 << exponent)
			.min(self.max_delay)
	}

	/// Deterministic doubling schedule with no jitter and no overall deadline.
	pub fn backoff(&self) -> ExponentialBackoff {
		ExponentialBackoff {
			current_interval: self.base_delay,
			initial_interval: self.base_delay,
			randomization_factor: 0.0,
			multiplier: 2.0,
			max_interval: self.max_delay,
			max_elapsed_time: None,
			..ExponentialBackoff::default()
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
	Retry { attempt: u32, delay: Duration },
	GiveUp { attempts: u32 },
}

/// Attempt counter and delay sequence for one connection.
pub struct ReconnectTracker {
	policy: ReconnectPolicy,
	attempt: u32,
	backoff: ExponentialBackoff,
}

impl ReconnectTracker {
	pub fn new(policy: ReconnectPolicy) -> Self {
		Self {
			backoff: policy.backoff(),
			policy,
			attempt: 0,
		}
	}

	pub fn attempt(&self) -> u32 {
		self.attempt
	}

	pub fn policy(&self) -> &ReconnectPolicy {
		&self.policy
	}

	/// Called on successful open and on explicit connect.
	pub fn reset(&mut self) {
		self.attempt = 0;
		self.backoff.reset();
	}

	/// Record a failed or dropped connection and decide what happens next.
	pub fn on_failure(&mut self) -> ReconnectDecision {
		self.attempt = self.attempt.saturating_add(1);
		if self.attempt >= self.policy.max_attempts {
			return ReconnectDecision::GiveUp {
				attempts: self.attempt,
			};
		}
		let delay = self
			.backoff
			.next_backoff()
			.unwrap_or(self.policy.max_delay)
			.min(self.policy.max_delay);
		ReconnectDecision::Retry {
			attempt: self.attempt,
			delay,
		}
	}
}
