//! Interval control for adaptive polling.
//!
//! [`PollState`] is the per-subscription record the scheduler mutates after each settled fetch,
//! and [`next_interval`] is the single pure rule set that turns it into the next delay. Keeping
//! the arithmetic here lets it be exercised without timers or a network.

use super::change::Observation;
use super::profile::PollProfile;
use serde::{Deserialize, Serialize};

/// Streak above which quiescent resources back off sharply.
pub const QUIESCENT_STREAK: u32 = 10;
/// Streak above which quiescent resources start to back off.
pub const COOLING_STREAK: u32 = 5;

const ERROR_FACTOR: f64 = 1.5;
const QUIESCENT_FACTOR: f64 = 1.5;
const COOLING_FACTOR: f64 = 1.2;
const FRESH_FACTOR: f64 = 0.8;

/// Mutable polling state of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollState {
	/// Delay before the next fetch, always within the profile bounds.
	pub current_interval_ms: u64,
	/// Digest of the most recently accepted payload.
	pub last_payload_hash: Option<String>,
	/// Consecutive polls that returned identical data.
	pub no_change_streak: u32,
	/// Consecutive failed fetches.
	pub consecutive_errors: u32,
	/// Whether the subscription is still scheduled.
	pub is_active: bool,
}

impl PollState {
	pub fn new(profile: &PollProfile) -> Self {
		Self {
			current_interval_ms: profile.base_ms,
			last_payload_hash: None,
			no_change_streak: 0,
			consecutive_errors: 0,
			is_active: true,
		}
	}

	/// Record a successful fetch. Returns true if the payload is new and should be delivered.
	pub fn record_success(&mut self, observation: Observation) -> bool {
		self.consecutive_errors = 0;
		match observation {
			Observation::Changed(hash) => {
				self.no_change_streak = 0;
				self.last_payload_hash = Some(hash);
				true
			}
			Observation::Unchanged(_) => {
				self.no_change_streak = self.no_change_streak.saturating_add(1);
				false
			}
		}
	}

	/// Record a failed fetch. The change streak is left untouched.
	pub fn record_failure(&mut self) {
		self.consecutive_errors = self.consecutive_errors.saturating_add(1);
	}
}

/// Which rule decided the next interval. The first matching rule wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalAdjustment {
	/// The last fetch failed.
	ErrorBackoff,
	/// More than [`QUIESCENT_STREAK`] unchanged polls.
	Quiescent,
	/// More than [`COOLING_STREAK`] unchanged polls.
	Cooling,
	/// A change was just seen.
	Fresh,
	Hold,
}

impl IntervalAdjustment {
	fn factor(self) -> Option<f64> {
		match self {
			IntervalAdjustment::ErrorBackoff => Some(ERROR_FACTOR),
			IntervalAdjustment::Quiescent => Some(QUIESCENT_FACTOR),
			IntervalAdjustment::Cooling => Some(COOLING_FACTOR),
			IntervalAdjustment::Fresh => Some(FRESH_FACTOR),
			IntervalAdjustment::Hold => None,
		}
	}
}

/// Pick the rule that applies to `state`.
///
/// Errors are checked before the change streak, so a single failure on an otherwise stable
/// resource widens the interval instead of shrinking it.
pub fn classify(state: &PollState) -> IntervalAdjustment {
	if state.consecutive_errors > 0 {
		IntervalAdjustment::ErrorBackoff
	} else if state.no_change_streak > QUIESCENT_STREAK {
		IntervalAdjustment::Quiescent
	} else if state.no_change_streak > COOLING_STREAK {
		IntervalAdjustment::Cooling
	} else if state.no_change_streak == 0 {
		IntervalAdjustment::Fresh
	} else {
		IntervalAdjustment::Hold
	}
}

/// Compute the next polling delay in milliseconds from the current state.
///
/// The result always lies in `[profile.min_ms, profile.max_ms]`. With `adaptive` off (globally or
/// on the profile) the interval is pinned to `profile.base_ms`.
pub fn next_interval(state: &PollState, profile: &PollProfile, adaptive: bool) -> u64 {
	if !adaptive || !profile.adaptive {
		return profile.base_ms;
	}

	let current = state.current_interval_ms;
	let next = match classify(state).factor() {
		Some(factor) => (current as f64 * factor).round() as u64,
		None => current,
	};
	next.clamp(profile.min_ms, profile.max_ms)
}

/// Phase of a subscription's poll cycle: `Idle -> Waiting -> InFlight -> Settled -> Scheduled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPhase {
	Idle,
	/// Queued behind the concurrency gate.
	Waiting,
	InFlight,
	Settled,
	/// Sleeping until the next tick.
	Scheduled,
	Stopped,
}
