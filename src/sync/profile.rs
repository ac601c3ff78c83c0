//! Named tuning presets for the adaptive scheduler.

use super::types::SyncError;
use std::borrow::Cow;
use std::time::Duration;

/// Interval bounds and adaptivity for one class of resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollProfile {
	pub name: Cow<'static, str>,
	/// Starting interval.
	pub base_ms: u64,
	/// Lower bound the interval may shrink to.
	pub min_ms: u64,
	/// Upper bound the interval may grow to.
	pub max_ms: u64,
	/// When false the interval stays at `base_ms` forever.
	pub adaptive: bool,
}

impl PollProfile {
	/// In-progress match telemetry.
	pub const REALTIME: PollProfile = PollProfile::preset("realtime", 1_000, 500, 5_000);
	/// Device and session status.
	pub const MONITORING: PollProfile = PollProfile::preset("monitoring", 5_000, 3_000, 30_000);
	/// Analytics and derived stats.
	pub const BACKGROUND: PollProfile = PollProfile::preset("background", 10_000, 5_000, 60_000);
	/// Leaderboard-style aggregates.
	pub const LOW_PRIORITY: PollProfile =
		PollProfile::preset("low_priority", 30_000, 15_000, 300_000);

	const fn preset(name: &'static str, base_ms: u64, min_ms: u64, max_ms: u64) -> Self {
		Self {
			name: Cow::Borrowed(name),
			base_ms,
			min_ms,
			max_ms,
			adaptive: true,
		}
	}

	/// Build a custom profile. Call [`PollProfile::validate`] (or subscribe, which does) before use.
	pub fn custom(name: impl Into<String>, base: Duration, min: Duration, max: Duration) -> Self {
		Self {
			name: Cow::Owned(name.into()),
			base_ms: base.as_millis() as u64,
			min_ms: min.as_millis() as u64,
			max_ms: max.as_millis() as u64,
			adaptive: true,
		}
	}

	/// Look up a preset by name, case-insensitively. `-` and `_` are interchangeable.
	pub fn from_name(name: &str) -> Option<Self> {
		match name.trim().to_ascii_lowercase().replace('-', "_").as_str() {
			"realtime" => Some(Self::REALTIME),
			"monitoring" => Some(Self::MONITORING),
			"background" => Some(Self::BACKGROUND),
			"low_priority" | "lowpriority" => Some(Self::LOW_PRIORITY),
			_ => None,
		}
	}

	/// Same bounds with adaptivity switched off.
	pub fn fixed(mut self) -> Self {
		self.adaptive = false;
		self
	}

	/// Check `0 < min <= base <= max`.
	pub fn validate(&self) -> Result<(), SyncError> {
		if self.min_ms == 0 {
			return Err(SyncError::InvalidProfile(format!(
				"{}: minimum interval must be positive",
				self.name
			)));
		}
		if self.min_ms > self.base_ms || self.base_ms > self.max_ms {
			return Err(SyncError::InvalidProfile(format!(
				"{}: expected min <= base <= max, got {} / {} / {} ms",
				self.name, self.min_ms, self.base_ms, self.max_ms
			)));
		}
		Ok(())
	}

	pub fn base(&self) -> Duration {
		Duration::from_millis(self.base_ms)
	}
}
