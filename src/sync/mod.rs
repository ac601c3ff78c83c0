//! Pull path and the facade over both paths.
//!
//! [`FixedIntervalPoller`] polls at a constant cadence. [`AdaptiveScheduler`] adjusts each
//! subscription's interval from observed change and failure, bounded by its [`PollProfile`], and
//! shares one [`ConcurrencyGate`] across subscriptions. [`SyncFacade`] hands out
//! [`SubscriptionGuard`]s for polls and stream topics alike.

mod change;
mod facade;
mod gate;
mod interval;
mod poller;
mod profile;
mod registry;
mod scheduler;
mod types;

pub use change::{ChangeDetector, Observation, canonical_json, content_hash};
pub use facade::{SubscriptionGuard, SyncFacade};
pub use gate::{ConcurrencyGate, GatePermit};
pub use interval::{
	COOLING_STREAK, IntervalAdjustment, PollPhase, PollState, QUIESCENT_STREAK, classify,
	next_interval,
};
pub use poller::{FixedIntervalPoller, FixedPoll};
pub use profile::PollProfile;
pub use scheduler::{AdaptiveScheduler, PollSubscription, SchedulerOptions};
pub use types::{
	DataCallback, ErrorHook, PollFailure, SubscriptionId, SyncError, SyncMode,
};
