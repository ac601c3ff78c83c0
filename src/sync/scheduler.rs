//! Adaptive polling scheduler.
//!
//! Each subscription runs one cycle at a time: wait for a gate slot, fetch, settle (hash the
//! payload, update [`PollState`], pick the next interval), release the slot, sleep. The gate is
//! shared by every subscription of the scheduler and bounds simultaneous requests; the interval
//! rules in [`next_interval`] move busy resources toward the profile minimum and quiet or failing
//! ones toward the maximum.
//!
//! Errors are never fatal to a subscription. A failing resource keeps being polled at the
//! backed-off interval until it recovers or the caller unsubscribes.

use super::change::ChangeDetector;
use super::gate::ConcurrencyGate;
use super::interval::{PollPhase, PollState, next_interval};
use super::poller::fetch_with_timeout;
use super::profile::PollProfile;
use super::registry::TaskRegistry;
use super::types::{DataCallback, ErrorHook, PollFailure, SubscriptionId, SyncError};
use crate::backend::Fetcher;
use crate::utils::{invoke_guarded, lock};

use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Scheduler-wide knobs.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
	/// Upper bound on simultaneous fetches across all subscriptions.
	pub max_concurrent: usize,
	/// Hard timeout for each fetch.
	pub request_timeout: Duration,
	/// Suppress callbacks for unchanged payloads.
	pub change_detection: bool,
	/// Adjust intervals; when off every subscription polls at its profile base.
	pub adaptive: bool,
}

impl Default for SchedulerOptions {
	fn default() -> Self {
		Self {
			max_concurrent: 3,
			request_timeout: Duration::from_secs(10),
			change_detection: true,
			adaptive: true,
		}
	}
}

/// An adaptive polling request.
#[derive(Clone)]
pub struct PollSubscription {
	pub id: SubscriptionId,
	pub url: String,
	pub profile: PollProfile,
	pub callback: DataCallback,
}

struct PollEntry {
	id: SubscriptionId,
	url: String,
	profile: PollProfile,
	callback: DataCallback,
	state: Mutex<PollState>,
	phase: Mutex<PollPhase>,
	/// Held for the whole of a callback invocation.
	delivery: Mutex<()>,
	/// Thread currently running this entry's callback, if any.
	delivering_on: Mutex<Option<ThreadId>>,
}

impl PollEntry {
	fn is_active(&self) -> bool {
		lock(&self.state).is_active
	}

	fn set_phase(&self, phase: PollPhase) {
		*lock(&self.phase) = phase;
	}

	/// Run `deliver` if the entry is still active. Serialised against [`Self::deactivate`].
	fn deliver(&self, deliver: impl FnOnce()) {
		let _delivery = lock(&self.delivery);
		if !self.is_active() {
			debug!("Dropping delivery for stopped subscription {}", self.id);
			return;
		}
		*lock(&self.delivering_on) = Some(thread::current().id());
		deliver();
		*lock(&self.delivering_on) = None;
	}

	/// Mark the entry stopped and wait out a delivery running on another thread. When called
	/// from the entry's own callback the delivery lock is already held by this thread.
	fn deactivate(&self) {
		lock(&self.state).is_active = false;
		self.set_phase(PollPhase::Stopped);
		let own_callback = *lock(&self.delivering_on) == Some(thread::current().id());
		if !own_callback {
			drop(lock(&self.delivery));
		}
	}
}

/// What a settled cycle hands to the caller.
enum Delivery {
	Data(Value),
	Unchanged,
	Failure(PollFailure),
}

/// State shared by every running cycle.
struct CycleContext {
	fetcher: Arc<dyn Fetcher>,
	gate: Arc<ConcurrencyGate>,
	detector: ChangeDetector,
	options: SchedulerOptions,
	on_error: Mutex<Option<ErrorHook>>,
}

/// Per-subscription interval controller with a shared concurrency ceiling.
pub struct AdaptiveScheduler {
	context: Arc<CycleContext>,
	tasks: TaskRegistry<PollEntry>,
}

impl AdaptiveScheduler {
	pub fn new(fetcher: Arc<dyn Fetcher>, options: SchedulerOptions) -> Self {
		let context = CycleContext {
			fetcher,
			gate: ConcurrencyGate::new(options.max_concurrent),
			detector: ChangeDetector::new(options.change_detection),
			options,
			on_error: Mutex::new(None),
		};
		Self {
			context: Arc::new(context),
			tasks: TaskRegistry::new(),
		}
	}

	/// Install the hook that receives every failed poll.
	pub fn set_error_hook(&self, hook: ErrorHook) {
		*lock(&self.context.on_error) = Some(hook);
	}

	pub fn options(&self) -> &SchedulerOptions {
		&self.context.options
	}

	/// Start polling a subscription; the first fetch is issued as soon as a gate slot is free.
	///
	/// A running subscription with the same id is stopped first. Must be called from within a
	/// Tokio runtime.
	///
	/// # Errors
	/// Returns `SyncError::InvalidProfile` before anything is scheduled if the profile bounds are
	/// inconsistent.
	pub fn schedule(&self, subscription: PollSubscription) -> Result<(), SyncError> {
		subscription.profile.validate()?;

		if self.unschedule(&subscription.id) {
			debug!("Rescheduling subscription {}", subscription.id);
		}

		let PollSubscription {
			id,
			url,
			profile,
			callback,
		} = subscription;

		info!(
			"Scheduling {} on {} with profile {} (base {} ms)",
			id, url, profile.name, profile.base_ms
		);

		let entry = Arc::new(PollEntry {
			id: id.clone(),
			url,
			state: Mutex::new(PollState::new(&profile)),
			phase: Mutex::new(PollPhase::Idle),
			delivery: Mutex::new(()),
			delivering_on: Mutex::new(None),
			profile,
			callback,
		});
		let handle = tokio::spawn(run_cycles(self.context.clone(), entry.clone()));
		self.tasks.insert(id, entry, handle);
		Ok(())
	}

	/// Stop a subscription. Idempotent: returns false if it was not scheduled.
	///
	/// The timer is cancelled and any gate slot or queued wait is released before this returns.
	/// A fetch already in flight is dropped and its result never reaches the callback.
	pub fn unschedule(&self, id: &SubscriptionId) -> bool {
		let Some(entry) = self.tasks.remove(id) else {
			return false;
		};
		entry.deactivate();
		let released = self.context.gate.cancel(id);
		info!("Unscheduled {} (released {} gate slot(s))", id, released);
		true
	}

	/// Stop every subscription.
	pub fn stop_all(&self) {
		for (id, entry) in self.tasks.drain() {
			entry.deactivate();
			self.context.gate.cancel(&id);
		}
	}

	/// Snapshot of a subscription's polling state.
	pub fn state(&self, id: &SubscriptionId) -> Option<PollState> {
		self.tasks.get(id).map(|entry| lock(&entry.state).clone())
	}

	pub fn phase(&self, id: &SubscriptionId) -> Option<PollPhase> {
		self.tasks.get(id).map(|entry| *lock(&entry.phase))
	}

	pub fn is_scheduled(&self, id: &SubscriptionId) -> bool {
		self.tasks.contains(id)
	}

	pub fn ids(&self) -> Vec<SubscriptionId> {
		self.tasks.ids()
	}

	pub fn len(&self) -> usize {
		self.tasks.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Fetches currently holding a gate slot.
	pub fn in_flight(&self) -> usize {
		self.context.gate.in_flight()
	}

	/// Subscriptions queued for a gate slot.
	pub fn waiting(&self) -> usize {
		self.context.gate.waiting()
	}
}

impl Drop for AdaptiveScheduler {
	fn drop(&mut self) {
		self.stop_all();
	}
}

async fn run_cycles(context: Arc<CycleContext>, entry: Arc<PollEntry>) {
	loop {
		entry.set_phase(PollPhase::Waiting);
		let Some(permit) = context.gate.acquire(&entry.id).await else {
			return;
		};
		if !entry.is_active() {
			return;
		}

		entry.set_phase(PollPhase::InFlight);
		let outcome =
			fetch_with_timeout(context.fetcher.as_ref(), &entry.url, context.options.request_timeout)
				.await;

		let (delivery, delay) = {
			let mut state = lock(&entry.state);
			if !state.is_active {
				debug!("Discarding fetch result for stopped subscription {}", entry.id);
				return;
			}

			let delivery = match outcome {
				Ok(payload) => {
					let observation = context
						.detector
						.observe(state.last_payload_hash.as_deref(), &payload);
					if state.record_success(observation) {
						Delivery::Data(payload)
					} else {
						Delivery::Unchanged
					}
				}
				Err(error) => {
					state.record_failure();
					Delivery::Failure(PollFailure {
						subscription_id: entry.id.clone(),
						url: entry.url.clone(),
						error,
						consecutive_errors: state.consecutive_errors,
					})
				}
			};

			state.current_interval_ms =
				next_interval(&state, &entry.profile, context.options.adaptive);
			(delivery, Duration::from_millis(state.current_interval_ms))
		};
		entry.set_phase(PollPhase::Settled);

		match delivery {
			Delivery::Data(payload) => {
				entry.deliver(|| {
					invoke_guarded(entry.id.as_str(), || (entry.callback)(payload));
				});
			}
			Delivery::Unchanged => {
				debug!("No change for {}, next poll in {:?}", entry.id, delay);
			}
			Delivery::Failure(failure) => {
				warn!(
					"Poll {} failed ({} in a row): {}; next attempt in {:?}",
					entry.id, failure.consecutive_errors, failure.error, delay
				);
				let hook = lock(&context.on_error).clone();
				if let Some(hook) = hook {
					entry.deliver(|| {
						invoke_guarded(entry.id.as_str(), || hook(&failure));
					});
				}
			}
		}

		drop(permit);
		if !entry.is_active() {
			return;
		}
		entry.set_phase(PollPhase::Scheduled);
		tokio::time::sleep(delay).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::sync::poller::tests::{MockFetcher, collector};
	use serde_json::json;
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
	use tokio::time::Instant;

	fn options(max_concurrent: usize) -> SchedulerOptions {
		SchedulerOptions {
			max_concurrent,
			..SchedulerOptions::default()
		}
	}

	fn subscription(id: &str, profile: PollProfile, callback: DataCallback) -> PollSubscription {
		PollSubscription {
			id: SubscriptionId::from(id),
			url: format!("http://test/{}", id),
			profile,
			callback,
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_concurrency_bound_with_more_subscriptions_than_slots() {
		let fetcher = MockFetcher::new(vec![Ok(json!({"v": 1}))])
			.with_latency(Duration::from_millis(200));
		let scheduler = AdaptiveScheduler::new(fetcher.clone(), options(2));

		let served = Arc::new(AtomicUsize::new(0));
		for i in 0..6 {
			let served = served.clone();
			let callback: DataCallback = Arc::new(move |_| {
				served.fetch_add(1, Ordering::SeqCst);
			});
			scheduler
				.schedule(subscription(&format!("s{}", i), PollProfile::REALTIME, callback))
				.unwrap();
		}

		for _ in 0..20 {
			tokio::time::sleep(Duration::from_millis(50)).await;
			assert!(scheduler.in_flight() <= 2);
		}

		assert_eq!(fetcher.max_in_flight.load(Ordering::SeqCst), 2);
		assert_eq!(served.load(Ordering::SeqCst), 6);
		assert_eq!(fetcher.max_in_flight_per_url.load(Ordering::SeqCst), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_unchanged_payload_suppresses_callback() {
		let fetcher = MockFetcher::new(vec![
			Ok(json!({"a": 1, "b": 2})),
			Ok(json!({"b": 2, "a": 1})),
			Ok(json!({"a": 1, "b": 2})),
			Ok(json!({"a": 1, "b": 3})),
		]);
		let scheduler = AdaptiveScheduler::new(fetcher.clone(), options(3));
		let (callback, seen) = collector();
		let id = SubscriptionId::from("dedupe");

		scheduler
			.schedule(subscription("dedupe", PollProfile::REALTIME, callback))
			.unwrap();
		// A fresh change shrinks to 800 ms, unchanged polls then hold it: 0, 800, 1600, 2400 ms.
		tokio::time::sleep(Duration::from_millis(2_500)).await;

		assert_eq!(fetcher.calls(), 4);
		assert_eq!(*lock(&seen), vec![json!({"a": 1, "b": 2}), json!({"a": 1, "b": 3})]);
		let state = scheduler.state(&id).unwrap();
		assert_eq!(state.no_change_streak, 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_change_detection_off_delivers_every_payload() {
		let fetcher = MockFetcher::new(vec![Ok(json!({"a": 1}))]);
		let scheduler = AdaptiveScheduler::new(
			fetcher.clone(),
			SchedulerOptions {
				change_detection: false,
				..SchedulerOptions::default()
			},
		);
		let (callback, seen) = collector();
		scheduler
			.schedule(subscription("raw", PollProfile::REALTIME, callback))
			.unwrap();
		tokio::time::sleep(Duration::from_millis(1_500)).await;

		assert_eq!(fetcher.calls(), 3);
		assert_eq!(lock(&seen).len(), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn test_realtime_scenario_grows_past_base() {
		let mut responses: Vec<_> = (0..3).map(|i| Ok(json!({"score": i}))).collect();
		responses.push(Ok(json!({"score": 2})));
		let fetcher = MockFetcher::new(responses);
		let scheduler = AdaptiveScheduler::new(fetcher.clone(), options(3));
		let (callback, seen) = collector();
		let id = SubscriptionId::from("match");

		scheduler
			.schedule(subscription("match", PollProfile::REALTIME, callback))
			.unwrap();
		// The 15th fetch lands at 10 991 ms and the 16th would be at 13 856 ms.
		tokio::time::sleep(Duration::from_millis(12_000)).await;

		assert_eq!(fetcher.calls(), 15);
		assert_eq!(lock(&seen).len(), 3);
		let state = scheduler.state(&id).unwrap();
		assert_eq!(state.no_change_streak, 12);
		assert_eq!(state.current_interval_ms, 2_865);
		assert_eq!(scheduler.phase(&id), Some(PollPhase::Scheduled));

		let times = lock(&fetcher.call_times).clone();
		let gaps: Vec<u128> = times.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
		assert_eq!(&gaps[..3], &[800, 640, 512]);
		assert!(gaps.windows(2).skip(3).all(|w| w[1] >= w[0]));
	}

	#[tokio::test(start_paused = true)]
	async fn test_sustained_errors_back_off_to_max_and_keep_polling() {
		let fetcher = MockFetcher::new(vec![Err(500)]);
		let scheduler = AdaptiveScheduler::new(fetcher.clone(), options(3));
		let failures = Arc::new(Mutex::new(Vec::new()));
		let sink = failures.clone();
		scheduler.set_error_hook(Arc::new(move |f: &PollFailure| {
			lock(&sink).push(f.consecutive_errors)
		}));
		let (callback, seen) = collector();
		let id = SubscriptionId::from("down");

		scheduler
			.schedule(subscription("down", PollProfile::REALTIME, callback))
			.unwrap();
		tokio::time::sleep(Duration::from_secs(60)).await;

		let times = lock(&fetcher.call_times).clone();
		let gaps: Vec<u128> = times.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
		assert_eq!(&gaps[..5], &[1_500, 2_250, 3_375, 5_000, 5_000]);
		assert!(gaps.iter().all(|gap| *gap <= 5_000));

		assert!(lock(&seen).is_empty());
		let recorded = lock(&failures).clone();
		assert_eq!(recorded.len(), times.len());
		assert!(recorded.windows(2).all(|w| w[1] == w[0] + 1));

		let state = scheduler.state(&id).unwrap();
		assert_eq!(state.current_interval_ms, 5_000);
		assert!(state.is_active);
		assert!(scheduler.is_scheduled(&id));
	}

	#[tokio::test(start_paused = true)]
	async fn test_recovery_resets_errors_and_delivers() {
		let fetcher = MockFetcher::new(vec![Err(502), Err(502), Ok(json!({"ok": true}))]);
		let scheduler = AdaptiveScheduler::new(fetcher.clone(), options(3));
		let (callback, seen) = collector();
		let id = SubscriptionId::from("flaky");

		scheduler
			.schedule(subscription("flaky", PollProfile::REALTIME, callback))
			.unwrap();
		// Fetches at 0, 1500 and 3750 ms.
		tokio::time::sleep(Duration::from_millis(4_000)).await;

		assert_eq!(*lock(&seen), vec![json!({"ok": true})]);
		let state = scheduler.state(&id).unwrap();
		assert_eq!(state.consecutive_errors, 0);
		assert_eq!(state.current_interval_ms, 1_800);
	}

	#[tokio::test(start_paused = true)]
	async fn test_non_adaptive_keeps_base_interval() {
		let mut responses: Vec<_> = (0..4).map(|i| Ok(json!(i))).collect();
		responses.push(Err(500));
		let fetcher = MockFetcher::new(responses);
		let scheduler = AdaptiveScheduler::new(
			fetcher.clone(),
			SchedulerOptions {
				adaptive: false,
				..SchedulerOptions::default()
			},
		);
		let (callback, _seen) = collector();
		scheduler
			.schedule(subscription("steady", PollProfile::REALTIME, callback))
			.unwrap();
		tokio::time::sleep(Duration::from_millis(7_500)).await;

		let started = lock(&fetcher.call_times)[0];
		let offsets: Vec<u128> = lock(&fetcher.call_times)
			.iter()
			.map(|t| (*t - started).as_millis())
			.collect();
		assert_eq!(offsets, (0..8).map(|i| i * 1_000).collect::<Vec<u128>>());
	}

	#[tokio::test(start_paused = true)]
	async fn test_unschedule_is_idempotent_and_releases_slot() {
		let fetcher =
			MockFetcher::new(vec![Ok(json!({"v": 1}))]).with_latency(Duration::from_secs(1));
		let scheduler = AdaptiveScheduler::new(fetcher.clone(), options(1));
		let (first_cb, first_seen) = collector();
		let (second_cb, second_seen) = collector();
		let first = SubscriptionId::from("first");
		let second = SubscriptionId::from("second");

		scheduler
			.schedule(subscription("first", PollProfile::REALTIME, first_cb))
			.unwrap();
		scheduler
			.schedule(subscription("second", PollProfile::REALTIME, second_cb))
			.unwrap();
		tokio::time::sleep(Duration::from_millis(100)).await;

		assert_eq!(scheduler.in_flight(), 1);
		assert_eq!(scheduler.waiting(), 1);
		assert_eq!(scheduler.phase(&first), Some(PollPhase::InFlight));
		assert_eq!(scheduler.phase(&second), Some(PollPhase::Waiting));

		assert!(scheduler.unschedule(&first));
		// The queued subscription inherits the slot immediately.
		assert_eq!(scheduler.in_flight(), 1);
		assert_eq!(scheduler.waiting(), 0);
		assert!(!scheduler.unschedule(&first));
		assert_eq!(scheduler.in_flight(), 1);
		assert_eq!(scheduler.state(&first), None);

		tokio::time::sleep(Duration::from_millis(1_500)).await;
		assert!(lock(&first_seen).is_empty());
		assert_eq!(lock(&second_seen).len(), 1);

		assert!(scheduler.unschedule(&second));
		assert_eq!(scheduler.in_flight(), 0);
		assert!(scheduler.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_panicking_callback_does_not_stop_polling() {
		let fetcher = MockFetcher::new(vec![Ok(json!(1)), Ok(json!(2)), Ok(json!(3))]);
		let scheduler = AdaptiveScheduler::new(fetcher.clone(), options(3));
		let calls = Arc::new(AtomicUsize::new(0));
		let counter = calls.clone();
		let callback: DataCallback = Arc::new(move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
			panic!("ui handler blew up");
		});

		scheduler
			.schedule(subscription("panicky", PollProfile::REALTIME, callback))
			.unwrap();
		tokio::time::sleep(Duration::from_millis(1_500)).await;

		assert_eq!(calls.load(Ordering::SeqCst), 3);
		assert!(scheduler.is_scheduled(&SubscriptionId::from("panicky")));
		assert_eq!(scheduler.in_flight(), 0);
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn test_unschedule_waits_for_running_callback() {
		let fetcher = MockFetcher::new(vec![Ok(json!({"v": 1}))]);
		let scheduler = AdaptiveScheduler::new(fetcher.clone(), options(1));
		let started = Arc::new(AtomicBool::new(false));
		let finished = Arc::new(AtomicBool::new(false));
		let (on_start, on_finish) = (started.clone(), finished.clone());
		let callback: DataCallback = Arc::new(move |_| {
			on_start.store(true, Ordering::SeqCst);
			std::thread::sleep(Duration::from_millis(200));
			on_finish.store(true, Ordering::SeqCst);
		});

		scheduler
			.schedule(subscription("slow", PollProfile::REALTIME, callback))
			.unwrap();
		while !started.load(Ordering::SeqCst) {
			tokio::time::sleep(Duration::from_millis(5)).await;
		}

		assert!(scheduler.unschedule(&SubscriptionId::from("slow")));
		assert!(finished.load(Ordering::SeqCst));
		assert!(scheduler.is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_callback_can_unschedule_itself() {
		let fetcher = MockFetcher::new(vec![Ok(json!(1)), Ok(json!(2)), Ok(json!(3))]);
		let scheduler = Arc::new(AdaptiveScheduler::new(fetcher.clone(), options(1)));
		let handle = Arc::downgrade(&scheduler);
		let calls = Arc::new(AtomicUsize::new(0));
		let counter = calls.clone();
		let callback: DataCallback = Arc::new(move |_| {
			counter.fetch_add(1, Ordering::SeqCst);
			if let Some(scheduler) = handle.upgrade() {
				scheduler.unschedule(&SubscriptionId::from("once"));
			}
		});

		scheduler
			.schedule(subscription("once", PollProfile::REALTIME, callback))
			.unwrap();
		tokio::time::sleep(Duration::from_secs(5)).await;

		assert_eq!(calls.load(Ordering::SeqCst), 1);
		assert_eq!(fetcher.calls(), 1);
		assert!(scheduler.is_empty());
		assert_eq!(scheduler.in_flight(), 0);
	}

	#[tokio::test]
	async fn test_invalid_profile_fails_fast() {
		let fetcher = MockFetcher::new(vec![]);
		let scheduler = AdaptiveScheduler::new(fetcher.clone(), options(3));
		let (callback, _seen) = collector();
		let mut profile = PollProfile::REALTIME;
		profile.min_ms = 2_000;

		let result = scheduler.schedule(subscription("bad", profile, callback));
		assert!(matches!(result, Err(SyncError::InvalidProfile(_))));
		assert!(scheduler.is_empty());
		tokio::task::yield_now().await;
		assert_eq!(fetcher.calls(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_stop_all_clears_everything() {
		let fetcher =
			MockFetcher::new(vec![Ok(json!(1))]).with_latency(Duration::from_millis(500));
		let scheduler = AdaptiveScheduler::new(fetcher.clone(), options(1));
		for name in ["a", "b", "c"] {
			let (callback, _seen) = collector();
			scheduler
				.schedule(subscription(name, PollProfile::MONITORING, callback))
				.unwrap();
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
		assert_eq!(scheduler.waiting(), 2);

		scheduler.stop_all();
		assert_eq!(scheduler.in_flight(), 0);
		assert_eq!(scheduler.waiting(), 0);
		let calls = fetcher.calls();
		tokio::time::sleep(Duration::from_secs(60)).await;
		assert_eq!(fetcher.calls(), calls);
	}

	#[tokio::test(start_paused = true)]
	async fn test_first_fetch_is_immediate() {
		let fetcher = MockFetcher::new(vec![Ok(json!(1))]);
		let scheduler = AdaptiveScheduler::new(fetcher.clone(), options(3));
		let (callback, _seen) = collector();
		let started = Instant::now();
		scheduler
			.schedule(subscription("now", PollProfile::LOW_PRIORITY, callback))
			.unwrap();
		tokio::time::sleep(Duration::from_millis(1)).await;
		assert_eq!(lock(&fetcher.call_times)[0], started);
	}
}
