//! Fixed-interval polling.
//!
//! The simplest pull primitive: fetch immediately, then again `interval` after each fetch
//! settles. Because the next tick is only armed once the previous fetch has finished, a slow
//! request can never overlap the next one for the same subscription. There is no retry or
//! backoff here; failures are forwarded to the error hook and the cadence stays fixed.

use super::registry::TaskRegistry;
use super::types::{DataCallback, ErrorHook, PollFailure, SubscriptionId};
use crate::backend::{FetchError, Fetcher};
use crate::utils::invoke_guarded;

use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fetch `url` with a hard timeout. Expiry aborts the request and counts as a failure.
pub(crate) async fn fetch_with_timeout(
	fetcher: &dyn Fetcher,
	url: &str,
	timeout: Duration,
) -> Result<Value, FetchError> {
	match tokio::time::timeout(timeout, fetcher.fetch(url)).await {
		Ok(result) => result,
		Err(_) => Err(FetchError::Timeout(timeout)),
	}
}

/// A fixed-cadence subscription.
#[derive(Clone)]
pub struct FixedPoll {
	pub id: SubscriptionId,
	pub url: String,
	pub interval: Duration,
	pub on_data: DataCallback,
	pub on_error: Option<ErrorHook>,
}

struct FixedEntry {
	poll: FixedPoll,
	active: AtomicBool,
	consecutive_errors: AtomicU32,
}

/// Runs [`FixedPoll`] subscriptions, one task and one timer per id.
pub struct FixedIntervalPoller {
	fetcher: Arc<dyn Fetcher>,
	request_timeout: Duration,
	tasks: TaskRegistry<FixedEntry>,
}

impl FixedIntervalPoller {
	pub fn new(fetcher: Arc<dyn Fetcher>, request_timeout: Duration) -> Self {
		Self {
			fetcher,
			request_timeout,
			tasks: TaskRegistry::new(),
		}
	}

	/// Start polling. An already running subscription with the same id is stopped first.
	///
	/// Must be called from within a Tokio runtime.
	pub fn start(&self, poll: FixedPoll) {
		let id = poll.id.clone();
		info!(
			"Starting fixed poll {} on {} every {:?}",
			id, poll.url, poll.interval
		);

		let entry = Arc::new(FixedEntry {
			poll,
			active: AtomicBool::new(true),
			consecutive_errors: AtomicU32::new(0),
		});
		let handle = tokio::spawn(run_fixed(
			self.fetcher.clone(),
			self.request_timeout,
			entry.clone(),
		));

		if let Some(previous) = self.tasks.insert(id.clone(), entry, handle) {
			previous.active.store(false, Ordering::SeqCst);
			debug!("Replaced running fixed poll {}", id);
		}
	}

	/// Stop polling `id`. Returns false if it was not running.
	///
	/// The pending timer is cancelled before this returns; a fetch already in flight is
	/// discarded when it resolves.
	pub fn stop(&self, id: &SubscriptionId) -> bool {
		match self.tasks.remove(id) {
			Some(entry) => {
				entry.active.store(false, Ordering::SeqCst);
				info!("Stopped fixed poll {}", id);
				true
			}
			None => false,
		}
	}

	pub fn stop_all(&self) {
		for (id, entry) in self.tasks.drain() {
			entry.active.store(false, Ordering::SeqCst);
			debug!("Stopped fixed poll {}", id);
		}
	}

	pub fn is_running(&self, id: &SubscriptionId) -> bool {
		self.tasks.contains(id)
	}

	pub fn len(&self) -> usize {
		self.tasks.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}
}

impl Drop for FixedIntervalPoller {
	fn drop(&mut self) {
		self.stop_all();
	}
}

async fn run_fixed(fetcher: Arc<dyn Fetcher>, timeout: Duration, entry: Arc<FixedEntry>) {
	let poll = &entry.poll;
	loop {
		let outcome = fetch_with_timeout(fetcher.as_ref(), &poll.url, timeout).await;
		if !entry.active.load(Ordering::SeqCst) {
			debug!("Discarding fetch result for stopped poll {}", poll.id);
			return;
		}

		match outcome {
			Ok(payload) => {
				entry.consecutive_errors.store(0, Ordering::SeqCst);
				invoke_guarded(poll.id.as_str(), || (poll.on_data)(payload));
			}
			Err(error) => {
				let consecutive_errors = entry.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
				warn!("Fixed poll {} failed: {}", poll.id, error);
				if let Some(hook) = &poll.on_error {
					let failure = PollFailure {
						subscription_id: poll.id.clone(),
						url: poll.url.clone(),
						error,
						consecutive_errors,
					};
					invoke_guarded(poll.id.as_str(), || hook(&failure));
				}
			}
		}

		tokio::time::sleep(poll.interval).await;
	}
}
