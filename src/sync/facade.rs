//! Single entry point over the pull and push paths.
//!
//! Every subscribe call returns a [`SubscriptionGuard`]. Releasing the guard, explicitly or by
//! dropping it, stops the subscription's timer, frees its gate slot or queued wait, and drops its
//! topic registration before returning.

use super::change::ChangeDetector;
use super::interval::PollState;
use super::poller::{FixedIntervalPoller, FixedPoll};
use super::profile::PollProfile;
use super::scheduler::{AdaptiveScheduler, PollSubscription};
use super::types::{DataCallback, ErrorHook, PollFailure, SubscriptionId, SyncError, SyncMode};
use crate::backend::{Fetcher, HttpBackend, parse_api_base, resolve_locator};
use crate::config::SyncSettings;
use crate::stream::{
	ConnectionStatus, EVENT_CONNECTION, ListenerHandle, StreamClient, StreamEvent,
	TopicSubscription, build_transport,
};
use crate::utils::lock;

use reqwest::Url;
use serde_json::Value;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info};

struct FacadeInner {
	settings: SyncSettings,
	api_base: Url,
	scheduler: AdaptiveScheduler,
	fixed: FixedIntervalPoller,
	stream: StreamClient,
	on_error: Mutex<Option<ErrorHook>>,
}

/// Subscribe/unsubscribe front for polling and stream topics.
pub struct SyncFacade {
	inner: Arc<FacadeInner>,
}

impl SyncFacade {
	/// Assemble a facade from an injected fetcher and stream client.
	///
	/// # Errors
	/// `SyncError::InvalidLocator` if `settings.api_base_url` is not an absolute URL.
	pub fn new(
		settings: SyncSettings,
		fetcher: Arc<dyn Fetcher>,
		stream: StreamClient,
	) -> Result<Self, SyncError> {
		let api_base = parse_api_base(&settings.api_base_url)
			.map_err(|e| SyncError::InvalidLocator(e.to_string()))?;
		let scheduler = AdaptiveScheduler::new(fetcher.clone(), settings.scheduler_options());
		let fixed = FixedIntervalPoller::new(fetcher, settings.request_timeout);

		Ok(Self {
			inner: Arc::new(FacadeInner {
				settings,
				api_base,
				scheduler,
				fixed,
				stream,
				on_error: Mutex::new(None),
			}),
		})
	}

	/// Wire the HTTP backend and the configured stream transport.
	pub fn connect_http(settings: SyncSettings) -> Result<Self, SyncError> {
		let backend = Arc::new(HttpBackend::new(
			&settings.api_base_url,
			settings.request_timeout,
		)?);
		let transport = build_transport(settings.stream.transport, settings.request_timeout)?;
		let stream = StreamClient::new(settings.stream.clone(), transport, backend.clone());
		info!(
			"Sync layer for {} using {} stream at {}",
			settings.api_base_url, settings.stream.transport, settings.stream.endpoint
		);
		Self::new(settings, backend, stream)
	}

	pub fn settings(&self) -> &SyncSettings {
		&self.inner.settings
	}

	pub fn scheduler(&self) -> &AdaptiveScheduler {
		&self.inner.scheduler
	}

	pub fn stream(&self) -> &StreamClient {
		&self.inner.stream
	}

	/// Resolve a locator against the API base without subscribing.
	pub fn resolve(&self, locator: &str) -> Result<Url, SyncError> {
		resolve_locator(&self.inner.api_base, locator)
			.map_err(|e| SyncError::InvalidLocator(e.to_string()))
	}

	/// Poll `locator` adaptively under `profile`.
	///
	/// # Errors
	/// `InvalidLocator` or `InvalidProfile`, raised before anything is scheduled.
	pub fn subscribe_poll<F>(
		&self,
		locator: &str,
		profile: PollProfile,
		callback: F,
	) -> Result<SubscriptionGuard, SyncError>
	where
		F: Fn(Value) + Send + Sync + 'static,
	{
		let url = self.resolve(locator)?;
		profile.validate()?;

		let id = SubscriptionId::generate("poll");
		let callback: DataCallback = Arc::new(callback);
		self.inner.scheduler.schedule(PollSubscription {
			id: id.clone(),
			url: url.to_string(),
			profile,
			callback,
		})?;

		Ok(SubscriptionGuard::new(
			id,
			SyncMode::Poll,
			Release::Adaptive(Arc::downgrade(&self.inner)),
		))
	}

	/// Poll `locator` at a fixed cadence, without adaptation or the concurrency gate.
	pub fn subscribe_fixed<F>(
		&self,
		locator: &str,
		interval: Duration,
		callback: F,
	) -> Result<SubscriptionGuard, SyncError>
	where
		F: Fn(Value) + Send + Sync + 'static,
	{
		let url = self.resolve(locator)?;
		if interval.is_zero() {
			return Err(SyncError::InvalidProfile(
				"fixed interval must be positive".to_string(),
			));
		}

		let id = SubscriptionId::generate("fixed");
		let weak = Arc::downgrade(&self.inner);
		let forward: ErrorHook = Arc::new(move |failure: &PollFailure| {
			let hook = weak
				.upgrade()
				.and_then(|inner| lock(&inner.on_error).clone());
			if let Some(hook) = hook {
				hook(failure);
			}
		});

		self.inner.fixed.start(FixedPoll {
			id: id.clone(),
			url: url.to_string(),
			interval,
			on_data: Arc::new(callback),
			on_error: Some(forward),
		});

		Ok(SubscriptionGuard::new(
			id,
			SyncMode::Poll,
			Release::Fixed(Arc::downgrade(&self.inner)),
		))
	}

	/// Receive the body of every stream message for device topic `topic`.
	///
	/// With stream change detection enabled, a body whose content matches the previous one for
	/// this subscription is not delivered. The `timestamp` envelope field is ignored for that
	/// comparison.
	pub fn subscribe_stream<F>(&self, topic: &str, callback: F) -> Result<SubscriptionGuard, SyncError>
	where
		F: Fn(Value) + Send + Sync + 'static,
	{
		let detector = ChangeDetector::new(self.inner.settings.stream.change_detection);
		let last_hash: Mutex<Option<String>> = Mutex::new(None);
		let subscription = self.inner.stream.subscribe_topic(topic, move |event| {
			if detector.is_enabled() {
				let mut last = lock(&last_hash);
				let observation = detector.observe(last.as_deref(), &stream_content(&event.body));
				let changed = observation.is_changed();
				*last = Some(observation.into_hash());
				if !changed {
					return;
				}
			}
			callback(event.body.clone());
		})?;

		let id = SubscriptionId::generate("stream");
		info!("Stream subscription {} on topic {}", id, subscription.topic());
		Ok(SubscriptionGuard::new(
			id,
			SyncMode::Stream,
			Release::Topic(subscription),
		))
	}

	/// Install the hook that receives every failed poll, adaptive or fixed.
	pub fn on_error<F>(&self, hook: F)
	where
		F: Fn(&PollFailure) + Send + Sync + 'static,
	{
		let hook: ErrorHook = Arc::new(hook);
		*lock(&self.inner.on_error) = Some(hook.clone());
		self.inner.scheduler.set_error_hook(hook);
	}

	pub fn connect(&self) {
		self.inner.stream.connect();
	}

	pub fn connection_status(&self) -> ConnectionStatus {
		self.inner.stream.status()
	}

	/// Observe stream connection changes.
	pub fn on_connection<F>(&self, handler: F) -> ListenerHandle
	where
		F: Fn(&StreamEvent) + Send + Sync + 'static,
	{
		self.inner.stream.on(EVENT_CONNECTION, handler)
	}

	pub fn poll_state(&self, id: &SubscriptionId) -> Option<PollState> {
		self.inner.scheduler.state(id)
	}

	/// Stop every poll and disconnect the stream. Guards handed out earlier become no-ops.
	pub fn shutdown(&self) {
		self.inner.scheduler.stop_all();
		self.inner.fixed.stop_all();
		self.inner.stream.disconnect();
		info!("Sync layer shut down");
	}
}

/// Body of a stream message minus its `timestamp` envelope field.
fn stream_content(body: &Value) -> Value {
	let mut content = body.clone();
	if let Value::Object(fields) = &mut content {
		fields.remove("timestamp");
	}
	content
}

impl Drop for SyncFacade {
	fn drop(&mut self) {
		self.shutdown();
	}
}

enum Release {
	Adaptive(Weak<FacadeInner>),
	Fixed(Weak<FacadeInner>),
	Topic(TopicSubscription),
}

/// Scoped handle for one subscription. Dropping it unsubscribes.
#[must_use = "dropping the guard ends the subscription"]
pub struct SubscriptionGuard {
	id: SubscriptionId,
	mode: SyncMode,
	release: Mutex<Option<Release>>,
}

impl SubscriptionGuard {
	fn new(id: SubscriptionId, mode: SyncMode, release: Release) -> Self {
		Self {
			id,
			mode,
			release: Mutex::new(Some(release)),
		}
	}

	pub fn id(&self) -> &SubscriptionId {
		&self.id
	}

	pub fn mode(&self) -> SyncMode {
		self.mode
	}

	pub fn is_active(&self) -> bool {
		lock(&self.release).is_some()
	}

	/// End the subscription. Returns true on the first call only.
	pub fn unsubscribe(&self) -> bool {
		let Some(release) = lock(&self.release).take() else {
			return false;
		};
		match release {
			Release::Adaptive(inner) => {
				if let Some(inner) = inner.upgrade() {
					inner.scheduler.unschedule(&self.id);
				}
			}
			Release::Fixed(inner) => {
				if let Some(inner) = inner.upgrade() {
					inner.fixed.stop(&self.id);
				}
			}
			Release::Topic(subscription) => {
				subscription.unsubscribe();
			}
		}
		debug!("Released subscription {}", self.id);
		true
	}
}

impl Drop for SubscriptionGuard {
	fn drop(&mut self) {
		self.unsubscribe();
	}
}
