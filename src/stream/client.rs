//! The shared event-stream connection.
//!
//! One [`StreamClient`] owns at most one live transport connection, driven by a single spawned
//! task. The driver opens the transport, pumps frames into the dispatcher, and on any failure
//! (open error, peer close, inactivity) decides through the [`ReconnectTracker`] whether to sleep
//! and retry or to give up. A generation counter ties each driver to the `connect()` call that
//! started it; results from a superseded driver are ignored.
//!
//! Topic registrations are out-of-band control calls. They are serialised through one control
//! queue so a register and a later unregister for the same topic reach the server in order.

use super::events::{
	EVENT_ALL, EVENT_COMMAND_RESULT, EVENT_CONNECTION, EventRegistry, KnownEvent, ListenerHandle,
	StreamEvent, normalize,
};
use super::reconnect::{ReconnectDecision, ReconnectTracker};
use super::transport::{FrameStream, Transport, TransportError};
use crate::backend::{CommandRequest, ControlError, ControlPlane};
use crate::config::StreamSettings;
use crate::sync::SyncError;
use crate::utils::{lock, random_hex_id};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
	Disconnected,
	Connecting,
	Connected,
	Reconnecting,
	Failed,
}

impl ConnectionStatus {
	pub fn as_str(&self) -> &'static str {
		match self {
			ConnectionStatus::Disconnected => "disconnected",
			ConnectionStatus::Connecting => "connecting",
			ConnectionStatus::Connected => "connected",
			ConnectionStatus::Reconnecting => "reconnecting",
			ConnectionStatus::Failed => "failed",
		}
	}
}

impl fmt::Display for ConnectionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Outcome of a server-side topic registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicRegistration {
	Registered,
	/// The control call failed; the topic stays pending and is retried.
	Queued,
}

/// A command sent to a device and awaiting its `command_result`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandTicket {
	pub command_id: String,
	pub device_id: String,
	pub command: String,
	pub issued_at: DateTime<Utc>,
}

struct PendingCommand {
	ticket: CommandTicket,
	expires_at: Instant,
}

enum ControlOp {
	Register(String),
	Unregister(String),
}

struct ConnectionState {
	status: ConnectionStatus,
	tracker: ReconnectTracker,
	generation: u64,
	driver: Option<JoinHandle<()>>,
}

struct StreamInner {
	client_id: String,
	settings: StreamSettings,
	transport: Arc<dyn Transport>,
	control: Arc<dyn ControlPlane>,
	listeners: EventRegistry,
	topics: EventRegistry,
	connection: Mutex<ConnectionState>,
	/// Topics whose registration failed, with the failure count since they were queued.
	pending_topics: Mutex<BTreeMap<String, u32>>,
	pending_commands: Mutex<HashMap<String, PendingCommand>>,
	control_queue: Mutex<Option<mpsc::UnboundedSender<ControlOp>>>,
}

/// Handle to the shared stream connection. Clones share the same connection.
#[derive(Clone)]
pub struct StreamClient {
	inner: Arc<StreamInner>,
}

fn validate_topic(topic: &str) -> Result<String, SyncError> {
	let trimmed = topic.trim();
	if trimmed.is_empty() {
		return Err(SyncError::InvalidTopic(
			"topic must be a non-empty device id".to_string(),
		));
	}
	Ok(trimmed.to_string())
}

impl StreamClient {
	/// Create a disconnected client with a random 16-byte hex client id.
	pub fn new(
		settings: StreamSettings,
		transport: Arc<dyn Transport>,
		control: Arc<dyn ControlPlane>,
	) -> Self {
		Self::with_client_id(random_hex_id(16), settings, transport, control)
	}

	pub fn with_client_id(
		client_id: impl Into<String>,
		settings: StreamSettings,
		transport: Arc<dyn Transport>,
		control: Arc<dyn ControlPlane>,
	) -> Self {
		let tracker = ReconnectTracker::new(settings.reconnect_policy());
		Self {
			inner: Arc::new(StreamInner {
				client_id: client_id.into(),
				settings,
				transport,
				control,
				listeners: EventRegistry::new(),
				topics: EventRegistry::new(),
				connection: Mutex::new(ConnectionState {
					status: ConnectionStatus::Disconnected,
					tracker,
					generation: 0,
					driver: None,
				}),
				pending_topics: Mutex::new(BTreeMap::new()),
				pending_commands: Mutex::new(HashMap::new()),
				control_queue: Mutex::new(None),
			}),
		}
	}

	pub fn client_id(&self) -> &str {
		&self.inner.client_id
	}

	pub fn settings(&self) -> &StreamSettings {
		&self.inner.settings
	}

	/// Endpoint URL with this client's id attached.
	pub fn stream_url(&self) -> String {
		self.inner.stream_url()
	}

	pub fn status(&self) -> ConnectionStatus {
		lock(&self.inner.connection).status
	}

	pub fn is_connected(&self) -> bool {
		self.status() == ConnectionStatus::Connected
	}

	/// Failures since the last successful open.
	pub fn reconnect_attempt(&self) -> u32 {
		lock(&self.inner.connection).tracker.attempt()
	}

	/// Start the connection driver.
	///
	/// No-op unless the client is `Disconnected` or `Failed`. Must be called from within a tokio
	/// runtime.
	pub fn connect(&self) {
		let Ok(runtime) = Handle::try_current() else {
			error!("StreamClient::connect called outside a tokio runtime");
			return;
		};

		let mut conn = lock(&self.inner.connection);
		match conn.status {
			ConnectionStatus::Disconnected | ConnectionStatus::Failed => {}
			status => {
				debug!("connect() ignored, stream is {}", status);
				return;
			}
		}

		conn.generation += 1;
		conn.tracker.reset();
		conn.status = ConnectionStatus::Connecting;
		let generation = conn.generation;
		conn.driver = Some(runtime.spawn(run_connection(
			Arc::downgrade(&self.inner),
			generation,
		)));
		info!(
			"Connecting {} stream for client {}",
			self.inner.transport.name(),
			self.inner.client_id
		);
	}

	/// Close the connection and cancel any pending reconnect. Idempotent.
	pub fn disconnect(&self) {
		{
			let mut conn = lock(&self.inner.connection);
			if conn.status == ConnectionStatus::Disconnected {
				return;
			}
			conn.generation += 1;
			if let Some(driver) = conn.driver.take() {
				driver.abort();
			}
			conn.status = ConnectionStatus::Disconnected;
			conn.tracker.reset();
		}

		info!("Stream disconnected for client {}", self.inner.client_id);
		self.inner.emit_connection(ConnectionStatus::Disconnected, json!({}));
	}

	/// Register a handler for an event type, `"event"` for all messages or `"connection"` for
	/// status changes.
	pub fn on<F>(&self, event_type: &str, handler: F) -> ListenerHandle
	where
		F: Fn(&StreamEvent) + Send + Sync + 'static,
	{
		self.inner.listeners.on(event_type, handler)
	}

	pub fn listener_count(&self, event_type: &str) -> usize {
		self.inner.listeners.listener_count(event_type)
	}

	/// Ask the server to route `device_id` events to this client.
	///
	/// Works in any connection state. A failed call leaves the topic pending. While connected it
	/// is retried on the reconnect backoff schedule, up to the reconnect attempt limit; every
	/// successful connect retries all pending topics again.
	pub async fn subscribe_to_device(
		&self,
		device_id: &str,
	) -> Result<TopicRegistration, SyncError> {
		let topic = validate_topic(device_id)?;
		Ok(self.inner.register(&topic).await)
	}

	/// Ask the server to stop routing `device_id` events to this client.
	pub async fn unsubscribe_from_device(&self, device_id: &str) -> Result<(), SyncError> {
		let topic = validate_topic(device_id)?;
		self.inner.unregister(&topic).await?;
		Ok(())
	}

	/// Register a local handler for one device topic.
	///
	/// The first handler for a topic registers it with the server; releasing the last one
	/// unregisters it.
	pub fn subscribe_topic<F>(&self, topic: &str, handler: F) -> Result<TopicSubscription, SyncError>
	where
		F: Fn(&StreamEvent) + Send + Sync + 'static,
	{
		let topic = validate_topic(topic)?;
		let first = self.inner.topics.listener_count(&topic) == 0;
		let listener = self.inner.topics.on(&topic, handler);
		if first {
			self.inner.enqueue(ControlOp::Register(topic.clone()));
		}
		debug!("Added handler for stream topic {}", topic);

		Ok(TopicSubscription {
			client: self.clone(),
			topic,
			listener,
			released: AtomicBool::new(false),
		})
	}

	pub fn topic_handler_count(&self, topic: &str) -> usize {
		self.inner.topics.listener_count(topic)
	}

	/// Topics whose registration failed and has not yet been retried successfully.
	pub fn pending_topics(&self) -> Vec<String> {
		lock(&self.inner.pending_topics).keys().cloned().collect()
	}

	/// Send a command to a device. Its confirmation arrives later as a `command_result` event.
	pub async fn send_command(
		&self,
		device_id: &str,
		command: &str,
		params: Value,
	) -> Result<CommandTicket, SyncError> {
		let device_id = validate_topic(device_id)?;
		let command = command.trim();
		if command.is_empty() {
			return Err(SyncError::InvalidCommand(
				"command name must not be empty".to_string(),
			));
		}

		let request = CommandRequest {
			command_id: random_hex_id(8),
			device_id: device_id.clone(),
			command: command.to_string(),
			params,
		};
		let ticket = CommandTicket {
			command_id: request.command_id.clone(),
			device_id,
			command: request.command.clone(),
			issued_at: Utc::now(),
		};

		// Tracked before sending so a fast confirmation is still correlated.
		self.inner.expire_commands();
		lock(&self.inner.pending_commands).insert(
			ticket.command_id.clone(),
			PendingCommand {
				ticket: ticket.clone(),
				expires_at: Instant::now() + self.inner.settings.command_timeout,
			},
		);
		if let Err(e) = self
			.inner
			.control
			.send_command(&self.inner.client_id, &request)
			.await
		{
			lock(&self.inner.pending_commands).remove(&ticket.command_id);
			warn!("Command {} to {} failed: {}", ticket.command, ticket.device_id, e);
			return Err(e.into());
		}

		info!(
			"Sent command {} ({}) to device {}",
			ticket.command, ticket.command_id, ticket.device_id
		);
		Ok(ticket)
	}

	/// Commands without a `command_result` yet, oldest first. Commands older than
	/// `command_timeout` are dropped.
	pub fn pending_commands(&self) -> Vec<CommandTicket> {
		self.inner.expire_commands();
		let mut tickets: Vec<CommandTicket> = lock(&self.inner.pending_commands)
			.values()
			.map(|pending| pending.ticket.clone())
			.collect();
		tickets.sort_by_key(|ticket| ticket.issued_at);
		tickets
	}

	/// Parse and dispatch one raw frame as if it had arrived on the stream.
	pub fn dispatch_frame(&self, frame: &str) {
		self.inner.dispatch_frame(frame);
	}
}

impl StreamInner {
	fn stream_url(&self) -> String {
		let separator = if self.settings.endpoint.contains('?') {
			'&'
		} else {
			'?'
		};
		format!(
			"{}{}clientId={}",
			self.settings.endpoint, separator, self.client_id
		)
	}

	fn is_current(&self, generation: u64) -> bool {
		lock(&self.connection).generation == generation
	}

	fn emit_connection(&self, status: ConnectionStatus, details: Value) {
		let event = StreamEvent::connection(status.as_str(), details);
		self.listeners.emit(EVENT_CONNECTION, &event);
	}

	fn mark_connected(self: &Arc<Self>, generation: u64) -> bool {
		{
			let mut conn = lock(&self.connection);
			if conn.generation != generation {
				return false;
			}
			conn.status = ConnectionStatus::Connected;
			conn.tracker.reset();
		}

		info!("Stream connected for client {}", self.client_id);
		self.emit_connection(
			ConnectionStatus::Connected,
			json!({ "clientId": self.client_id }),
		);

		let queued = std::mem::take(&mut *lock(&self.pending_topics));
		for topic in queued.into_keys() {
			debug!("Retrying queued registration for topic {}", topic);
			self.enqueue(ControlOp::Register(topic));
		}
		true
	}

	/// Returns the delay before the next attempt, or `None` when the driver should stop.
	fn mark_failed(&self, generation: u64, cause: &TransportError) -> Option<Duration> {
		let decision = {
			let mut conn = lock(&self.connection);
			if conn.generation != generation || conn.status == ConnectionStatus::Disconnected {
				return None;
			}
			let decision = conn.tracker.on_failure();
			match decision {
				ReconnectDecision::Retry { .. } => conn.status = ConnectionStatus::Reconnecting,
				ReconnectDecision::GiveUp { .. } => {
					conn.status = ConnectionStatus::Failed;
					conn.driver = None;
				}
			}
			decision
		};

		match decision {
			ReconnectDecision::Retry { attempt, delay } => {
				warn!(
					"Stream connection lost ({}), reconnect attempt {} in {:?}",
					cause, attempt, delay
				);
				self.emit_connection(
					ConnectionStatus::Reconnecting,
					json!({
						"attempt": attempt,
						"delayMs": delay.as_millis() as u64,
						"error": cause.to_string(),
					}),
				);
				Some(delay)
			}
			ReconnectDecision::GiveUp { attempts } => {
				error!(
					"Stream connection failed after {} attempts: {}",
					attempts, cause
				);
				self.emit_connection(
					ConnectionStatus::Failed,
					json!({ "attempts": attempts, "error": cause.to_string() }),
				);
				None
			}
		}
	}

	fn begin_attempt(&self, generation: u64) -> bool {
		let mut conn = lock(&self.connection);
		if conn.generation != generation || conn.status != ConnectionStatus::Reconnecting {
			return false;
		}
		conn.status = ConnectionStatus::Connecting;
		debug!("Reconnect attempt {} starting", conn.tracker.attempt());
		true
	}

	fn dispatch_frame(&self, frame: &str) {
		let event = match StreamEvent::parse(frame) {
			Ok(event) => event,
			Err(e) => {
				warn!("Dropping malformed stream frame: {}", e);
				return;
			}
		};
		if event.is_ping() {
			trace!("Stream keepalive");
			return;
		}
		self.dispatch(&event);
	}

	fn dispatch(&self, event: &StreamEvent) {
		self.listeners.emit(EVENT_ALL, event);
		self.listeners.emit(&event.event_type, event);

		match KnownEvent::from_type(&event.event_type) {
			Some(known) => match normalize(known, event) {
				Some(synthetic) => {
					if synthetic.event_type == EVENT_COMMAND_RESULT {
						self.resolve_command(&synthetic);
					}
					self.listeners.emit(&synthetic.event_type, &synthetic);
				}
				None => debug!(
					"Stream event {} lacks fields for normalisation",
					event.event_type
				),
			},
			None => debug!("Unrecognised stream event type: {}", event.event_type),
		}

		if let Some(device_id) = &event.device_id {
			self.topics.emit(device_id, event);
		}
	}

	fn resolve_command(&self, result: &StreamEvent) {
		let Some(command_id) = result.command_id() else {
			return;
		};
		if let Some(pending) = lock(&self.pending_commands).remove(&command_id) {
			debug!(
				"Command {} ({}) resolved: {}",
				pending.ticket.command,
				command_id,
				result.status().unwrap_or("unknown")
			);
		}
	}

	fn expire_commands(&self) {
		let now = Instant::now();
		lock(&self.pending_commands).retain(|command_id, pending| {
			let live = pending.expires_at > now;
			if !live {
				warn!(
					"Command {} ({}) to {} got no result within {:?}",
					pending.ticket.command,
					command_id,
					pending.ticket.device_id,
					self.settings.command_timeout
				);
			}
			live
		});
	}

	async fn register(self: &Arc<Self>, topic: &str) -> TopicRegistration {
		match self.control.register_topic(&self.client_id, topic).await {
			Ok(()) => {
				lock(&self.pending_topics).remove(topic);
				TopicRegistration::Registered
			}
			Err(e) => {
				let failures = {
					let mut pending = lock(&self.pending_topics);
					let failures = pending.entry(topic.to_string()).or_insert(0);
					*failures += 1;
					*failures
				};
				warn!(
					"Failed to register topic {} ({} failures): {}",
					topic, failures, e
				);
				self.schedule_registration_retry(topic, failures);
				TopicRegistration::Queued
			}
		}
	}

	/// Retry a pending topic after a backoff delay, if the stream is connected now.
	/// Otherwise the next successful connect picks it up.
	fn schedule_registration_retry(self: &Arc<Self>, topic: &str, failures: u32) {
		if lock(&self.connection).status != ConnectionStatus::Connected {
			return;
		}
		let policy = self.settings.reconnect_policy();
		if failures >= policy.max_attempts {
			warn!(
				"Topic {} left pending until the next connect after {} failures",
				topic, failures
			);
			return;
		}
		let Ok(runtime) = Handle::try_current() else {
			return;
		};

		let delay = policy.delay_for(failures);
		let inner = Arc::downgrade(self);
		let topic = topic.to_string();
		debug!("Retrying registration for topic {} in {:?}", topic, delay);
		runtime.spawn(async move {
			tokio::time::sleep(delay).await;
			let Some(inner) = inner.upgrade() else {
				return;
			};
			let still_pending = lock(&inner.pending_topics).contains_key(&topic);
			if still_pending && lock(&inner.connection).status == ConnectionStatus::Connected {
				inner.enqueue(ControlOp::Register(topic));
			}
		});
	}

	async fn unregister(&self, topic: &str) -> Result<(), ControlError> {
		lock(&self.pending_topics).remove(topic);
		self.control.unregister_topic(&self.client_id, topic).await
	}

	fn enqueue(self: &Arc<Self>, op: ControlOp) {
		let mut queue = lock(&self.control_queue);
		let op = match queue.as_ref() {
			Some(sender) => match sender.send(op) {
				Ok(()) => return,
				Err(mpsc::error::SendError(op)) => op,
			},
			None => op,
		};

		let Ok(runtime) = Handle::try_current() else {
			warn!("No tokio runtime for topic control calls");
			if let ControlOp::Register(topic) = op {
				lock(&self.pending_topics).entry(topic).or_insert(0);
			}
			return;
		};
		let (sender, receiver) = mpsc::unbounded_channel();
		runtime.spawn(run_control_queue(Arc::downgrade(self), receiver));
		if sender.send(op).is_err() {
			warn!("Topic control queue closed unexpectedly");
		}
		*queue = Some(sender);
	}
}

async fn run_control_queue(
	inner: Weak<StreamInner>,
	mut ops: mpsc::UnboundedReceiver<ControlOp>,
) {
	while let Some(op) = ops.recv().await {
		let Some(inner) = inner.upgrade() else {
			return;
		};
		match op {
			ControlOp::Register(topic) => {
				inner.register(&topic).await;
			}
			ControlOp::Unregister(topic) => {
				if let Err(e) = inner.unregister(&topic).await {
					warn!("Failed to unregister topic {}: {}", topic, e);
				}
			}
		}
	}
}

async fn run_connection(inner: Weak<StreamInner>, generation: u64) {
	loop {
		let Some((transport, url, inactivity)) = inner.upgrade().map(|inner| {
			(
				inner.transport.clone(),
				inner.stream_url(),
				inner.settings.inactivity_timeout,
			)
		}) else {
			return;
		};

		let cause = match transport.open(&url).await {
			Ok(frames) => {
				let Some(strong) = inner.upgrade() else {
					return;
				};
				if !strong.mark_connected(generation) {
					return;
				}
				drop(strong);
				pump(&inner, generation, frames, inactivity).await
			}
			Err(e) => e,
		};

		let Some(strong) = inner.upgrade() else {
			return;
		};
		let Some(delay) = strong.mark_failed(generation, &cause) else {
			return;
		};
		drop(strong);

		tokio::time::sleep(delay).await;

		let Some(strong) = inner.upgrade() else {
			return;
		};
		if !strong.begin_attempt(generation) {
			return;
		}
	}
}

/// Dispatch frames until the stream fails, ends, or goes quiet.
async fn pump(
	inner: &Weak<StreamInner>,
	generation: u64,
	mut frames: FrameStream,
	inactivity: Duration,
) -> TransportError {
	let mut last_frame = Instant::now();
	loop {
		let idle = tokio::time::sleep_until(last_frame + inactivity);
		tokio::select! {
			frame = frames.next() => {
				let Some(strong) = inner.upgrade() else {
					return TransportError::Closed;
				};
				if !strong.is_current(generation) {
					return TransportError::Closed;
				}
				match frame {
					Some(Ok(text)) => {
						last_frame = Instant::now();
						strong.dispatch_frame(&text);
					}
					Some(Err(e)) => return e,
					None => return TransportError::Closed,
				}
			}
			_ = idle => {
				return TransportError::Inactive(inactivity);
			}
		}
	}
}

/// Local handler for one device topic. Dropping it releases the handler.
pub struct TopicSubscription {
	client: StreamClient,
	topic: String,
	listener: ListenerHandle,
	released: AtomicBool,
}

impl TopicSubscription {
	pub fn topic(&self) -> &str {
		&self.topic
	}

	/// Remove the handler; unregisters the topic if it was the last one. Idempotent.
	pub fn unsubscribe(&self) -> bool {
		if self.released.swap(true, Ordering::SeqCst) {
			return false;
		}
		self.listener.unsubscribe();
		if self.client.inner.topics.listener_count(&self.topic) == 0 {
			self.client
				.inner
				.enqueue(ControlOp::Unregister(self.topic.clone()));
		}
		debug!("Removed handler for stream topic {}", self.topic);
		true
	}
}

impl Drop for TopicSubscription {
	fn drop(&mut self) {
		self.unsubscribe();
	}
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use async_trait::async_trait;
	use std::collections::VecDeque;

	type Session = mpsc::UnboundedSender<Result<String, TransportError>>;

	/// Transport whose opens follow a script; an empty script fails every open.
	#[derive(Default)]
	pub(crate) struct ScriptedTransport {
		script: Mutex<VecDeque<Option<mpsc::UnboundedReceiver<Result<String, TransportError>>>>>,
		opens: Mutex<Vec<(String, Instant)>>,
	}

	impl ScriptedTransport {
		pub(crate) fn new() -> Arc<Self> {
			Arc::new(Self::default())
		}

		pub(crate) fn push_failure(&self) {
			lock(&self.script).push_back(None);
		}

		pub(crate) fn push_session(&self) -> Session {
			let (tx, rx) = mpsc::unbounded_channel();
			lock(&self.script).push_back(Some(rx));
			tx
		}

		pub(crate) fn open_count(&self) -> usize {
			lock(&self.opens).len()
		}

		pub(crate) fn open_urls(&self) -> Vec<String> {
			lock(&self.opens).iter().map(|(url, _)| url.clone()).collect()
		}

		fn open_times(&self) -> Vec<Instant> {
			lock(&self.opens).iter().map(|(_, at)| *at).collect()
		}
	}

	#[async_trait]
	impl Transport for ScriptedTransport {
		async fn open(&self, url: &str) -> Result<FrameStream, TransportError> {
			lock(&self.opens).push((url.to_string(), Instant::now()));
			let next = lock(&self.script).pop_front().flatten();
			match next {
				Some(rx) => Ok(Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
					rx.recv().await.map(|item| (item, rx))
				}))),
				None => Err(TransportError::StatusError(503)),
			}
		}

		fn name(&self) -> &'static str {
			"scripted"
		}
	}

	#[derive(Default)]
	pub(crate) struct MockControl {
		ops: Mutex<Vec<String>>,
		pub(crate) fail_registrations: AtomicBool,
		pub(crate) fail_commands: AtomicBool,
	}

	impl MockControl {
		pub(crate) fn new() -> Arc<Self> {
			Arc::new(Self::default())
		}

		pub(crate) fn ops(&self) -> Vec<String> {
			lock(&self.ops).clone()
		}
	}

	fn rejected() -> ControlError {
		ControlError::Rejected {
			status: 503,
			message: "unavailable".to_string(),
		}
	}

	#[async_trait]
	impl ControlPlane for MockControl {
		async fn register_topic(&self, _client_id: &str, topic: &str) -> Result<(), ControlError> {
			if self.fail_registrations.load(Ordering::SeqCst) {
				lock(&self.ops).push(format!("register-failed:{}", topic));
				return Err(rejected());
			}
			lock(&self.ops).push(format!("register:{}", topic));
			Ok(())
		}

		async fn unregister_topic(&self, _client_id: &str, topic: &str) -> Result<(), ControlError> {
			lock(&self.ops).push(format!("unregister:{}", topic));
			Ok(())
		}

		async fn send_command(
			&self,
			_client_id: &str,
			request: &CommandRequest,
		) -> Result<(), ControlError> {
			if self.fail_commands.load(Ordering::SeqCst) {
				return Err(rejected());
			}
			lock(&self.ops).push(format!("command:{}:{}", request.device_id, request.command));
			Ok(())
		}
	}

	pub(crate) async fn settle() {
		for _ in 0..20 {
			tokio::task::yield_now().await;
		}
	}

	fn client_with(
		settings: StreamSettings,
		transport: &Arc<ScriptedTransport>,
		control: &Arc<MockControl>,
	) -> StreamClient {
		StreamClient::with_client_id("c-1", settings, transport.clone(), control.clone())
	}

	fn connection_log(client: &StreamClient) -> (ListenerHandle, Arc<Mutex<Vec<Value>>>) {
		let log = Arc::new(Mutex::new(Vec::new()));
		let sink = log.clone();
		let handle = client.on(EVENT_CONNECTION, move |event| lock(&sink).push(event.body.clone()));
		(handle, log)
	}

	fn statuses(log: &Arc<Mutex<Vec<Value>>>) -> Vec<String> {
		lock(log)
			.iter()
			.map(|body| body["status"].as_str().unwrap_or_default().to_string())
			.collect()
	}

	#[tokio::test(start_paused = true)]
	async fn test_connect_and_dispatch() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let session = transport.push_session();
		let client = client_with(StreamSettings::default(), &transport, &control);

		let seen = Arc::new(Mutex::new(Vec::new()));
		let s = seen.clone();
		let _all = client.on(EVENT_ALL, move |e| lock(&s).push(format!("event:{}", e.event_type)));
		let s = seen.clone();
		let _hb = client.on("heartbeat", move |_| lock(&s).push("heartbeat".to_string()));
		let s = seen.clone();
		let _update = client.on("device_update", move |e| {
			lock(&s).push(format!("device_update:{}", e.body["status"].as_str().unwrap_or("")))
		});
		let s = seen.clone();
		let _ping = client.on("ping", move |_| lock(&s).push("ping".to_string()));

		client.connect();
		settle().await;
		assert_eq!(client.status(), ConnectionStatus::Connected);
		assert_eq!(
			transport.open_urls(),
			vec!["http://localhost:3000/api/events/stream?clientId=c-1"]
		);

		for frame in [
			r#"{"type":"ping"}"#,
			r#"{"type":"heartbeat","deviceId":"pod-1"}"#,
			r#"{"type":"lap_completed","deviceId":"pod-1"}"#,
			"not json",
		] {
			session.send(Ok(frame.to_string())).unwrap();
		}
		settle().await;

		assert_eq!(
			*lock(&seen),
			vec![
				"event:heartbeat",
				"heartbeat",
				"device_update:online",
				"event:lap_completed"
			]
		);
		assert_eq!(client.status(), ConnectionStatus::Connected);
	}

	#[tokio::test(start_paused = true)]
	async fn test_ten_failures_back_off_then_fail() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let client = client_with(StreamSettings::default(), &transport, &control);
		let (_handle, log) = connection_log(&client);

		client.connect();
		tokio::time::sleep(Duration::from_secs(200)).await;

		assert_eq!(transport.open_count(), 10);
		assert_eq!(client.status(), ConnectionStatus::Failed);

		let times = transport.open_times();
		let gaps: Vec<u64> = times
			.windows(2)
			.map(|w| (w[1] - w[0]).as_millis() as u64)
			.collect();
		assert_eq!(
			gaps,
			vec![1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000, 30_000, 30_000]
		);

		let events = lock(&log).clone();
		assert_eq!(events.len(), 10);
		for (i, body) in events[..9].iter().enumerate() {
			assert_eq!(body["status"], "reconnecting");
			assert_eq!(body["attempt"], i as u64 + 1);
		}
		assert_eq!(events[0]["delayMs"], 1_000);
		assert_eq!(events[3]["delayMs"], 8_000);
		assert_eq!(events[9]["status"], "failed");
		assert_eq!(events[9]["attempts"], 10);

		tokio::time::sleep(Duration::from_secs(100)).await;
		assert_eq!(transport.open_count(), 10);
	}

	#[tokio::test(start_paused = true)]
	async fn test_reconnect_after_close_resets_attempt() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let first = transport.push_session();
		transport.push_failure();
		let _second = transport.push_session();
		let client = client_with(StreamSettings::default(), &transport, &control);
		let (_handle, log) = connection_log(&client);

		client.connect();
		settle().await;
		assert!(client.is_connected());

		drop(first);
		settle().await;
		assert_eq!(client.status(), ConnectionStatus::Reconnecting);
		assert_eq!(client.reconnect_attempt(), 1);

		tokio::time::sleep(Duration::from_millis(1_001)).await;
		assert_eq!(client.reconnect_attempt(), 2);

		tokio::time::sleep(Duration::from_millis(2_001)).await;
		assert!(client.is_connected());
		assert_eq!(client.reconnect_attempt(), 0);
		assert_eq!(
			statuses(&log),
			vec!["connected", "reconnecting", "reconnecting", "connected"]
		);
	}

	#[tokio::test(start_paused = true)]
	async fn test_inactivity_triggers_reconnect_and_pings_keep_alive() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let session = transport.push_session();
		let settings = StreamSettings {
			inactivity_timeout: Duration::from_secs(5),
			..StreamSettings::default()
		};
		let client = client_with(settings, &transport, &control);

		client.connect();
		settle().await;

		for _ in 0..4 {
			tokio::time::sleep(Duration::from_secs(2)).await;
			session.send(Ok(r#"{"type":"ping"}"#.to_string())).unwrap();
			settle().await;
		}
		tokio::time::sleep(Duration::from_secs(4)).await;
		assert!(client.is_connected());

		tokio::time::sleep(Duration::from_secs(2)).await;
		assert_eq!(client.status(), ConnectionStatus::Reconnecting);
		assert!(client.reconnect_attempt() >= 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_disconnect_cancels_pending_reconnect() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let client = client_with(StreamSettings::default(), &transport, &control);
		let (_handle, log) = connection_log(&client);

		client.connect();
		settle().await;
		assert_eq!(client.status(), ConnectionStatus::Reconnecting);

		client.disconnect();
		client.disconnect();
		assert_eq!(client.status(), ConnectionStatus::Disconnected);
		assert_eq!(client.reconnect_attempt(), 0);

		tokio::time::sleep(Duration::from_secs(10)).await;
		assert_eq!(transport.open_count(), 1);
		assert_eq!(statuses(&log), vec!["reconnecting", "disconnected"]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_connect_is_idempotent_while_active() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let _session = transport.push_session();
		let client = client_with(StreamSettings::default(), &transport, &control);

		client.connect();
		client.connect();
		settle().await;
		client.connect();
		settle().await;

		assert_eq!(transport.open_count(), 1);
		assert!(client.is_connected());
	}

	#[tokio::test(start_paused = true)]
	async fn test_connect_after_failure_starts_over() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let settings = StreamSettings {
			max_reconnect_attempts: 2,
			..StreamSettings::default()
		};
		let client = client_with(settings, &transport, &control);

		client.connect();
		tokio::time::sleep(Duration::from_secs(10)).await;
		assert_eq!(client.status(), ConnectionStatus::Failed);
		assert_eq!(transport.open_count(), 2);

		client.connect();
		settle().await;
		assert_eq!(transport.open_count(), 3);
		assert_eq!(client.status(), ConnectionStatus::Reconnecting);
		assert_eq!(client.reconnect_attempt(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn test_topic_subscribed_before_connect_receives_events() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let session = transport.push_session();
		let client = client_with(StreamSettings::default(), &transport, &control);

		let received = Arc::new(Mutex::new(Vec::new()));
		let sink = received.clone();
		let _sub = client
			.subscribe_topic("pod-9", move |e| lock(&sink).push(e.event_type.clone()))
			.unwrap();
		settle().await;
		assert_eq!(control.ops(), vec!["register:pod-9"]);

		client.connect();
		settle().await;
		session
			.send(Ok(r#"{"type":"device_registered","deviceId":"pod-9"}"#.to_string()))
			.unwrap();
		session
			.send(Ok(r#"{"type":"device_registered","deviceId":"pod-3"}"#.to_string()))
			.unwrap();
		settle().await;

		assert_eq!(*lock(&received), vec!["device_registered"]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_failed_registration_retried_after_connect() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let _session = transport.push_session();
		let client = client_with(StreamSettings::default(), &transport, &control);

		control.fail_registrations.store(true, Ordering::SeqCst);
		assert_eq!(
			client.subscribe_to_device("pod-1").await.unwrap(),
			TopicRegistration::Queued
		);
		assert_eq!(client.pending_topics(), vec!["pod-1"]);

		control.fail_registrations.store(false, Ordering::SeqCst);
		client.connect();
		settle().await;

		assert_eq!(control.ops(), vec!["register-failed:pod-1", "register:pod-1"]);
		assert!(client.pending_topics().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_unsubscribe_from_device_drops_queued_registration() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let _session = transport.push_session();
		let client = client_with(StreamSettings::default(), &transport, &control);

		control.fail_registrations.store(true, Ordering::SeqCst);
		assert_eq!(
			client.subscribe_to_device("pod-1").await.unwrap(),
			TopicRegistration::Queued
		);
		client.unsubscribe_from_device("pod-1").await.unwrap();
		assert!(client.pending_topics().is_empty());

		control.fail_registrations.store(false, Ordering::SeqCst);
		client.connect();
		settle().await;
		assert!(client.is_connected());

		assert_eq!(control.ops(), vec!["register-failed:pod-1", "unregister:pod-1"]);
		assert!(matches!(
			client.unsubscribe_from_device(" ").await,
			Err(SyncError::InvalidTopic(_))
		));
	}

	#[tokio::test(start_paused = true)]
	async fn test_failed_registration_retried_while_connected() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let _session = transport.push_session();
		let client = client_with(StreamSettings::default(), &transport, &control);

		client.connect();
		settle().await;
		assert!(client.is_connected());

		control.fail_registrations.store(true, Ordering::SeqCst);
		assert_eq!(
			client.subscribe_to_device("pod-6").await.unwrap(),
			TopicRegistration::Queued
		);

		// First retry after 1s fails again; the second waits 2s more.
		tokio::time::sleep(Duration::from_millis(1_001)).await;
		settle().await;
		assert_eq!(
			control.ops(),
			vec!["register-failed:pod-6", "register-failed:pod-6"]
		);
		assert_eq!(client.pending_topics(), vec!["pod-6"]);

		control.fail_registrations.store(false, Ordering::SeqCst);
		tokio::time::sleep(Duration::from_millis(2_001)).await;
		settle().await;
		assert_eq!(
			control.ops(),
			vec![
				"register-failed:pod-6",
				"register-failed:pod-6",
				"register:pod-6"
			]
		);
		assert!(client.pending_topics().is_empty());

		tokio::time::sleep(Duration::from_secs(60)).await;
		assert_eq!(control.ops().len(), 3);
	}

	#[tokio::test(start_paused = true)]
	async fn test_registration_retries_stop_at_attempt_limit() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let _session = transport.push_session();
		let settings = StreamSettings {
			max_reconnect_attempts: 2,
			..StreamSettings::default()
		};
		let client = client_with(settings, &transport, &control);

		client.connect();
		settle().await;
		control.fail_registrations.store(true, Ordering::SeqCst);
		client.subscribe_to_device("pod-7").await.unwrap();

		tokio::time::sleep(Duration::from_secs(120)).await;
		assert_eq!(control.ops().len(), 2);
		assert_eq!(client.pending_topics(), vec!["pod-7"]);
	}

	#[tokio::test(start_paused = true)]
	async fn test_last_topic_handler_unregisters() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let client = client_with(StreamSettings::default(), &transport, &control);

		let a = client.subscribe_topic("pod-2", |_| {}).unwrap();
		let b = client.subscribe_topic("pod-2", |_| {}).unwrap();
		assert_eq!(client.topic_handler_count("pod-2"), 2);
		settle().await;
		assert_eq!(control.ops(), vec!["register:pod-2"]);

		assert!(a.unsubscribe());
		assert!(!a.unsubscribe());
		settle().await;
		assert_eq!(control.ops(), vec!["register:pod-2"]);

		drop(b);
		settle().await;
		assert_eq!(control.ops(), vec!["register:pod-2", "unregister:pod-2"]);
		assert_eq!(client.topic_handler_count("pod-2"), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_command_correlation() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let session = transport.push_session();
		let client = client_with(StreamSettings::default(), &transport, &control);

		let results = Arc::new(Mutex::new(Vec::new()));
		let sink = results.clone();
		let _results = client.on(EVENT_COMMAND_RESULT, move |e| {
			lock(&sink).push(e.status().unwrap_or_default().to_string())
		});

		client.connect();
		settle().await;

		let ticket = client
			.send_command("pod-4", "start_session", json!({"mode": "match"}))
			.await
			.unwrap();
		assert_eq!(client.pending_commands(), vec![ticket.clone()]);
		assert_eq!(control.ops(), vec!["command:pod-4:start_session"]);

		let frame = json!({"type": "command_executed", "commandId": ticket.command_id, "deviceId": "pod-4"});
		session.send(Ok(frame.to_string())).unwrap();
		settle().await;

		assert!(client.pending_commands().is_empty());
		assert_eq!(*lock(&results), vec!["executed"]);

		control.fail_commands.store(true, Ordering::SeqCst);
		assert!(matches!(
			client.send_command("pod-4", "stop_session", Value::Null).await,
			Err(SyncError::ControlError(_))
		));
		assert!(client.pending_commands().is_empty());
	}

	#[tokio::test(start_paused = true)]
	async fn test_unanswered_commands_expire() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let settings = StreamSettings {
			command_timeout: Duration::from_secs(5),
			..StreamSettings::default()
		};
		let client = client_with(settings, &transport, &control);

		let stale = client
			.send_command("pod-4", "calibrate", Value::Null)
			.await
			.unwrap();
		tokio::time::sleep(Duration::from_secs(3)).await;
		let fresh = client
			.send_command("pod-4", "start_session", Value::Null)
			.await
			.unwrap();
		assert_eq!(client.pending_commands().len(), 2);

		tokio::time::sleep(Duration::from_secs(3)).await;
		let pending = client.pending_commands();
		assert_eq!(pending, vec![fresh.clone()]);
		assert_ne!(pending[0].command_id, stale.command_id);

		// A late result for an expired command resolves nothing.
		client.dispatch_frame(
			&json!({"type": "command_executed", "commandId": stale.command_id, "deviceId": "pod-4"})
				.to_string(),
		);
		assert_eq!(client.pending_commands(), vec![fresh]);

		tokio::time::sleep(Duration::from_secs(3)).await;
		assert!(client.pending_commands().is_empty());
	}

	#[tokio::test]
	async fn test_caller_errors() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let client = client_with(StreamSettings::default(), &transport, &control);

		assert!(matches!(
			client.subscribe_topic("  ", |_| {}),
			Err(SyncError::InvalidTopic(_))
		));
		assert!(matches!(
			client.subscribe_to_device("").await,
			Err(SyncError::InvalidTopic(_))
		));
		assert!(matches!(
			client.send_command("pod-1", " ", Value::Null).await,
			Err(SyncError::InvalidCommand(_))
		));
		assert!(control.ops().is_empty());
	}

	#[test]
	fn test_stream_url_appends_client_id() {
		let transport = ScriptedTransport::new();
		let control = MockControl::new();
		let settings = StreamSettings {
			endpoint: "https://tracker.example/events?v=2".to_string(),
			..StreamSettings::default()
		};
		let client = client_with(settings, &transport, &control);
		assert_eq!(
			client.stream_url(),
			"https://tracker.example/events?v=2&clientId=c-1"
		);

		let random = StreamClient::new(StreamSettings::default(), transport, control);
		assert_eq!(random.client_id().len(), 32);
		assert_eq!(random.status(), ConnectionStatus::Disconnected);
	}
}
