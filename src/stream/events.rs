//! Event model and publish/subscribe registry for the shared stream.
//!
//! Every frame received on the stream is parsed into a [`StreamEvent`] and fanned out through an
//! [`EventRegistry`]: once to the catch-all `"event"` listeners, once to listeners of its own
//! type, and, for the closed set of [`KnownEvent`]s, once more under a semantically named
//! synthetic type carrying a normalised payload. Registration returns a [`ListenerHandle`] that
//! removes exactly that handler.

use crate::utils::{invoke_guarded, lock};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// Receives every message regardless of type.
pub const EVENT_ALL: &str = "event";
/// Connection status notifications.
pub const EVENT_CONNECTION: &str = "connection";
/// Keepalive frame; resets the inactivity timer and is never dispatched.
pub const EVENT_PING: &str = "ping";
/// Synthetic: device presence changes.
pub const EVENT_DEVICE_UPDATE: &str = "device_update";
/// Synthetic: command confirmations and results.
pub const EVENT_COMMAND_RESULT: &str = "command_result";

/// Errors for frames that are not stream messages.
#[derive(Debug, thiserror::Error)]
pub enum EventParseError {
	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Stream message is not a JSON object")]
	NotAnObject,

	#[error("Stream message has no string 'type' field")]
	MissingType,
}

/// One message from the stream, or a synthetic notification derived from one.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
	pub event_type: String,
	pub timestamp: Option<DateTime<Utc>>,
	/// Device the message concerns, from `deviceId` or `device_id`.
	pub device_id: Option<String>,
	/// The full message object.
	pub body: Value,
}

impl StreamEvent {
	/// Parse one text frame.
	pub fn parse(frame: &str) -> Result<Self, EventParseError> {
		Self::from_value(serde_json::from_str(frame)?)
	}

	pub fn from_value(body: Value) -> Result<Self, EventParseError> {
		let object = body.as_object().ok_or(EventParseError::NotAnObject)?;
		let event_type = object
			.get("type")
			.and_then(Value::as_str)
			.ok_or(EventParseError::MissingType)?
			.to_string();
		let timestamp = object.get("timestamp").and_then(parse_timestamp);
		let device_id = string_field(object, &["deviceId", "device_id"]);

		Ok(Self {
			event_type,
			timestamp,
			device_id,
			body,
		})
	}

	/// A `connection` notification with `status` and any extra fields.
	pub fn connection(status: &str, details: Value) -> Self {
		let mut body = Map::new();
		body.insert("type".to_string(), json!(EVENT_CONNECTION));
		body.insert("status".to_string(), json!(status));
		if let Value::Object(extra) = details {
			body.extend(extra);
		}
		let now = Utc::now();
		body.insert("timestamp".to_string(), json!(now.to_rfc3339()));

		Self {
			event_type: EVENT_CONNECTION.to_string(),
			timestamp: Some(now),
			device_id: None,
			body: Value::Object(body),
		}
	}

	pub fn is_ping(&self) -> bool {
		self.event_type == EVENT_PING
	}

	/// `status` field of the body, if any.
	pub fn status(&self) -> Option<&str> {
		self.body.get("status").and_then(Value::as_str)
	}

	pub fn command_id(&self) -> Option<String> {
		self.body
			.as_object()
			.and_then(|object| string_field(object, &["commandId", "command_id"]))
	}

	/// Deserialise the body into a typed payload.
	pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
		T::deserialize(&self.body)
	}
}

fn string_field(object: &Map<String, Value>, keys: &[&str]) -> Option<String> {
	keys.iter()
		.find_map(|key| object.get(*key))
		.and_then(|value| match value {
			Value::String(s) if !s.is_empty() => Some(s.clone()),
			Value::Number(n) => Some(n.to_string()),
			_ => None,
		})
}

/// RFC 3339 strings or epoch milliseconds.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
	match value {
		Value::String(s) => DateTime::parse_from_rfc3339(s)
			.ok()
			.map(|dt| dt.with_timezone(&Utc)),
		Value::Number(n) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
		_ => None,
	}
}

/// Raw message types that are re-emitted under a synthetic name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownEvent {
	DeviceRegistered,
	DeviceOffline,
	Heartbeat,
	StatusConfirmation,
	CommandExecuted,
}

impl KnownEvent {
	pub fn from_type(event_type: &str) -> Option<Self> {
		match event_type {
			"device_registered" => Some(KnownEvent::DeviceRegistered),
			"device_offline" => Some(KnownEvent::DeviceOffline),
			"heartbeat" => Some(KnownEvent::Heartbeat),
			"status_confirmation" => Some(KnownEvent::StatusConfirmation),
			"command_executed" => Some(KnownEvent::CommandExecuted),
			_ => None,
		}
	}

	pub fn synthetic_type(self) -> &'static str {
		match self {
			KnownEvent::DeviceRegistered | KnownEvent::DeviceOffline | KnownEvent::Heartbeat => {
				EVENT_DEVICE_UPDATE
			}
			KnownEvent::StatusConfirmation | KnownEvent::CommandExecuted => EVENT_COMMAND_RESULT,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
	Online,
	Offline,
}

/// Normalised body of a `device_update` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceUpdate {
	pub device_id: String,
	pub status: DeviceStatus,
	pub last_seen: Option<DateTime<Utc>>,
	/// Raw type the update was derived from.
	pub source: String,
	#[serde(default)]
	pub data: Value,
}

/// Normalised body of a `command_result` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
	pub command_id: Option<String>,
	pub device_id: Option<String>,
	pub status: String,
	pub source: String,
	#[serde(default)]
	pub result: Value,
}

fn payload_of(event: &StreamEvent) -> Value {
	event
		.body
		.get("data")
		.or_else(|| event.body.get("payload"))
		.cloned()
		.unwrap_or(Value::Null)
}

/// Build the synthetic event for a known raw event.
///
/// Returns `None` when the raw event lacks what the normalised shape needs (a device id for
/// presence updates).
pub fn normalize(known: KnownEvent, event: &StreamEvent) -> Option<StreamEvent> {
	let body = match known {
		KnownEvent::DeviceRegistered | KnownEvent::DeviceOffline | KnownEvent::Heartbeat => {
			let update = DeviceUpdate {
				device_id: event.device_id.clone()?,
				status: if known == KnownEvent::DeviceOffline {
					DeviceStatus::Offline
				} else {
					DeviceStatus::Online
				},
				last_seen: match known {
					KnownEvent::Heartbeat => Some(event.timestamp.unwrap_or_else(Utc::now)),
					_ => event.timestamp,
				},
				source: event.event_type.clone(),
				data: payload_of(event),
			};
			serde_json::to_value(update).ok()?
		}
		KnownEvent::StatusConfirmation | KnownEvent::CommandExecuted => {
			let default_status = if known == KnownEvent::StatusConfirmation {
				"confirmed"
			} else {
				"executed"
			};
			let result = CommandResult {
				command_id: event.command_id(),
				device_id: event.device_id.clone(),
				status: event.status().unwrap_or(default_status).to_string(),
				source: event.event_type.clone(),
				result: payload_of(event),
			};
			serde_json::to_value(result).ok()?
		}
	};

	let mut body = body;
	if let Value::Object(object) = &mut body {
		object.insert("type".to_string(), json!(known.synthetic_type()));
	}

	Some(StreamEvent {
		event_type: known.synthetic_type().to_string(),
		timestamp: event.timestamp,
		device_id: event.device_id.clone(),
		body,
	})
}

/// Handler registered for one event type or topic.
pub type EventHandler = Arc<dyn Fn(&StreamEvent) + Send + Sync>;

#[derive(Default)]
struct RegistryState {
	next_id: u64,
	handlers: HashMap<String, Vec<(u64, EventHandler)>>,
}

/// Key -> ordered handler list. Cloning shares the same registry.
#[derive(Clone, Default)]
pub struct EventRegistry {
	state: Arc<Mutex<RegistryState>>,
}

impl EventRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register `handler` under `key`. Handlers run in registration order.
	pub fn on<F>(&self, key: &str, handler: F) -> ListenerHandle
	where
		F: Fn(&StreamEvent) + Send + Sync + 'static,
	{
		let handler: EventHandler = Arc::new(handler);
		let mut state = lock(&self.state);
		state.next_id += 1;
		let id = state.next_id;
		state
			.handlers
			.entry(key.to_string())
			.or_default()
			.push((id, handler));

		ListenerHandle {
			registry: Arc::downgrade(&self.state),
			key: key.to_string(),
			id,
			active: AtomicBool::new(true),
		}
	}

	/// Deliver `event` to every handler under `key`. Returns the number of handlers invoked.
	///
	/// Handlers run outside the registry lock, so they may register or unregister freely.
	pub fn emit(&self, key: &str, event: &StreamEvent) -> usize {
		let handlers: Vec<EventHandler> = match lock(&self.state).handlers.get(key) {
			Some(list) => list.iter().map(|(_, handler)| handler.clone()).collect(),
			None => return 0,
		};
		for handler in &handlers {
			invoke_guarded(key, || handler(event));
		}
		handlers.len()
	}

	pub fn listener_count(&self, key: &str) -> usize {
		lock(&self.state)
			.handlers
			.get(key)
			.map_or(0, |list| list.len())
	}

	/// Keys with at least one handler.
	pub fn keys(&self) -> Vec<String> {
		lock(&self.state).handlers.keys().cloned().collect()
	}
}

fn remove_handler(state: &Mutex<RegistryState>, key: &str, id: u64) -> bool {
	let mut state = lock(state);
	let Some(list) = state.handlers.get_mut(key) else {
		return false;
	};
	let before = list.len();
	list.retain(|(handler_id, _)| *handler_id != id);
	let removed = list.len() != before;
	if list.is_empty() {
		state.handlers.remove(key);
	}
	removed
}

/// Disposer for one registered handler. Dropping it unregisters the handler.
pub struct ListenerHandle {
	registry: Weak<Mutex<RegistryState>>,
	key: String,
	id: u64,
	active: AtomicBool,
}

impl ListenerHandle {
	/// Remove the handler. Idempotent; returns true only on the call that removed it.
	pub fn unsubscribe(&self) -> bool {
		if !self.active.swap(false, Ordering::SeqCst) {
			return false;
		}
		match self.registry.upgrade() {
			Some(state) => remove_handler(&state, &self.key, self.id),
			None => false,
		}
	}

	/// Keep the handler registered for the registry's lifetime.
	pub fn detach(self) {
		self.active.store(false, Ordering::SeqCst);
	}

	pub fn key(&self) -> &str {
		&self.key
	}

	pub fn is_active(&self) -> bool {
		self.active.load(Ordering::SeqCst)
	}
}

impl Drop for ListenerHandle {
	fn drop(&mut self) {
		self.unsubscribe();
	}
}
