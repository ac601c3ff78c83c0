//! Push path: one persistent event stream per client, multiplexed over device topics.

mod client;
mod events;
mod reconnect;
mod transport;

pub use client::{
	CommandTicket, ConnectionStatus, StreamClient, TopicRegistration, TopicSubscription,
};
pub use events::{
	CommandResult, DeviceStatus, DeviceUpdate, EVENT_ALL, EVENT_COMMAND_RESULT, EVENT_CONNECTION,
	EVENT_DEVICE_UPDATE, EVENT_PING, EventHandler, EventParseError, EventRegistry, KnownEvent,
	ListenerHandle, StreamEvent, normalize,
};
pub use reconnect::{ReconnectDecision, ReconnectPolicy, ReconnectTracker};
pub use transport::{
	FrameStream, MAX_LINE_BYTES, SseDecoder, SseTransport, Transport, TransportError, TransportKind,
	WebSocketTransport, build_transport, websocket_url,
};

#[cfg(test)]
pub(crate) use client::tests::{MockControl, ScriptedTransport, settle};
