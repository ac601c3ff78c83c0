//! Long-lived event transports.
//!
//! A [`Transport`] opens one connection to the stream endpoint and yields its text frames, one
//! JSON message per frame. Two implementations are provided: Server-Sent Events over reqwest and
//! WebSocket over tokio-tungstenite. The connection state machine in [`super::client`] owns
//! reconnection; a transport only reports that its stream ended or failed.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt, stream};
use reqwest::{Client, header};
use std::{fmt, pin::Pin, str::FromStr, sync::Arc, time::Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace};

/// Frames of one open connection. The stream ends when the peer closes it.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
	#[error("HTTP error: {0}")]
	HttpError(#[from] reqwest::Error),

	#[error("WebSocket error: {0}")]
	WebSocketError(#[from] tokio_tungstenite::tungstenite::Error),

	#[error("Stream endpoint returned status {0}")]
	StatusError(u16),

	#[error("Stream closed by peer")]
	Closed,

	#[error("No message received for {0:?}")]
	Inactive(Duration),

	#[error("Protocol error: {0}")]
	ProtocolError(String),

	#[error("Invalid stream URL: {0}")]
	InvalidUrl(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
	/// Open a connection and return its frame stream.
	async fn open(&self, url: &str) -> Result<FrameStream, TransportError>;

	fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
	#[default]
	Sse,
	WebSocket,
}

impl FromStr for TransportKind {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"sse" | "eventsource" => Ok(TransportKind::Sse),
			"websocket" | "ws" => Ok(TransportKind::WebSocket),
			other => Err(format!("unknown stream transport '{}'", other)),
		}
	}
}

impl fmt::Display for TransportKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TransportKind::Sse => write!(f, "sse"),
			TransportKind::WebSocket => write!(f, "websocket"),
		}
	}
}

/// Build the transport for `kind`.
pub fn build_transport(
	kind: TransportKind,
	connect_timeout: Duration,
) -> Result<Arc<dyn Transport>, TransportError> {
	let transport: Arc<dyn Transport> = match kind {
		TransportKind::Sse => Arc::new(SseTransport::new(connect_timeout)?),
		TransportKind::WebSocket => Arc::new(WebSocketTransport),
	};
	Ok(transport)
}

/// Longest event-stream line accepted before the connection is treated as broken.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Incremental `text/event-stream` decoder.
///
/// Yields the joined `data:` lines of each event on the blank line that terminates it. Comment
/// lines (`:`) and the `event`, `id` and `retry` fields are ignored. A bare line starting with
/// `{` outside an event is taken as a newline-delimited JSON frame, so endpoints that stream
/// NDJSON over the same request also work.
#[derive(Debug)]
pub struct SseDecoder {
	pending: Vec<u8>,
	data: Vec<String>,
	max_line: usize,
}

impl Default for SseDecoder {
	fn default() -> Self {
		Self::with_max_line(MAX_LINE_BYTES)
	}
}

impl SseDecoder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_max_line(max_line: usize) -> Self {
		Self {
			pending: Vec::new(),
			data: Vec::new(),
			max_line,
		}
	}

	/// Feed one network chunk and return the frames it completed.
	///
	/// # Errors
	/// `TransportError::ProtocolError` once a line grows past the line limit. The buffered input
	/// is discarded.
	pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, TransportError> {
		self.pending.extend_from_slice(chunk);
		let mut frames = Vec::new();
		while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
			if pos > self.max_line {
				return Err(self.overflow());
			}
			let raw: Vec<u8> = self.pending.drain(..=pos).collect();
			let text = String::from_utf8_lossy(&raw[..raw.len() - 1]);
			let line = text.strip_suffix('\r').unwrap_or(&*text);
			if let Some(frame) = self.process_line(line) {
				frames.push(frame);
			}
		}
		if self.pending.len() > self.max_line {
			return Err(self.overflow());
		}
		Ok(frames)
	}

	fn overflow(&mut self) -> TransportError {
		self.pending.clear();
		self.data.clear();
		TransportError::ProtocolError(format!(
			"event-stream line exceeds {} bytes",
			self.max_line
		))
	}

	/// Flush whatever is buffered when the stream ends.
	pub fn finish(&mut self) -> Option<String> {
		let rest = std::mem::take(&mut self.pending);
		if !rest.is_empty() {
			let line = String::from_utf8_lossy(&rest).into_owned();
			if let Some(frame) = self.process_line(line.trim_end_matches('\r')) {
				return Some(frame);
			}
		}
		self.take_event()
	}

	fn process_line(&mut self, line: &str) -> Option<String> {
		if line.is_empty() {
			return self.take_event();
		}
		if line.starts_with(':') {
			return None;
		}

		let (field, value) = match line.split_once(':') {
			Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
			None => (line, ""),
		};
		match field {
			"data" => {
				self.data.push(value.to_string());
				None
			}
			"event" | "id" | "retry" => None,
			_ if self.data.is_empty() && line.trim_start().starts_with('{') => {
				Some(line.trim().to_string())
			}
			_ => {
				trace!("Ignoring event-stream line: {}", line);
				None
			}
		}
	}

	fn take_event(&mut self) -> Option<String> {
		if self.data.is_empty() {
			return None;
		}
		let frame = self.data.join("\n");
		self.data.clear();
		Some(frame)
	}
}

/// Server-Sent Events transport.
pub struct SseTransport {
	http_client: Client,
}

impl SseTransport {
	/// Only the connect phase is bounded; the response body stays open indefinitely.
	pub fn new(connect_timeout: Duration) -> Result<Self, TransportError> {
		let http_client = Client::builder().connect_timeout(connect_timeout).build()?;
		Ok(Self { http_client })
	}
}

#[async_trait]
impl Transport for SseTransport {
	async fn open(&self, url: &str) -> Result<FrameStream, TransportError> {
		debug!("Opening event stream: {}", url);
		let response = self
			.http_client
			.get(url)
			.header(header::ACCEPT, "text/event-stream")
			.header(header::CACHE_CONTROL, "no-cache")
			.send()
			.await?;

		let status = response.status();
		if !status.is_success() {
			return Err(TransportError::StatusError(status.as_u16()));
		}
		debug!("Event stream open, status: {}", status);

		let mut decoder = SseDecoder::new();
		let chunks = response
			.bytes_stream()
			.map(Some)
			.chain(stream::once(async { None }));
		let frames = chunks.flat_map(move |chunk| {
			let items: Vec<Result<String, TransportError>> = match chunk {
				Some(Ok(bytes)) => match decoder.feed(&bytes) {
					Ok(frames) => frames.into_iter().map(Ok).collect(),
					Err(e) => vec![Err(e)],
				},
				Some(Err(e)) => vec![Err(TransportError::HttpError(e))],
				None => decoder.finish().into_iter().map(Ok).collect(),
			};
			stream::iter(items)
		});

		Ok(Box::pin(frames))
	}

	fn name(&self) -> &'static str {
		"sse"
	}
}

/// WebSocket transport. `http`/`https` endpoints are dialled as `ws`/`wss`.
pub struct WebSocketTransport;

pub fn websocket_url(url: &str) -> Result<String, TransportError> {
	if let Some(rest) = url.strip_prefix("https://") {
		Ok(format!("wss://{}", rest))
	} else if let Some(rest) = url.strip_prefix("http://") {
		Ok(format!("ws://{}", rest))
	} else if url.starts_with("ws://") || url.starts_with("wss://") {
		Ok(url.to_string())
	} else {
		Err(TransportError::InvalidUrl(url.to_string()))
	}
}

#[async_trait]
impl Transport for WebSocketTransport {
	async fn open(&self, url: &str) -> Result<FrameStream, TransportError> {
		let ws_url = websocket_url(url)?;
		debug!("Attempting WebSocket connection to: {}", ws_url);

		let (ws_stream, response) = connect_async(ws_url.as_str()).await?;
		debug!(
			"WebSocket connection established, response status: {}",
			response.status()
		);

		// Kept unsplit so control frames are answered while reading.
		let frames = ws_stream.filter_map(|msg| async move {
			match msg {
				Ok(Message::Text(text)) => Some(Ok(text)),
				Ok(Message::Binary(bytes)) => Some(String::from_utf8(bytes).map_err(|_| {
					TransportError::ProtocolError("binary frame is not UTF-8".to_string())
				})),
				Ok(Message::Close(frame)) => {
					debug!("WebSocket closed by peer: {:?}", frame);
					None
				}
				Ok(_) => None,
				Err(e) => Some(Err(TransportError::WebSocketError(e))),
			}
		});

		Ok(Box::pin(frames))
	}

	fn name(&self) -> &'static str {
		"websocket"
	}
}
