//! Types for the HTTP backend boundary: errors, control requests and the injection traits.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Errors for a single resource fetch. All of them are transient from the scheduler's point of view.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
	#[error("HTTP error: {0}")]
	HttpError(#[from] reqwest::Error),

	#[error("Unexpected status {status} from {url}")]
	StatusError { status: u16, url: String },

	#[error("Request timed out after {0:?}")]
	Timeout(Duration),

	#[error("JSON parse error: {0}")]
	JsonError(#[from] serde_json::Error),

	#[error("Invalid URL: {0}")]
	InvalidUrl(String),
}

/// Errors for the short-lived subscription and command calls.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
	#[error("HTTP error: {0}")]
	HttpError(#[from] reqwest::Error),

	#[error("Control request rejected with status {status}: {message}")]
	Rejected { status: u16, message: String },

	#[error("Invalid URL: {0}")]
	InvalidUrl(String),
}

/// Body sent when registering or unregistering a topic for a client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TopicRequest {
	pub client_id: String,
	pub device_id: String,
}

/// A device command whose confirmation arrives later on the event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
	pub command_id: String,
	pub device_id: String,
	pub command: String,
	#[serde(default)]
	pub params: serde_json::Value,
}

/// Source of JSON snapshots for the polling path.
#[async_trait]
pub trait Fetcher: Send + Sync {
	/// Fetch the current JSON representation of `url`.
	async fn fetch(&self, url: &str) -> Result<serde_json::Value, FetchError>;
}

/// Out-of-band calls that steer which topics the stream delivers to a client.
#[async_trait]
pub trait ControlPlane: Send + Sync {
	async fn register_topic(&self, client_id: &str, topic: &str) -> Result<(), ControlError>;

	async fn unregister_topic(&self, client_id: &str, topic: &str) -> Result<(), ControlError>;

	async fn send_command(
		&self,
		client_id: &str,
		request: &CommandRequest,
	) -> Result<(), ControlError>;
}
