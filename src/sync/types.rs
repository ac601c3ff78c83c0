//! Shared vocabulary of the sync layer: subscription ids, callback types, poll failure reports
//! and the caller-facing [`SyncError`].

use crate::backend::{ControlError, FetchError};
use crate::stream::TransportError;
use crate::utils::random_hex_id;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Opaque identifier of one subscription, caller-supplied or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
	/// Generate a fresh id with a readable prefix, e.g. `poll-3fa1c2d4e5f60718`.
	pub fn generate(prefix: &str) -> Self {
		Self(format!("{}-{}", prefix, random_hex_id(8)))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for SubscriptionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for SubscriptionId {
	fn from(value: &str) -> Self {
		Self(value.to_string())
	}
}

impl From<String> for SubscriptionId {
	fn from(value: String) -> Self {
		Self(value)
	}
}

/// Whether a subscription pulls from the backend or listens on the shared stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
	Poll,
	Stream,
}

/// Callback invoked with each accepted payload.
pub type DataCallback = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Hook invoked for every failed poll.
pub type ErrorHook = Arc<dyn Fn(&PollFailure) + Send + Sync>;

/// Details of one failed fetch, handed to the error hook.
#[derive(Debug)]
pub struct PollFailure {
	pub subscription_id: SubscriptionId,
	pub url: String,
	pub error: FetchError,
	/// Failures in a row for this subscription, including this one.
	pub consecutive_errors: u32,
}

/// Caller-facing errors of the sync layer.
///
/// Transient failures never surface here; they are reported through hooks and connection
/// events. Only caller mistakes and explicit control-call failures do.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
	#[error("Invalid resource locator: {0}")]
	InvalidLocator(String),

	#[error("Invalid polling profile: {0}")]
	InvalidProfile(String),

	#[error("Invalid topic: {0}")]
	InvalidTopic(String),

	#[error("Invalid command: {0}")]
	InvalidCommand(String),

	#[error("Backend error: {0}")]
	FetchError(#[from] FetchError),

	#[error("Control request failed: {0}")]
	ControlError(#[from] ControlError),

	#[error("Stream transport error: {0}")]
	TransportError(#[from] TransportError),
}
