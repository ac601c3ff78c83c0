//! Runtime settings, loaded from `TRACKER_SYNC_*` environment variables.

use crate::stream::{ReconnectPolicy, TransportKind};
use crate::sync::SchedulerOptions;

use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
	#[error("Invalid value for {var}: '{value}' ({reason})")]
	InvalidValue {
		var: String,
		value: String,
		reason: String,
	},

	#[error("Invalid configuration: {0}")]
	Invalid(String),
}

/// Push-path settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
	pub endpoint: String,
	pub transport: TransportKind,
	pub reconnect_base_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub max_reconnect_attempts: u32,
	pub inactivity_timeout: Duration,
	/// How long a sent command waits for its `command_result` before it is dropped.
	pub command_timeout: Duration,
	/// Suppress unchanged payloads per stream topic.
	pub change_detection: bool,
}

impl Default for StreamSettings {
	fn default() -> Self {
		Self {
			endpoint: "http://localhost:3000/api/events/stream".to_string(),
			transport: TransportKind::Sse,
			reconnect_base_delay: Duration::from_millis(1_000),
			reconnect_max_delay: Duration::from_millis(30_000),
			max_reconnect_attempts: 10,
			inactivity_timeout: Duration::from_millis(45_000),
			command_timeout: Duration::from_millis(60_000),
			change_detection: false,
		}
	}
}

impl StreamSettings {
	pub fn reconnect_policy(&self) -> ReconnectPolicy {
		ReconnectPolicy {
			base_delay: self.reconnect_base_delay,
			max_delay: self.reconnect_max_delay,
			max_attempts: self.max_reconnect_attempts,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSettings {
	/// Base URL that polling locators and control calls resolve against.
	pub api_base_url: String,
	pub max_concurrent: usize,
	pub request_timeout: Duration,
	pub change_detection: bool,
	pub adaptive: bool,
	pub stream: StreamSettings,
}

impl Default for SyncSettings {
	fn default() -> Self {
		Self {
			api_base_url: "http://localhost:3000/api/".to_string(),
			max_concurrent: 3,
			request_timeout: Duration::from_millis(10_000),
			change_detection: true,
			adaptive: true,
			stream: StreamSettings::default(),
		}
	}
}

impl SyncSettings {
	/// Load from the process environment. Unset variables keep their defaults.
	pub fn from_env() -> Result<Self, ConfigError> {
		Self::from_lookup(|name| std::env::var(name).ok())
	}

	/// Load from an arbitrary variable lookup.
	pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
	where
		F: Fn(&str) -> Option<String>,
	{
		let mut settings = Self::default();
		let defaults = Self::default();

		if let Some(url) = lookup("TRACKER_SYNC_API_URL") {
			settings.api_base_url = url.trim().to_string();
		}
		settings.max_concurrent = parse_var(&lookup, "TRACKER_SYNC_MAX_CONCURRENT")?
			.unwrap_or(defaults.max_concurrent);
		settings.request_timeout = millis_var(&lookup, "TRACKER_SYNC_REQUEST_TIMEOUT_MS")?
			.unwrap_or(defaults.request_timeout);
		settings.change_detection = bool_var(&lookup, "TRACKER_SYNC_CHANGE_DETECTION")?
			.unwrap_or(defaults.change_detection);
		settings.adaptive =
			bool_var(&lookup, "TRACKER_SYNC_ADAPTIVE")?.unwrap_or(defaults.adaptive);

		let stream = &mut settings.stream;
		if let Some(url) = lookup("TRACKER_SYNC_STREAM_URL") {
			stream.endpoint = url.trim().to_string();
		}
		if let Some(kind) = lookup("TRACKER_SYNC_STREAM_TRANSPORT") {
			stream.transport =
				TransportKind::from_str(&kind).map_err(|reason| ConfigError::InvalidValue {
					var: "TRACKER_SYNC_STREAM_TRANSPORT".to_string(),
					value: kind.clone(),
					reason,
				})?;
		}
		if let Some(delay) = millis_var(&lookup, "TRACKER_SYNC_RECONNECT_BASE_MS")? {
			stream.reconnect_base_delay = delay;
		}
		if let Some(delay) = millis_var(&lookup, "TRACKER_SYNC_RECONNECT_MAX_MS")? {
			stream.reconnect_max_delay = delay;
		}
		if let Some(attempts) = parse_var(&lookup, "TRACKER_SYNC_RECONNECT_ATTEMPTS")? {
			stream.max_reconnect_attempts = attempts;
		}
		if let Some(timeout) = millis_var(&lookup, "TRACKER_SYNC_INACTIVITY_MS")? {
			stream.inactivity_timeout = timeout;
		}
		if let Some(timeout) = millis_var(&lookup, "TRACKER_SYNC_COMMAND_TIMEOUT_MS")? {
			stream.command_timeout = timeout;
		}
		if let Some(enabled) = bool_var(&lookup, "TRACKER_SYNC_STREAM_CHANGE_DETECTION")? {
			stream.change_detection = enabled;
		}

		settings.validate()?;
		Ok(settings)
	}

	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.api_base_url.is_empty() {
			return Err(ConfigError::Invalid("api_base_url must not be empty".to_string()));
		}
		if self.stream.endpoint.is_empty() {
			return Err(ConfigError::Invalid("stream endpoint must not be empty".to_string()));
		}
		if self.max_concurrent == 0 {
			return Err(ConfigError::Invalid("max_concurrent must be at least 1".to_string()));
		}
		if self.request_timeout.is_zero()
			|| self.stream.inactivity_timeout.is_zero()
			|| self.stream.command_timeout.is_zero()
		{
			return Err(ConfigError::Invalid("timeouts must be positive".to_string()));
		}
		if self.stream.max_reconnect_attempts == 0 {
			return Err(ConfigError::Invalid(
				"max_reconnect_attempts must be at least 1".to_string(),
			));
		}
		if self.stream.reconnect_base_delay.is_zero()
			|| self.stream.reconnect_base_delay > self.stream.reconnect_max_delay
		{
			return Err(ConfigError::Invalid(format!(
				"reconnect delays must satisfy 0 < base ({:?}) <= max ({:?})",
				self.stream.reconnect_base_delay, self.stream.reconnect_max_delay
			)));
		}
		Ok(())
	}

	pub fn scheduler_options(&self) -> SchedulerOptions {
		SchedulerOptions {
			max_concurrent: self.max_concurrent,
			request_timeout: self.request_timeout,
			change_detection: self.change_detection,
			adaptive: self.adaptive,
		}
	}
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
	F: Fn(&str) -> Option<String>,
	T: FromStr,
	T::Err: std::fmt::Display,
{
	match lookup(var) {
		None => Ok(None),
		Some(raw) => raw
			.trim()
			.parse::<T>()
			.map(Some)
			.map_err(|e| ConfigError::InvalidValue {
				var: var.to_string(),
				value: raw.clone(),
				reason: e.to_string(),
			}),
	}
}

fn millis_var<F>(lookup: &F, var: &str) -> Result<Option<Duration>, ConfigError>
where
	F: Fn(&str) -> Option<String>,
{
	Ok(parse_var::<F, u64>(lookup, var)?.map(Duration::from_millis))
}

fn bool_var<F>(lookup: &F, var: &str) -> Result<Option<bool>, ConfigError>
where
	F: Fn(&str) -> Option<String>,
{
	let Some(raw) = lookup(var) else {
		return Ok(None);
	};
	match raw.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Ok(Some(true)),
		"0" | "false" | "no" | "off" => Ok(Some(false)),
		_ => Err(ConfigError::InvalidValue {
			var: var.to_string(),
			value: raw,
			reason: "expected a boolean".to_string(),
		}),
	}
}
