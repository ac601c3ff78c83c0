//!
//! HTTP client for the tracking backend.
//!
//! Implements [`Fetcher`] for the polling path and [`ControlPlane`] for topic routing and device
//! commands. All methods are async and designed for use with Tokio.

use super::types::*;
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Resolve a resource locator against the API base URL.
///
/// Absolute `http`/`https` URLs are used as-is; anything else is treated as a path relative to
/// `base`. Empty locators and non-HTTP schemes are rejected.
pub fn resolve_locator(base: &Url, locator: &str) -> Result<Url, FetchError> {
	let locator = locator.trim();
	if locator.is_empty() {
		return Err(FetchError::InvalidUrl("empty resource locator".to_string()));
	}

	// Joining keeps absolute URLs intact; the leading slash is dropped so paths stay under the
	// API prefix instead of replacing it.
	let url = base
		.join(locator.trim_start_matches('/'))
		.map_err(|e| FetchError::InvalidUrl(format!("{}: {}", locator, e)))?;

	match url.scheme() {
		"http" | "https" => Ok(url),
		other => Err(FetchError::InvalidUrl(format!(
			"unsupported scheme '{}' in {}",
			other, locator
		))),
	}
}

/// Parse the API base URL, forcing a trailing slash so relative joins stay under its path.
pub fn parse_api_base(api_base: &str) -> Result<Url, FetchError> {
	let mut url = Url::parse(api_base.trim())
		.map_err(|e| FetchError::InvalidUrl(format!("{}: {}", api_base, e)))?;
	if !url.path().ends_with('/') {
		let path = format!("{}/", url.path());
		url.set_path(&path);
	}
	Ok(url)
}

/// Tracking backend HTTP client
#[derive(Clone)]
pub struct HttpBackend {
	/// The underlying HTTP client, carrying the request timeout.
	http_client: Client,
	/// The API base URL every relative locator and control endpoint is resolved against.
	api_base: Url,
}

impl HttpBackend {
	/// Create a new backend client.
	///
	/// # Arguments
	/// * `api_base` - Base URL of the REST API, e.g. `http://localhost:3000/api/`.
	/// * `request_timeout` - Hard timeout applied to every request.
	///
	/// # Returns
	/// A new `HttpBackend`, or a `FetchError` if the base URL or HTTP client is invalid.
	pub fn new(api_base: &str, request_timeout: Duration) -> Result<Self, FetchError> {
		let api_base = parse_api_base(api_base)?;
		let http_client = Client::builder().timeout(request_timeout).build()?;

		Ok(Self {
			http_client,
			api_base,
		})
	}

	/// The API base URL.
	pub fn api_base(&self) -> &Url {
		&self.api_base
	}

	fn subscriptions_url(&self) -> Result<Url, ControlError> {
		self.api_base
			.join("stream/subscriptions")
			.map_err(|e| ControlError::InvalidUrl(e.to_string()))
	}

	fn commands_url(&self, device_id: &str) -> Result<Url, ControlError> {
		let mut url = self.api_base.clone();
		url.path_segments_mut()
			.map_err(|_| ControlError::InvalidUrl(self.api_base.to_string()))?
			.pop_if_empty()
			.extend(&["devices", device_id, "commands"]);
		Ok(url)
	}

	async fn check_control_response(response: reqwest::Response) -> Result<(), ControlError> {
		let status = response.status();
		if status.is_success() {
			return Ok(());
		}
		let message = response.text().await.unwrap_or_default();
		Err(ControlError::Rejected {
			status: status.as_u16(),
			message,
		})
	}
}

#[async_trait]
impl Fetcher for HttpBackend {
	async fn fetch(&self, url: &str) -> Result<serde_json::Value, FetchError> {
		debug!("Fetching {}", url);

		let response = self
			.http_client
			.get(url)
			.header("Accept", "application/json")
			.send()
			.await?;

		if !response.status().is_success() {
			return Err(FetchError::StatusError {
				status: response.status().as_u16(),
				url: url.to_string(),
			});
		}

		let bytes = response.bytes().await?;
		Ok(serde_json::from_slice(&bytes)?)
	}
}

#[async_trait]
impl ControlPlane for HttpBackend {
	async fn register_topic(&self, client_id: &str, topic: &str) -> Result<(), ControlError> {
		let body = TopicRequest {
			client_id: client_id.to_string(),
			device_id: topic.to_string(),
		};

		let response = self
			.http_client
			.post(self.subscriptions_url()?)
			.json(&body)
			.send()
			.await?;
		Self::check_control_response(response).await?;

		info!("Registered topic {} for client {}", topic, client_id);
		Ok(())
	}

	async fn unregister_topic(&self, client_id: &str, topic: &str) -> Result<(), ControlError> {
		let body = TopicRequest {
			client_id: client_id.to_string(),
			device_id: topic.to_string(),
		};

		let response = self
			.http_client
			.delete(self.subscriptions_url()?)
			.json(&body)
			.send()
			.await?;
		Self::check_control_response(response).await?;

		info!("Unregistered topic {} for client {}", topic, client_id);
		Ok(())
	}

	async fn send_command(
		&self,
		client_id: &str,
		request: &CommandRequest,
	) -> Result<(), ControlError> {
		let body = json!({
			"clientId": client_id,
			"commandId": request.command_id,
			"command": request.command,
			"params": request.params,
		});

		let response = self
			.http_client
			.post(self.commands_url(&request.device_id)?)
			.json(&body)
			.send()
			.await?;
		Self::check_control_response(response).await?;

		debug!(
			"Command {} ({}) accepted for device {}",
			request.command_id, request.command, request.device_id
		);
		Ok(())
	}
}
