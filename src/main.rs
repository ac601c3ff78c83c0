use std::time::Duration;
use tracing::{error, info, warn};
use tracker_sync::stream::{DeviceUpdate, EVENT_COMMAND_RESULT, EVENT_DEVICE_UPDATE};
use tracker_sync::{PollProfile, SyncFacade, SyncSettings};

/// One thing to follow, from a command-line argument.
enum Target {
	/// `poll:<profile>:<locator>`, or `poll:fixed-<ms>:<locator>` for a constant cadence.
	Poll { profile: String, locator: String },
	/// `device:<id>`
	Device(String),
}

fn parse_target(arg: &str) -> Result<Target, String> {
	if let Some(rest) = arg.strip_prefix("poll:") {
		let (profile, locator) = rest
			.split_once(':')
			.ok_or_else(|| format!("expected poll:<profile>:<locator>, got '{}'", arg))?;
		return Ok(Target::Poll {
			profile: profile.to_string(),
			locator: locator.to_string(),
		});
	}
	if let Some(device) = arg.strip_prefix("device:") {
		return Ok(Target::Device(device.to_string()));
	}
	Err(format!("unrecognised target '{}'", arg))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting tracker sync");

	let settings = match SyncSettings::from_env() {
		Ok(settings) => settings,
		Err(e) => {
			error!("Invalid configuration: {}", e);
			return;
		}
	};

	let targets = match std::env::args()
		.skip(1)
		.map(|arg| parse_target(&arg))
		.collect::<Result<Vec<_>, _>>()
	{
		Ok(targets) => targets,
		Err(e) => {
			error!("{}", e);
			return;
		}
	};
	if targets.is_empty() {
		warn!("Nothing to follow; pass poll:<profile>:<locator> and/or device:<id> arguments");
	}

	let facade = match SyncFacade::connect_http(settings) {
		Ok(facade) => facade,
		Err(e) => {
			error!("Failed to start sync layer: {}", e);
			return;
		}
	};
	info!("Client id {}", facade.stream().client_id());

	facade.on_error(|failure| {
		warn!(
			"Poll {} of {} failed ({} in a row): {}",
			failure.subscription_id, failure.url, failure.consecutive_errors, failure.error
		)
	});
	let _connection = facade.on_connection(|event| {
		info!("Stream {}", event.status().unwrap_or("unknown"));
	});
	let _devices = facade.stream().on(EVENT_DEVICE_UPDATE, |event| {
		match event.decode::<DeviceUpdate>() {
			Ok(update) => info!(
				"Device {} is {:?} (from {})",
				update.device_id, update.status, update.source
			),
			Err(e) => warn!("Malformed device update: {}", e),
		}
	});
	let _commands = facade.stream().on(EVENT_COMMAND_RESULT, |event| {
		info!("Command result: {}", event.body);
	});

	let mut guards = Vec::new();
	for target in targets {
		let subscribed = match target {
			Target::Poll { profile, locator } => {
				let label = locator.clone();
				let on_data = move |data: serde_json::Value| info!("{} -> {}", label, data);
				match profile.strip_prefix("fixed-").map(str::parse::<u64>) {
					Some(Ok(ms)) => {
						facade.subscribe_fixed(&locator, Duration::from_millis(ms), on_data)
					}
					Some(Err(e)) => {
						error!("Invalid fixed interval in '{}': {}", profile, e);
						continue;
					}
					None => match PollProfile::from_name(&profile) {
						Some(profile) => facade.subscribe_poll(&locator, profile, on_data),
						None => {
							error!("Unknown polling profile '{}'", profile);
							continue;
						}
					},
				}
			}
			Target::Device(device) => {
				let label = device.clone();
				facade.subscribe_stream(&device, move |body| info!("{} => {}", label, body))
			}
		};
		match subscribed {
			Ok(guard) => guards.push(guard),
			Err(e) => error!("Subscription failed: {}", e),
		}
	}

	facade.connect();

	match tokio::signal::ctrl_c().await {
		Ok(()) => info!("Interrupted, shutting down"),
		Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
	}

	drop(guards);
	facade.shutdown();
}
