pub(crate) mod auth;
pub(crate) mod changefeed;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod fhir;
pub(crate) mod types;

use crate::changefeed::{dedup_batch, ChangeFeedClient, ChangeFeedEntry};
use crate::config::AppConfig;
use crate::fhir::client::RestFhirClient;
use crate::fhir::CastPipeline;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, level_filters::LevelFilter, warn, Level};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

fn init_logger(level: Level) {
	tracing_subscriber::registry()
		.with(
			tracing_subscriber::fmt::layer()
				.compact()
				.with_ansi(true)
				.with_file(false)
				.with_line_number(false)
				.with_target(false),
		)
		.with(
			EnvFilter::builder()
				.with_default_directive(LevelFilter::from_level(level).into())
				.from_env_lossy(),
		)
		.with(sentry::integrations::tracing::layer())
		.init();
}

fn init_sentry(config: &AppConfig) -> sentry::ClientInitGuard {
	let guard = sentry::init((
		// An empty string will disable Sentry
		config.telemetry.sentry.as_deref().unwrap_or_default(),
		sentry::ClientOptions {
			release: sentry::release_name!(),
			traces_sample_rate: 1.0,
			..Default::default()
		},
	));

	if let Some(dsn) = &config.telemetry.sentry {
		info!(dsn, "Enabled Sentry for tracing and error tracking");
	};

	guard
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
	let config = AppConfig::new()?;
	init_logger(Level::from_str(&config.telemetry.level).unwrap_or(Level::INFO));

	// Manually create the Tokio runtime because the Sentry client needs to be created *before* the
	// Tokio runtime, which prevents us from using the #[tokio::main] macro.
	// See https://docs.sentry.io/platforms/rust/#async-main-function
	let _sentry = init_sentry(&config);

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(async move {
			if let Err(error) = run(config).await {
				error!("Failed to run application due to error: {error}");
			}
		});
	Ok(())
}

async fn run(config: AppConfig) -> anyhow::Result<()> {
	let credential = auth::credential_from_config(&config.auth)?;
	let store = Arc::new(RestFhirClient::new(
		config.fhir.service_url.clone(),
		Arc::clone(&credential),
	));
	let pipeline = CastPipeline::new(store, &config);
	let changefeed = ChangeFeedClient::new(
		config.dicom.service_url.clone(),
		credential,
		config.changefeed.batch_size,
	);

	let cancel = CancellationToken::new();
	tokio::spawn({
		let cancel = cancel.clone();
		async move {
			shutdown_signal().await;
			info!("Shutdown requested; finishing in-flight work");
			cancel.cancel();
		}
	});

	let poll_interval = Duration::from_millis(config.changefeed.poll_interval);
	let mut offset = config.changefeed.offset;
	info!(
		dicom = %config.dicom.service_url,
		fhir = %config.fhir.service_url,
		offset,
		"Started DICOM-cast worker"
	);

	while !cancel.is_cancelled() {
		let entries = match changefeed.fetch(offset, &cancel).await {
			Ok(entries) => entries,
			Err(err) if err.is_fatal() => return Err(err.into()),
			Err(err) => {
				warn!("Failed to poll change feed: {err}");
				idle(poll_interval, &cancel).await;
				continue;
			}
		};

		if entries.is_empty() {
			idle(poll_interval, &cancel).await;
			continue;
		}

		let batch = dedup_batch(entries);
		let mut completed = true;
		let mut last_sequence = offset;

		for entry in batch {
			if cancel.is_cancelled() {
				completed = false;
				break;
			}
			match process_entry(&pipeline, &entry, &cancel).await {
				Ok(()) => last_sequence = entry.sequence,
				// Retrying cannot resolve a fatal error; log, skip the
				// event and move on
				Err(err) if err.is_fatal() => {
					error!(
						sequence = entry.sequence,
						"Skipped unprocessable event: {err}"
					);
					last_sequence = entry.sequence;
				}
				// Transient failure: stop here and re-poll from the same
				// offset. Already-synchronized events re-resolve to no-ops.
				Err(err) => {
					warn!(
						sequence = entry.sequence,
						"Deferred event after error: {err}"
					);
					completed = false;
					break;
				}
			}
		}

		offset = last_sequence;
		if !completed {
			idle(poll_interval, &cancel).await;
		}
	}

	info!("Stopped DICOM-cast worker");
	Ok(())
}

async fn process_entry(
	pipeline: &CastPipeline,
	entry: &ChangeFeedEntry,
	cancel: &CancellationToken,
) -> Result<(), error::CastError> {
	let Some(facts) = entry.facts()? else {
		debug!(
			sequence = entry.sequence,
			"Entry carries no metadata; skipped"
		);
		return Ok(());
	};
	let result = pipeline.process(entry.action, &facts, cancel).await?;
	info!(
		instance = %facts.identifiers,
		applied = result.applied(),
		"Synchronized instance"
	);
	Ok(())
}

async fn idle(interval: Duration, cancel: &CancellationToken) {
	tokio::select! {
		() = cancel.cancelled() => {},
		() = tokio::time::sleep(interval) => {},
	}
}

async fn shutdown_signal() {
	let ctrl_c = async { signal::ctrl_c().await.unwrap() };

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.unwrap()
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
