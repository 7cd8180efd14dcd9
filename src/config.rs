use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
	pub telemetry: TelemetryConfig,
	pub dicom: DicomWebConfig,
	pub fhir: FhirConfig,
	pub auth: AuthConfig,
	pub changefeed: ChangeFeedConfig,
}

impl AppConfig {
	/// Loads the layered application config: embedded defaults, then an
	/// optional `config.toml`, then `DICOM_CAST`-prefixed environment
	/// variables.
	///
	/// # Errors
	/// Returns a [`config::ConfigError`] if a source fails to parse or a
	/// required value is missing.
	pub fn new() -> Result<Self, config::ConfigError> {
		use config::Config;
		let s = Config::builder()
			.add_source(config::File::from_str(
				include_str!("defaults.toml"),
				config::FileFormat::Toml,
			))
			.add_source(config::File::with_name("config.toml").required(false))
			.add_source(config::Environment::with_prefix("DICOM_CAST").separator("_"))
			.build()?;

		s.try_deserialize()
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
	// Configurable logging level. Also configurable via env vars RUST_LOG and DICOM_CAST_TELEMETRY_LEVEL
	pub level: String,
	/// Sentry DSN for error tracking. Unset disables Sentry.
	pub sentry: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DicomWebConfig {
	/// Base URL of the DICOMweb service whose change feed is synchronized.
	/// Also used as the address of the FHIR Endpoint resource.
	pub service_url: Url,
	/// Workspace name, part of the derived endpoint label.
	pub workspace: String,
	/// Service name, part of the derived endpoint label.
	pub service: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FhirConfig {
	/// Base URL of the FHIR R4 server that receives the transaction bundles.
	pub service_url: Url,
	/// Identifier system qualifying DICOM PatientID values on Patient
	/// resources.
	pub patient_identifier_system: String,
}

/// Credential configuration for outbound calls.
///
/// When `token_url` is set, tokens are acquired through the OAuth2
/// client-credentials flow. Otherwise `static_token` is attached as-is
/// (useful against servers that do their own network-level auth).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
	pub token_url: Option<Url>,
	pub client_id: Option<String>,
	pub client_secret: Option<String>,
	pub scope: Option<String>,
	pub static_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeFeedConfig {
	/// Delay between change-feed polls in milliseconds.
	pub poll_interval: u64,
	/// Maximum number of entries fetched per poll.
	pub batch_size: usize,
	/// Sequence number to resume from on startup.
	pub offset: u64,
}
