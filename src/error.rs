use thiserror::Error;

/// Errors produced by the DICOM-to-FHIR synchronization pipeline.
#[derive(Debug, Error)]
pub enum CastError {
	/// A required input was missing or malformed. Indicates a caller bug and
	/// is never worth retrying.
	#[error("Invalid argument: {0}")]
	InvalidArgument(&'static str),

	/// An existing remote resource disagrees with the expected
	/// identity-defining fields, or a lookup matched more than one resource.
	/// The conflicting data must be corrected externally before the event can
	/// be processed.
	#[error("Conflicting {resource_type} resource: expected {expected:?}, found {found:?}")]
	ConflictDetected {
		resource_type: &'static str,
		expected: String,
		found: String,
	},

	/// Token acquisition failed. The in-flight call is aborted.
	#[error("Failed to acquire access token: {0}")]
	AuthenticationFailed(String),

	/// The FHIR server refused the transaction bundle. Processing is atomic
	/// on the server, so nothing was applied and the whole event may be
	/// retried from scratch.
	#[error("FHIR server rejected the transaction with status {status}: {diagnostics}")]
	RemoteRejected { status: u16, diagnostics: String },

	/// Cancellation was observed mid-pipeline. No partial transaction was
	/// submitted.
	#[error("Operation cancelled")]
	Cancelled,

	#[error(transparent)]
	Transport(#[from] reqwest::Error),
}

impl CastError {
	/// Whether retrying the event without external correction is pointless.
	pub const fn is_fatal(&self) -> bool {
		matches!(
			self,
			Self::InvalidArgument(_) | Self::ConflictDetected { .. }
		)
	}
}
