use crate::config::DicomWebConfig;
use crate::error::CastError;
use crate::fhir::client::{FhirStore, SearchParams};
use crate::fhir::context::{EndpointContext, TransactionContext};
use crate::fhir::model::{
	placeholder_id, CodeableConcept, Coding, Endpoint, Resource, DICOM_WADO_RS,
	ENDPOINT_CONNECTION_TYPE_SYSTEM,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Resolves the Endpoint resource describing the DICOMweb service.
///
/// Whether instances are created or deleted, the WADO-RS endpoint must be
/// present in FHIR so ImagingStudy resources can reference where their
/// instances are retrievable.
pub struct EndpointHandler {
	store: Arc<dyn FhirStore>,
	service_address: String,
	endpoint_name: String,
}

impl EndpointHandler {
	pub fn new(store: Arc<dyn FhirStore>, config: &DicomWebConfig) -> Self {
		let endpoint_name = format!(
			"DICOM Service {}/{} WADO-RS Endpoint",
			config.workspace, config.service
		);
		Self {
			store,
			service_address: config.service_url.to_string(),
			endpoint_name,
		}
	}

	/// # Errors
	/// Returns [`CastError::ConflictDetected`] if an endpoint with the
	/// configured name resolves to a different address, or if the lookup is
	/// ambiguous.
	pub async fn resolve(
		&self,
		mut ctx: TransactionContext,
		cancel: &CancellationToken,
	) -> Result<EndpointContext, CastError> {
		let params = SearchParams::new()
			.add("name", self.endpoint_name.as_str())
			.add(
				"connection-type",
				format!("{ENDPOINT_CONNECTION_TYPE_SYSTEM}|{DICOM_WADO_RS}"),
			);
		let matches = self.store.search("Endpoint", &params, 2, cancel).await?;
		let mut endpoints: Vec<Endpoint> = matches
			.into_iter()
			.filter_map(|resource| match resource {
				Resource::Endpoint(endpoint) => Some(endpoint),
				_ => None,
			})
			.collect();

		let endpoint = match endpoints.len() {
			0 => {
				let endpoint = self.expected_endpoint();
				debug!(name = %self.endpoint_name, "Staging new WADO-RS endpoint");
				ctx.builder
					.create(Resource::Endpoint(endpoint.clone()), Some(params.to_query()));
				endpoint
			}
			1 => {
				let found = endpoints.remove(0);
				if found.address != self.service_address {
					return Err(CastError::ConflictDetected {
						resource_type: "Endpoint",
						expected: self.service_address.clone(),
						found: found.address,
					});
				}
				found
			}
			count => {
				return Err(CastError::ConflictDetected {
					resource_type: "Endpoint",
					expected: format!("a single endpoint named {:?}", self.endpoint_name),
					found: format!("{count} matching endpoints"),
				});
			}
		};

		Ok(ctx.with_endpoint(endpoint))
	}

	fn expected_endpoint(&self) -> Endpoint {
		Endpoint {
			id: Some(placeholder_id()),
			status: String::from("active"),
			connection_type: Coding::new(ENDPOINT_CONNECTION_TYPE_SYSTEM, DICOM_WADO_RS),
			name: Some(self.endpoint_name.clone()),
			payload_type: vec![CodeableConcept {
				coding: Vec::new(),
				text: Some(String::from("DICOM WADO-RS")),
			}],
			payload_mime_type: vec![String::from("application/dicom")],
			address: self.service_address.clone(),
		}
	}
}
