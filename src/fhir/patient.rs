use crate::error::CastError;
use crate::fhir::client::{FhirStore, SearchParams};
use crate::fhir::context::{EndpointContext, PatientContext};
use crate::fhir::model::{date_from_da, placeholder_id, HumanName, Identifier, Patient, Resource};
use crate::types::InstanceMetadata;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Resolves the Patient resource the imaging study belongs to, keyed by the
/// issuer-qualified DICOM PatientID.
///
/// An existing patient with the same identifier is the same logical patient;
/// newer demographics from the data set refresh the stored resource instead
/// of conflicting with it.
pub struct PatientHandler {
	store: Arc<dyn FhirStore>,
	identifier_system: String,
}

impl PatientHandler {
	pub fn new(store: Arc<dyn FhirStore>, identifier_system: impl Into<String>) -> Self {
		Self {
			store,
			identifier_system: identifier_system.into(),
		}
	}

	/// # Errors
	/// Returns [`CastError::ConflictDetected`] if more than one patient
	/// carries the identifier.
	pub async fn resolve(
		&self,
		mut ctx: EndpointContext,
		metadata: &InstanceMetadata,
		cancel: &CancellationToken,
	) -> Result<PatientContext, CastError> {
		let identifier =
			Identifier::new(self.identifier_system.as_str(), metadata.patient_id.as_str());
		let params = SearchParams::new().add("identifier", identifier.token());
		let matches = self.store.search("Patient", &params, 2, cancel).await?;
		let mut patients: Vec<Patient> = matches
			.into_iter()
			.filter_map(|resource| match resource {
				Resource::Patient(patient) => Some(patient),
				_ => None,
			})
			.collect();

		let patient = match patients.len() {
			0 => {
				let patient = expected_patient(identifier, metadata);
				debug!(patient_id = %metadata.patient_id, "Staging new patient");
				ctx.builder
					.create(Resource::Patient(patient.clone()), Some(params.to_query()));
				patient
			}
			1 => {
				let found = patients.remove(0);
				match refreshed_demographics(&found, metadata) {
					Some(updated) => {
						let target = target_reference(&updated)?;
						debug!(reference = %target, "Refreshing patient demographics");
						ctx.builder.update(target, Resource::Patient(updated.clone()));
						updated
					}
					None => found,
				}
			}
			count => {
				return Err(CastError::ConflictDetected {
					resource_type: "Patient",
					expected: format!("a single patient with identifier {}", identifier.token()),
					found: format!("{count} matching patients"),
				});
			}
		};

		Ok(ctx.with_patient(patient))
	}
}

fn expected_patient(identifier: Identifier, metadata: &InstanceMetadata) -> Patient {
	Patient {
		id: Some(placeholder_id()),
		identifier: vec![identifier],
		name: metadata
			.patient_name
			.as_deref()
			.map(HumanName::from_dicom_pn)
			.into_iter()
			.collect(),
		gender: metadata.patient_sex.as_deref().map(gender_from_cs),
		birth_date: metadata.patient_birth_date.as_deref().and_then(date_from_da),
	}
}

/// Returns the existing patient with demographics replaced by the data
/// set's values, or `None` when nothing would change.
fn refreshed_demographics(found: &Patient, metadata: &InstanceMetadata) -> Option<Patient> {
	let mut updated = found.clone();

	if let Some(pn) = metadata.patient_name.as_deref() {
		let name = HumanName::from_dicom_pn(pn);
		if !updated.name.contains(&name) {
			updated.name = vec![name];
		}
	}
	if let Some(birth_date) = metadata.patient_birth_date.as_deref().and_then(date_from_da) {
		updated.birth_date = Some(birth_date);
	}
	if let Some(gender) = metadata.patient_sex.as_deref().map(gender_from_cs) {
		updated.gender = Some(gender);
	}

	(updated != *found).then_some(updated)
}

fn target_reference(patient: &Patient) -> Result<String, CastError> {
	patient
		.id
		.as_deref()
		.map(|id| format!("Patient/{id}"))
		.ok_or(CastError::InvalidArgument("existing patient without id"))
}

/// Maps DICOM PatientSex (0010,0040) to FHIR administrative gender.
fn gender_from_cs(value: &str) -> String {
	match value.trim() {
		"M" => String::from("male"),
		"F" => String::from("female"),
		"O" => String::from("other"),
		_ => String::from("unknown"),
	}
}
