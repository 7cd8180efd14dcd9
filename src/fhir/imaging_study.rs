use crate::changefeed::ChangeFeedAction;
use crate::error::CastError;
use crate::fhir::client::{FhirStore, SearchParams};
use crate::fhir::context::{PatientContext, StudyContext};
use crate::fhir::model::{
	date_from_da, placeholder_id, Coding, Identifier, ImagingStudy, ImagingStudyInstance,
	ImagingStudySeries, Reference, Resource, DICOM_UID_SYSTEM, URN_IETF_RFC_3986,
};
use crate::types::InstanceMetadata;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DCM_MODALITY_SYSTEM: &str = "http://dicom.nema.org/resources/ontology/DCM";

/// Resolves the ImagingStudy resource for the event's study UID and folds
/// the series/instance hierarchy into it.
///
/// Re-processing the same event is idempotent: a study that already contains
/// the instance resolves without staging anything.
pub struct ImagingStudyHandler {
	store: Arc<dyn FhirStore>,
}

impl ImagingStudyHandler {
	pub fn new(store: Arc<dyn FhirStore>) -> Self {
		Self { store }
	}

	/// # Errors
	/// Returns [`CastError::ConflictDetected`] if the existing study belongs
	/// to a different patient or the lookup is ambiguous.
	pub async fn resolve(
		&self,
		mut ctx: PatientContext,
		metadata: &InstanceMetadata,
		action: ChangeFeedAction,
		cancel: &CancellationToken,
	) -> Result<StudyContext, CastError> {
		let study_uid = metadata.identifiers.study_instance_uid();
		let identifier = Identifier::new(DICOM_UID_SYSTEM, format!("urn:oid:{study_uid}"));
		let params = SearchParams::new().add("identifier", identifier.token());
		let matches = self
			.store
			.search("ImagingStudy", &params, 2, cancel)
			.await?;
		let mut studies: Vec<ImagingStudy> = matches
			.into_iter()
			.filter_map(|resource| match resource {
				Resource::ImagingStudy(study) => Some(study),
				_ => None,
			})
			.collect();

		let patient_reference = ctx.patient_reference()?;
		let endpoint_reference = ctx.endpoint_reference()?;

		let study = match studies.len() {
			0 => match action {
				ChangeFeedAction::Create => {
					let study = expected_study(
						identifier,
						metadata,
						&patient_reference,
						&endpoint_reference,
					);
					debug!(study_uid, "Staging new imaging study");
					ctx.builder
						.create(Resource::ImagingStudy(study.clone()), Some(params.to_query()));
					study
				}
				// Nothing to prune; resolve to an empty in-memory
				// representation without staging anything
				ChangeFeedAction::Delete => {
					debug!(study_uid, "No imaging study to prune");
					ImagingStudy {
						identifier: vec![identifier],
						status: String::from("unknown"),
						subject: Reference::new(patient_reference),
						..ImagingStudy::default()
					}
				}
			},
			1 => {
				let found = studies.remove(0);
				if let Some(subject) = found.subject.reference.as_deref() {
					if subject != patient_reference {
						return Err(CastError::ConflictDetected {
							resource_type: "ImagingStudy",
							expected: patient_reference,
							found: subject.to_owned(),
						});
					}
				}

				let (merged, changed) = match action {
					ChangeFeedAction::Create => {
						merge_instance(found, metadata, &endpoint_reference)
					}
					ChangeFeedAction::Delete => prune_instance(found, metadata),
				};

				if changed {
					let id = merged
						.id
						.as_deref()
						.ok_or(CastError::InvalidArgument("existing study without id"))?;
					ctx.builder.update(
						format!("ImagingStudy/{id}"),
						Resource::ImagingStudy(merged.clone()),
					);
				}
				merged
			}
			count => {
				return Err(CastError::ConflictDetected {
					resource_type: "ImagingStudy",
					expected: format!("a single study with identifier {}", identifier.token()),
					found: format!("{count} matching studies"),
				});
			}
		};

		Ok(ctx.with_study(study))
	}
}

fn expected_study(
	identifier: Identifier,
	metadata: &InstanceMetadata,
	patient_reference: &str,
	endpoint_reference: &str,
) -> ImagingStudy {
	let mut study = ImagingStudy {
		id: Some(placeholder_id()),
		identifier: vec![identifier],
		status: String::from("available"),
		modality: metadata
			.modality
			.as_deref()
			.map(|modality| Coding::new(DCM_MODALITY_SYSTEM, modality))
			.into_iter()
			.collect(),
		subject: Reference::new(patient_reference),
		started: metadata.study_date.as_deref().and_then(date_from_da),
		endpoint: vec![Reference::new(endpoint_reference)],
		description: metadata.study_description.clone(),
		series: vec![new_series(metadata)],
		..ImagingStudy::default()
	};
	refresh_counters(&mut study);
	study
}

fn new_series(metadata: &InstanceMetadata) -> ImagingStudySeries {
	ImagingStudySeries {
		uid: metadata.identifiers.series_instance_uid().to_owned(),
		number: parse_number(metadata.series_number.as_deref()),
		modality: Coding::new(
			DCM_MODALITY_SYSTEM,
			metadata.modality.clone().unwrap_or_else(|| String::from("OT")),
		),
		description: None,
		number_of_instances: Some(1),
		instance: vec![new_instance(metadata)],
	}
}

fn new_instance(metadata: &InstanceMetadata) -> ImagingStudyInstance {
	ImagingStudyInstance {
		uid: metadata.identifiers.sop_instance_uid().to_owned(),
		sop_class: metadata
			.sop_class_uid
			.as_deref()
			.map(|uid| Coding::new(URN_IETF_RFC_3986, format!("urn:oid:{uid}")))
			.unwrap_or_default(),
		number: parse_number(metadata.instance_number.as_deref()),
	}
}

/// Folds the event's series/instance into an existing study. Returns the
/// merged study and whether anything changed.
fn merge_instance(
	mut study: ImagingStudy,
	metadata: &InstanceMetadata,
	endpoint_reference: &str,
) -> (ImagingStudy, bool) {
	let mut changed = false;

	if !study
		.endpoint
		.iter()
		.any(|reference| reference.reference.as_deref() == Some(endpoint_reference))
	{
		study.endpoint.push(Reference::new(endpoint_reference));
		changed = true;
	}

	if let Some(modality) = metadata.modality.as_deref() {
		if !study
			.modality
			.iter()
			.any(|coding| coding.code.as_deref() == Some(modality))
		{
			study.modality.push(Coding::new(DCM_MODALITY_SYSTEM, modality));
			changed = true;
		}
	}

	if study.started.is_none() {
		if let Some(started) = metadata.study_date.as_deref().and_then(date_from_da) {
			study.started = Some(started);
			changed = true;
		}
	}

	let series_uid = metadata.identifiers.series_instance_uid();
	match study.series.iter_mut().find(|series| series.uid == series_uid) {
		Some(series) => {
			let sop_uid = metadata.identifiers.sop_instance_uid();
			if !series.instance.iter().any(|instance| instance.uid == sop_uid) {
				series.instance.push(new_instance(metadata));
				changed = true;
			}
		}
		None => {
			study.series.push(new_series(metadata));
			changed = true;
		}
	}

	if changed {
		refresh_counters(&mut study);
	}
	(study, changed)
}

/// Removes the event's instance from an existing study, dropping the series
/// once it empties.
fn prune_instance(mut study: ImagingStudy, metadata: &InstanceMetadata) -> (ImagingStudy, bool) {
	let series_uid = metadata.identifiers.series_instance_uid();
	let sop_uid = metadata.identifiers.sop_instance_uid();

	let Some(series_index) = study.series.iter().position(|series| series.uid == series_uid)
	else {
		return (study, false);
	};
	let series = &mut study.series[series_index];
	let Some(instance_index) = series.instance.iter().position(|instance| instance.uid == sop_uid)
	else {
		return (study, false);
	};

	series.instance.remove(instance_index);
	if series.instance.is_empty() {
		study.series.remove(series_index);
	}
	refresh_counters(&mut study);
	(study, true)
}

fn refresh_counters(study: &mut ImagingStudy) {
	for series in &mut study.series {
		series.number_of_instances = Some(series.instance.len() as u32);
	}
	study.number_of_series = Some(study.series.len() as u32);
	study.number_of_instances = Some(
		study
			.series
			.iter()
			.map(|series| series.instance.len() as u32)
			.sum(),
	);
}

fn parse_number(value: Option<&str>) -> Option<u32> {
	value.and_then(|value| value.trim().parse().ok())
}
