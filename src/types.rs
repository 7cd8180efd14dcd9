use crate::error::CastError;
use dicom::core::Tag;
use dicom::dictionary_std::tags;
use dicom::object::mem::InMemElement;
use dicom::object::InMemDicomObject;
use std::fmt::{Display, Formatter};

/// UI (Unique Identifier) value representation.
pub type UI = String;

/// Uniquely identifies a single SOP instance by its (study, series, instance)
/// UID triple.
///
/// Identifiers are validated on construction and immutable afterwards, so a
/// value can safely key a deduplication set across repeated or out-of-order
/// change-feed events for the same instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceIdentifiers {
	study_instance_uid: UI,
	series_instance_uid: UI,
	sop_instance_uid: UI,
}

impl InstanceIdentifiers {
	/// # Errors
	/// Returns [`CastError::InvalidArgument`] if any UID is empty or
	/// whitespace-only.
	pub fn new(
		study_instance_uid: impl Into<UI>,
		series_instance_uid: impl Into<UI>,
		sop_instance_uid: impl Into<UI>,
	) -> Result<Self, CastError> {
		let study_instance_uid = study_instance_uid.into();
		let series_instance_uid = series_instance_uid.into();
		let sop_instance_uid = sop_instance_uid.into();

		if study_instance_uid.trim().is_empty() {
			return Err(CastError::InvalidArgument("StudyInstanceUID"));
		}
		if series_instance_uid.trim().is_empty() {
			return Err(CastError::InvalidArgument("SeriesInstanceUID"));
		}
		if sop_instance_uid.trim().is_empty() {
			return Err(CastError::InvalidArgument("SOPInstanceUID"));
		}

		Ok(Self {
			study_instance_uid,
			series_instance_uid,
			sop_instance_uid,
		})
	}

	pub fn study_instance_uid(&self) -> &str {
		&self.study_instance_uid
	}

	pub fn series_instance_uid(&self) -> &str {
		&self.series_instance_uid
	}

	pub fn sop_instance_uid(&self) -> &str {
		&self.sop_instance_uid
	}
}

impl Display for InstanceIdentifiers {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		write!(
			f,
			"{}/{}/{}",
			self.study_instance_uid, self.series_instance_uid, self.sop_instance_uid
		)
	}
}

/// DICOM-derived facts required by the resource resolution handlers.
///
/// The change feed supplies instance metadata as an already-validated data
/// set; this struct lifts the handful of attributes the pipeline cares about
/// into typed fields.
#[derive(Debug, Clone)]
pub struct InstanceMetadata {
	pub identifiers: InstanceIdentifiers,
	pub sop_class_uid: Option<UI>,
	pub patient_id: String,
	pub patient_name: Option<String>,
	pub patient_birth_date: Option<String>,
	pub patient_sex: Option<String>,
	pub modality: Option<String>,
	pub instance_number: Option<String>,
	pub series_number: Option<String>,
	pub study_date: Option<String>,
	pub study_description: Option<String>,
}

impl InstanceMetadata {
	/// Extracts the pipeline-relevant attributes from a DICOM data set.
	///
	/// # Errors
	/// Returns [`CastError::InvalidArgument`] if an identifier UID or the
	/// PatientID is missing.
	pub fn from_dataset(dataset: &InMemDicomObject) -> Result<Self, CastError> {
		let study = string_value(dataset, tags::STUDY_INSTANCE_UID)
			.ok_or(CastError::InvalidArgument("StudyInstanceUID"))?;
		let series = string_value(dataset, tags::SERIES_INSTANCE_UID)
			.ok_or(CastError::InvalidArgument("SeriesInstanceUID"))?;
		let sop = string_value(dataset, tags::SOP_INSTANCE_UID)
			.ok_or(CastError::InvalidArgument("SOPInstanceUID"))?;
		let patient_id = string_value(dataset, tags::PATIENT_ID)
			.ok_or(CastError::InvalidArgument("PatientID"))?;

		Ok(Self {
			identifiers: InstanceIdentifiers::new(study, series, sop)?,
			sop_class_uid: string_value(dataset, tags::SOP_CLASS_UID),
			patient_id,
			patient_name: string_value(dataset, tags::PATIENT_NAME),
			patient_birth_date: string_value(dataset, tags::PATIENT_BIRTH_DATE),
			patient_sex: string_value(dataset, tags::PATIENT_SEX),
			modality: string_value(dataset, tags::MODALITY),
			instance_number: string_value(dataset, tags::INSTANCE_NUMBER),
			series_number: string_value(dataset, tags::SERIES_NUMBER),
			study_date: string_value(dataset, tags::STUDY_DATE),
			study_description: string_value(dataset, tags::STUDY_DESCRIPTION),
		})
	}
}

fn string_value(dataset: &InMemDicomObject, tag: Tag) -> Option<String> {
	dataset
		.get(tag)
		.map(InMemElement::to_str)
		.and_then(Result::ok)
		.map(|value| value.trim().to_owned())
		.filter(|value| !value.is_empty())
}
