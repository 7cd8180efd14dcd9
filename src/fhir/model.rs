//! Minimal FHIR R4 resource representations.
//!
//! Only the fields this pipeline reads or writes are modelled; everything
//! else a server may return is ignored during deserialization. The remote
//! store owns the full wire format.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ENDPOINT_CONNECTION_TYPE_SYSTEM: &str =
	"http://terminology.hl7.org/CodeSystem/endpoint-connection-type";
/// Well-defined Endpoint connection type code for DICOM WADO-RS.
pub const DICOM_WADO_RS: &str = "dicom-wado-rs";
/// Identifier system for DICOM UIDs.
pub const DICOM_UID_SYSTEM: &str = "urn:dicom:uid";
/// sopClass codings use RFC 3986 URN values.
pub const URN_IETF_RFC_3986: &str = "urn:ietf:rfc:3986";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coding {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub code: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub display: Option<String>,
}

impl Coding {
	pub fn new(system: impl Into<String>, code: impl Into<String>) -> Self {
		Self {
			system: Some(system.into()),
			code: Some(code.into()),
			display: None,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeableConcept {
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub coding: Vec<Coding>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
}

impl From<Coding> for CodeableConcept {
	fn from(coding: Coding) -> Self {
		Self {
			coding: vec![coding],
			text: None,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub system: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub value: Option<String>,
}

impl Identifier {
	pub fn new(system: impl Into<String>, value: impl Into<String>) -> Self {
		Self {
			system: Some(system.into()),
			value: Some(value.into()),
		}
	}

	/// Token form (`system|value`) used in search parameters.
	pub fn token(&self) -> String {
		format!(
			"{}|{}",
			self.system.as_deref().unwrap_or_default(),
			self.value.as_deref().unwrap_or_default()
		)
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub reference: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub display: Option<String>,
}

impl Reference {
	pub fn new(reference: impl Into<String>) -> Self {
		Self {
			reference: Some(reference.into()),
			display: None,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanName {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub family: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub given: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub text: Option<String>,
}

impl HumanName {
	/// Splits a DICOM PN value (`Family^Given^Middle^…`) into its components.
	pub fn from_dicom_pn(pn: &str) -> Self {
		let mut parts = pn.split('^');
		let family = parts
			.next()
			.map(str::trim)
			.filter(|part| !part.is_empty())
			.map(ToOwned::to_owned);
		let given: Vec<String> = parts
			.map(str::trim)
			.filter(|part| !part.is_empty())
			.map(ToOwned::to_owned)
			.collect();

		Self {
			family,
			given,
			text: Some(pn.replace('^', " ").trim().to_owned()),
		}
	}
}

/// Converts a DICOM DA value (`YYYYMMDD`) to a FHIR date (`YYYY-MM-DD`).
pub fn date_from_da(da: &str) -> Option<String> {
	let da = da.trim();
	if da.len() != 8 || !da.bytes().all(|b| b.is_ascii_digit()) {
		return None;
	}
	Some(format!("{}-{}-{}", &da[..4], &da[4..6], &da[6..8]))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	pub status: String,
	pub connection_type: Coding,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub name: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub payload_type: Vec<CodeableConcept>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub payload_mime_type: Vec<String>,
	pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub identifier: Vec<Identifier>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub name: Vec<HumanName>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub gender: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub birth_date: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagingStudy {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub id: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub identifier: Vec<Identifier>,
	pub status: String,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub modality: Vec<Coding>,
	pub subject: Reference,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub started: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub endpoint: Vec<Reference>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub number_of_series: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub number_of_instances: Option<u32>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub series: Vec<ImagingStudySeries>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagingStudySeries {
	pub uid: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub number: Option<u32>,
	pub modality: Coding,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub number_of_instances: Option<u32>,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub instance: Vec<ImagingStudyInstance>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagingStudyInstance {
	pub uid: String,
	pub sop_class: Coding,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub number: Option<u32>,
}

/// The resource kinds this pipeline stages or resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resourceType")]
pub enum Resource {
	Endpoint(Endpoint),
	Patient(Patient),
	ImagingStudy(ImagingStudy),
}

impl Resource {
	pub const fn resource_type(&self) -> &'static str {
		match self {
			Self::Endpoint(_) => "Endpoint",
			Self::Patient(_) => "Patient",
			Self::ImagingStudy(_) => "ImagingStudy",
		}
	}

	pub fn id(&self) -> Option<&str> {
		match self {
			Self::Endpoint(endpoint) => endpoint.id.as_deref(),
			Self::Patient(patient) => patient.id.as_deref(),
			Self::ImagingStudy(study) => study.id.as_deref(),
		}
	}

	/// Reference string usable inside the current transaction: placeholder
	/// ids stay as-is, persisted ids become `<type>/<id>` references.
	pub fn local_reference(&self) -> Option<String> {
		self.id().map(|id| {
			if id.starts_with("urn:uuid:") {
				id.to_owned()
			} else {
				format!("{}/{id}", self.resource_type())
			}
		})
	}
}

/// Placeholder id for a resource that exists only in the staged transaction.
pub fn placeholder_id() -> String {
	format!("urn:uuid:{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn resource_enum_round_trips_by_resource_type() {
		let json = serde_json::json!({
			"resourceType": "Endpoint",
			"id": "ep-1",
			"status": "active",
			"connectionType": {
				"system": ENDPOINT_CONNECTION_TYPE_SYSTEM,
				"code": DICOM_WADO_RS,
			},
			"name": "Research PACS WADO-RS Endpoint",
			"address": "https://pacs.example.com",
			"managingOrganization": { "reference": "Organization/ignored" },
		});

		let resource: Resource = serde_json::from_value(json).unwrap();
		let Resource::Endpoint(endpoint) = &resource else {
			panic!("expected an Endpoint, got {resource:?}");
		};
		assert_eq!(endpoint.address, "https://pacs.example.com");
		assert_eq!(endpoint.connection_type.code.as_deref(), Some(DICOM_WADO_RS));

		let serialized = serde_json::to_value(&resource).unwrap();
		assert_eq!(serialized["resourceType"], "Endpoint");
		assert_eq!(serialized["connectionType"]["code"], DICOM_WADO_RS);
	}

	#[test]
	fn local_reference_distinguishes_placeholder_and_persisted_ids() {
		let mut patient = Patient {
			id: Some(placeholder_id()),
			..Patient::default()
		};
		let resource = Resource::Patient(patient.clone());
		assert!(resource
			.local_reference()
			.unwrap()
			.starts_with("urn:uuid:"));

		patient.id = Some(String::from("pat-7"));
		let resource = Resource::Patient(patient);
		assert_eq!(resource.local_reference().unwrap(), "Patient/pat-7");
	}

	#[test]
	fn human_name_from_pn_splits_components() {
		let name = HumanName::from_dicom_pn("MUSTERMANN^MAX^M");
		assert_eq!(name.family.as_deref(), Some("MUSTERMANN"));
		assert_eq!(name.given, vec!["MAX", "M"]);
		assert_eq!(name.text.as_deref(), Some("MUSTERMANN MAX M"));
	}

	#[test]
	fn date_from_da_accepts_only_eight_digit_values() {
		assert_eq!(date_from_da("19700102").as_deref(), Some("1970-01-02"));
		assert_eq!(date_from_da("1970"), None);
		assert_eq!(date_from_da("1970010a"), None);
	}
}
