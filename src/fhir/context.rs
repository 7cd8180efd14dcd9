//! The per-event context chain threaded through the resolution handlers.
//!
//! Each stage's context type adds exactly one resolved resource and offers a
//! single `with_*` constructor producing the next stage's type, so the
//! compiler enforces the fixed dependency order Endpoint → Patient →
//! ImagingStudy. Contexts are plain values; advancing a stage moves the
//! builder into the next context instead of sharing mutable state.

use crate::error::CastError;
use crate::fhir::model::{Endpoint, ImagingStudy, Patient};
use crate::fhir::transaction::TransactionBuilder;

fn reference_for(resource_type: &str, id: Option<&str>) -> Result<String, CastError> {
	let id = id.ok_or(CastError::InvalidArgument("resource without id"))?;
	if id.starts_with("urn:uuid:") {
		Ok(id.to_owned())
	} else {
		Ok(format!("{resource_type}/{id}"))
	}
}

/// Root context: nothing resolved yet.
#[derive(Debug)]
pub struct TransactionContext {
	pub builder: TransactionBuilder,
}

impl TransactionContext {
	pub fn new(builder: TransactionBuilder) -> Self {
		Self { builder }
	}

	pub fn with_endpoint(self, endpoint: Endpoint) -> EndpointContext {
		EndpointContext {
			builder: self.builder,
			endpoint,
		}
	}
}

/// Context after the endpoint stage.
#[derive(Debug)]
pub struct EndpointContext {
	pub builder: TransactionBuilder,
	endpoint: Endpoint,
}

impl EndpointContext {
	pub fn endpoint(&self) -> &Endpoint {
		&self.endpoint
	}

	/// Transaction-local reference to the resolved endpoint.
	pub fn endpoint_reference(&self) -> Result<String, CastError> {
		reference_for("Endpoint", self.endpoint.id.as_deref())
	}

	pub fn with_patient(self, patient: Patient) -> PatientContext {
		PatientContext {
			builder: self.builder,
			endpoint: self.endpoint,
			patient,
		}
	}
}

/// Context after the patient stage.
#[derive(Debug)]
pub struct PatientContext {
	pub builder: TransactionBuilder,
	endpoint: Endpoint,
	patient: Patient,
}

impl PatientContext {
	pub fn endpoint(&self) -> &Endpoint {
		&self.endpoint
	}

	pub fn endpoint_reference(&self) -> Result<String, CastError> {
		reference_for("Endpoint", self.endpoint.id.as_deref())
	}

	pub fn patient(&self) -> &Patient {
		&self.patient
	}

	pub fn patient_reference(&self) -> Result<String, CastError> {
		reference_for("Patient", self.patient.id.as_deref())
	}

	pub fn with_study(self, study: ImagingStudy) -> StudyContext {
		StudyContext {
			builder: self.builder,
			endpoint: self.endpoint,
			patient: self.patient,
			study,
		}
	}
}

/// Context after the imaging-study stage; the chain's final shape.
#[derive(Debug)]
pub struct StudyContext {
	pub builder: TransactionBuilder,
	endpoint: Endpoint,
	patient: Patient,
	study: ImagingStudy,
}

impl StudyContext {
	pub fn endpoint(&self) -> &Endpoint {
		&self.endpoint
	}

	pub fn patient(&self) -> &Patient {
		&self.patient
	}

	pub fn study(&self) -> &ImagingStudy {
		&self.study
	}

	/// Hands the accumulated operations over for submission, discarding the
	/// resolved resources.
	pub fn into_builder(self) -> TransactionBuilder {
		self.builder
	}
}
