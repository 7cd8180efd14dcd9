//! Composition and submission of the per-event FHIR transaction.
//!
//! Each resolution handler maps DICOM-derived facts to one FHIR resource,
//! reusing the remote resource when it matches the expected state, staging a
//! create/update on the shared [`transaction::TransactionBuilder`] when it
//! does not, and failing with a conflict when the two disagree. The
//! accumulated operations are submitted as a single atomic bundle.

pub mod client;
pub mod context;
pub mod endpoint;
pub mod imaging_study;
pub mod model;
pub mod patient;
pub mod transaction;

use crate::changefeed::ChangeFeedAction;
use crate::config::AppConfig;
use crate::error::CastError;
use crate::types::InstanceMetadata;
use client::FhirStore;
use context::TransactionContext;
use endpoint::EndpointHandler;
use imaging_study::ImagingStudyHandler;
use patient::PatientHandler;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use transaction::{TransactionBuilder, TransactionResult};

/// Runs the fixed handler chain Endpoint → Patient → ImagingStudy for one
/// change-feed event and submits whatever the handlers staged.
///
/// Every event passes through every stage in order; the first error aborts
/// the remaining stages and nothing is submitted. Composition before the
/// submit is purely in-memory, so any pre-submit failure leaves the remote
/// store untouched.
pub struct CastPipeline {
	store: Arc<dyn FhirStore>,
	endpoint: EndpointHandler,
	patient: PatientHandler,
	imaging_study: ImagingStudyHandler,
}

impl CastPipeline {
	pub fn new(store: Arc<dyn FhirStore>, config: &AppConfig) -> Self {
		Self {
			endpoint: EndpointHandler::new(Arc::clone(&store), &config.dicom),
			patient: PatientHandler::new(
				Arc::clone(&store),
				config.fhir.patient_identifier_system.clone(),
			),
			imaging_study: ImagingStudyHandler::new(Arc::clone(&store)),
			store,
		}
	}

	/// # Errors
	/// Propagates the first error a stage encounters; see
	/// [`CastError`](crate::error::CastError) for the taxonomy.
	#[instrument(skip_all, fields(instance = %metadata.identifiers))]
	pub async fn process(
		&self,
		action: ChangeFeedAction,
		metadata: &InstanceMetadata,
		cancel: &CancellationToken,
	) -> Result<TransactionResult, CastError> {
		let ctx = TransactionContext::new(TransactionBuilder::new());
		let ctx = self.endpoint.resolve(ctx, cancel).await?;
		let ctx = self.patient.resolve(ctx, metadata, cancel).await?;
		let ctx = self
			.imaging_study
			.resolve(ctx, metadata, action, cancel)
			.await?;

		let builder = ctx.into_builder();
		if builder.is_empty() {
			debug!("Remote state already matches; nothing to submit");
			return Ok(TransactionResult::default());
		}
		builder.submit(self.store.as_ref(), cancel).await
	}
}

#[cfg(test)]
pub(crate) mod testing {
	use super::client::{FhirStore, SearchParams};
	use super::model::Resource;
	use super::transaction::TransactionResult;
	use crate::error::CastError;
	use async_trait::async_trait;
	use serde_json::Value;
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
	use std::sync::Mutex;
	use tokio_util::sync::CancellationToken;

	/// In-memory [`FhirStore`] double.
	///
	/// Mimics the server behavior the handlers rely on: token matching on
	/// the search parameters they use, atomic transaction application, and
	/// rewriting of `urn:uuid:` placeholder references to assigned ids.
	#[derive(Default)]
	pub struct MemoryFhirStore {
		resources: Mutex<Vec<Resource>>,
		transactions: Mutex<Vec<Value>>,
		reject: AtomicBool,
		next_id: AtomicUsize,
	}

	impl MemoryFhirStore {
		pub fn seed(&self, resource: Resource) {
			self.resources.lock().unwrap().push(resource);
		}

		/// All subsequent transactions are rejected without being applied.
		pub fn reject_transactions(&self) {
			self.reject.store(true, Ordering::SeqCst);
		}

		pub fn resources(&self) -> Vec<Resource> {
			self.resources.lock().unwrap().clone()
		}

		/// The accepted transaction bundles, in submission order.
		pub fn transactions(&self) -> Vec<Value> {
			self.transactions.lock().unwrap().clone()
		}

		fn matches(resource: &Resource, name: &str, value: &str) -> bool {
			match (resource, name) {
				(Resource::Endpoint(endpoint), "name") => endpoint.name.as_deref() == Some(value),
				(Resource::Endpoint(endpoint), "connection-type") => {
					let token = format!(
						"{}|{}",
						endpoint.connection_type.system.as_deref().unwrap_or_default(),
						endpoint.connection_type.code.as_deref().unwrap_or_default()
					);
					token == value
				}
				(Resource::Patient(patient), "identifier") => patient
					.identifier
					.iter()
					.any(|identifier| identifier.token() == value),
				(Resource::ImagingStudy(study), "identifier") => study
					.identifier
					.iter()
					.any(|identifier| identifier.token() == value),
				_ => false,
			}
		}
	}

	#[async_trait]
	impl FhirStore for MemoryFhirStore {
		async fn search(
			&self,
			resource_type: &str,
			params: &SearchParams,
			limit: usize,
			cancel: &CancellationToken,
		) -> Result<Vec<Resource>, CastError> {
			if cancel.is_cancelled() {
				return Err(CastError::Cancelled);
			}
			let resources = self.resources.lock().unwrap();
			let mut matches: Vec<Resource> = resources
				.iter()
				.filter(|resource| {
					resource.resource_type() == resource_type
						&& params
							.pairs()
							.iter()
							.all(|(name, value)| Self::matches(resource, name, value))
				})
				.cloned()
				.collect();
			matches.truncate(limit);
			Ok(matches)
		}

		async fn transaction(
			&self,
			bundle: Value,
			cancel: &CancellationToken,
		) -> Result<TransactionResult, CastError> {
			if cancel.is_cancelled() {
				return Err(CastError::Cancelled);
			}
			if self.reject.load(Ordering::SeqCst) {
				return Err(CastError::RemoteRejected {
					status: 422,
					diagnostics: String::from("rejected by test double"),
				});
			}

			let entries = bundle
				.get("entry")
				.and_then(Value::as_array)
				.cloned()
				.unwrap_or_default();

			// Assign server ids to created resources up front so placeholder
			// references can be rewritten the way a FHIR server resolves
			// urn:uuid links inside a transaction
			let mut assigned: Vec<Option<String>> = Vec::with_capacity(entries.len());
			let mut mapping: Vec<(String, String)> = Vec::new();
			for entry in &entries {
				let method = entry
					.pointer("/request/method")
					.and_then(Value::as_str)
					.unwrap_or_default();
				if method == "POST" {
					let id = format!("srv-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
					if let (Some(full_url), Some(resource_type)) = (
						entry.get("fullUrl").and_then(Value::as_str),
						entry.pointer("/resource/resourceType").and_then(Value::as_str),
					) {
						mapping.push((full_url.to_owned(), format!("{resource_type}/{id}")));
					}
					assigned.push(Some(id));
				} else {
					assigned.push(None);
				}
			}

			let mut statuses = Vec::with_capacity(entries.len());
			let mut resources = self.resources.lock().unwrap();
			for (entry, id) in entries.iter().zip(assigned) {
				let mut body = entry.get("resource").cloned().unwrap_or(Value::Null).to_string();
				for (from, to) in &mapping {
					body = body.replace(from.as_str(), to);
				}
				let mut body: Value = serde_json::from_str(&body).unwrap();

				match id {
					Some(id) => {
						body["id"] = Value::String(id);
						let resource: Resource = serde_json::from_value(body).unwrap();
						resources.push(resource);
						statuses.push(String::from("201 Created"));
					}
					None => {
						let target = entry
							.pointer("/request/url")
							.and_then(Value::as_str)
							.unwrap_or_default();
						let resource: Resource = serde_json::from_value(body).unwrap();
						if let Some(existing) = resources
							.iter_mut()
							.find(|existing| existing.local_reference().as_deref() == Some(target))
						{
							*existing = resource;
						}
						statuses.push(String::from("200 OK"));
					}
				}
			}
			drop(resources);

			self.transactions.lock().unwrap().push(bundle);
			Ok(TransactionResult {
				entry_status: statuses,
			})
		}
	}
}

#[cfg(test)]
mod tests {
	use super::testing::MemoryFhirStore;
	use super::*;
	use crate::config::{
		AuthConfig, ChangeFeedConfig, DicomWebConfig, FhirConfig, TelemetryConfig,
	};
	use crate::fhir::model::{Coding, Endpoint, Resource, DICOM_WADO_RS, ENDPOINT_CONNECTION_TYPE_SYSTEM};
	use crate::types::InstanceIdentifiers;
	use url::Url;

	fn test_config() -> AppConfig {
		AppConfig {
			telemetry: TelemetryConfig {
				level: String::from("INFO"),
				sentry: None,
			},
			dicom: DicomWebConfig {
				service_url: Url::parse("https://dicom.example.com/v2").unwrap(),
				workspace: String::from("research"),
				service: String::from("pacs"),
			},
			fhir: FhirConfig {
				service_url: Url::parse("https://fhir.example.com/fhir").unwrap(),
				patient_identifier_system: String::from("urn:example:patient-id"),
			},
			auth: AuthConfig::default(),
			changefeed: ChangeFeedConfig {
				poll_interval: 1000,
				batch_size: 10,
				offset: 0,
			},
		}
	}

	fn metadata() -> InstanceMetadata {
		InstanceMetadata {
			identifiers: InstanceIdentifiers::new("1.2.3", "1.2.3.4", "1.2.3.4.5").unwrap(),
			sop_class_uid: Some(String::from("1.2.840.10008.5.1.4.1.1.2")),
			patient_id: String::from("PAT-42"),
			patient_name: Some(String::from("MUSTERMANN^MAX")),
			patient_birth_date: Some(String::from("19700102")),
			patient_sex: Some(String::from("M")),
			modality: Some(String::from("CT")),
			instance_number: Some(String::from("1")),
			series_number: Some(String::from("2")),
			study_date: Some(String::from("20240321")),
			study_description: Some(String::from("Thorax CT")),
		}
	}

	#[tokio::test]
	async fn first_event_stages_the_full_hierarchy_in_one_transaction() {
		let store = Arc::new(MemoryFhirStore::default());
		let pipeline = CastPipeline::new(store.clone(), &test_config());

		let result = pipeline
			.process(
				ChangeFeedAction::Create,
				&metadata(),
				&CancellationToken::new(),
			)
			.await
			.unwrap();

		assert_eq!(result.applied(), 3);
		let transactions = store.transactions();
		assert_eq!(transactions.len(), 1);

		let entries = transactions[0]["entry"].as_array().unwrap();
		assert_eq!(entries.len(), 3);
		assert_eq!(entries[0]["resource"]["resourceType"], "Endpoint");
		assert_eq!(
			entries[0]["resource"]["address"],
			"https://dicom.example.com/v2"
		);
		assert_eq!(
			entries[0]["resource"]["connectionType"]["code"],
			DICOM_WADO_RS
		);
		assert_eq!(entries[1]["resource"]["resourceType"], "Patient");
		assert_eq!(entries[2]["resource"]["resourceType"], "ImagingStudy");

		// Later entries reference earlier staged resources by placeholder
		let endpoint_url = entries[0]["fullUrl"].as_str().unwrap();
		let patient_url = entries[1]["fullUrl"].as_str().unwrap();
		assert_eq!(
			entries[2]["resource"]["endpoint"][0]["reference"],
			endpoint_url
		);
		assert_eq!(
			entries[2]["resource"]["subject"]["reference"],
			patient_url
		);
	}

	#[tokio::test]
	async fn conflicting_endpoint_address_aborts_before_any_submission() {
		let store = Arc::new(MemoryFhirStore::default());
		store.seed(Resource::Endpoint(Endpoint {
			id: Some(String::from("ep-1")),
			status: String::from("active"),
			connection_type: Coding::new(ENDPOINT_CONNECTION_TYPE_SYSTEM, DICOM_WADO_RS),
			name: Some(String::from(
				"DICOM Service research/pacs WADO-RS Endpoint",
			)),
			address: String::from("https://somewhere-else.example.com"),
			..Endpoint::default()
		}));
		let pipeline = CastPipeline::new(store.clone(), &test_config());

		let result = pipeline
			.process(
				ChangeFeedAction::Create,
				&metadata(),
				&CancellationToken::new(),
			)
			.await;

		match result {
			Err(CastError::ConflictDetected {
				expected, found, ..
			}) => {
				assert_eq!(expected, "https://dicom.example.com/v2");
				assert_eq!(found, "https://somewhere-else.example.com");
			}
			other => panic!("expected ConflictDetected, got {other:?}"),
		}
		assert!(store.transactions().is_empty());
	}

	#[tokio::test]
	async fn reprocessing_the_same_event_submits_nothing() {
		let store = Arc::new(MemoryFhirStore::default());
		let pipeline = CastPipeline::new(store.clone(), &test_config());
		let cancel = CancellationToken::new();

		let first = pipeline
			.process(ChangeFeedAction::Create, &metadata(), &cancel)
			.await
			.unwrap();
		assert_eq!(first.applied(), 3);

		let second = pipeline
			.process(ChangeFeedAction::Create, &metadata(), &cancel)
			.await
			.unwrap();
		assert_eq!(second.applied(), 0);
		assert_eq!(store.transactions().len(), 1);
	}

	#[tokio::test]
	async fn rejected_transaction_leaves_the_store_unchanged() {
		let store = Arc::new(MemoryFhirStore::default());
		store.reject_transactions();
		let pipeline = CastPipeline::new(store.clone(), &test_config());

		let result = pipeline
			.process(
				ChangeFeedAction::Create,
				&metadata(),
				&CancellationToken::new(),
			)
			.await;

		assert!(matches!(result, Err(CastError::RemoteRejected { .. })));
		assert!(store.resources().is_empty());
		assert!(store.transactions().is_empty());
	}

	#[tokio::test]
	async fn cancellation_aborts_without_partial_submission() {
		let store = Arc::new(MemoryFhirStore::default());
		let pipeline = CastPipeline::new(store.clone(), &test_config());

		let cancel = CancellationToken::new();
		cancel.cancel();
		let result = pipeline
			.process(ChangeFeedAction::Create, &metadata(), &cancel)
			.await;

		assert!(matches!(result, Err(CastError::Cancelled)));
		assert!(store.transactions().is_empty());
	}

	#[tokio::test]
	async fn delete_event_prunes_the_previously_created_instance() {
		let store = Arc::new(MemoryFhirStore::default());
		let pipeline = CastPipeline::new(store.clone(), &test_config());
		let cancel = CancellationToken::new();

		pipeline
			.process(ChangeFeedAction::Create, &metadata(), &cancel)
			.await
			.unwrap();
		let result = pipeline
			.process(ChangeFeedAction::Delete, &metadata(), &cancel)
			.await
			.unwrap();
		assert_eq!(result.applied(), 1);

		let study = store
			.resources()
			.into_iter()
			.find_map(|resource| match resource {
				Resource::ImagingStudy(study) => Some(study),
				_ => None,
			})
			.unwrap();
		assert!(study.series.is_empty());
		assert_eq!(study.number_of_instances, Some(0));
	}
}
