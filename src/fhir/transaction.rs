use crate::error::CastError;
use crate::fhir::client::FhirStore;
use crate::fhir::model::Resource;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

/// A single staged remote operation.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingOperation {
	/// POST a new resource. `full_url` is the transaction-local placeholder
	/// identity other staged resources may reference.
	Create {
		full_url: String,
		resource: Resource,
		/// Identity search rendered as an `If-None-Exist` precondition, so
		/// racing pipeline runs cannot create the resource twice on servers
		/// that honor conditional create.
		if_none_exist: Option<String>,
	},
	/// PUT new state over an existing resource.
	Update { target: String, resource: Resource },
}

impl PendingOperation {
	/// Transaction-local identity used for idempotent merging.
	fn identity(&self) -> &str {
		match self {
			Self::Create { full_url, .. } => full_url,
			Self::Update { target, .. } => target,
		}
	}
}

/// Accumulates pending operations and submits them as one atomic FHIR
/// transaction bundle.
///
/// Composition is purely in-memory; no I/O happens before [`Self::submit`],
/// which consumes the builder so an instance cannot be reused after the
/// operations were handed to the remote store.
#[derive(Debug, Default)]
pub struct TransactionBuilder {
	operations: Vec<PendingOperation>,
}

impl TransactionBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.operations.len()
	}

	pub fn is_empty(&self) -> bool {
		self.operations.is_empty()
	}

	pub fn operations(&self) -> &[PendingOperation] {
		&self.operations
	}

	/// Stages an unconditional create and returns the transaction-local
	/// reference for the staged resource.
	///
	/// The resource's placeholder id (`urn:uuid:…`) becomes the entry's
	/// fullUrl; a fresh placeholder is generated if the resource carries no
	/// id yet.
	pub fn create(&mut self, resource: Resource, if_none_exist: Option<String>) -> String {
		let full_url = match resource.local_reference() {
			Some(reference) if reference.starts_with("urn:uuid:") => reference,
			_ => crate::fhir::model::placeholder_id(),
		};
		self.push(PendingOperation::Create {
			full_url: full_url.clone(),
			resource,
			if_none_exist,
		});
		full_url
	}

	/// Stages an update scoped to the identity of an existing resource
	/// (`<type>/<id>`).
	pub fn update(&mut self, target: impl Into<String>, resource: Resource) {
		self.push(PendingOperation::Update {
			target: target.into(),
			resource,
		});
	}

	/// Later operations for the same resource identity supersede earlier
	/// ones in place; the bundle never contains two entries for one
	/// identity.
	fn push(&mut self, operation: PendingOperation) {
		if let Some(existing) = self
			.operations
			.iter_mut()
			.find(|existing| existing.identity() == operation.identity())
		{
			*existing = operation;
		} else {
			self.operations.push(operation);
		}
	}

	/// Sends all staged operations as one atomic batch. An empty builder
	/// performs no I/O.
	///
	/// # Errors
	/// Propagates [`CastError::RemoteRejected`] if the store refused the
	/// batch (nothing was applied) and [`CastError::Cancelled`] if the
	/// submission was cancelled in flight.
	pub async fn submit(
		self,
		store: &dyn FhirStore,
		cancel: &CancellationToken,
	) -> Result<TransactionResult, CastError> {
		if self.operations.is_empty() {
			return Ok(TransactionResult::default());
		}
		let bundle = self.into_bundle()?;
		store.transaction(bundle, cancel).await
	}

	/// Assembles the staged operations into a FHIR `transaction` bundle.
	pub fn into_bundle(self) -> Result<Value, CastError> {
		let mut entries = Vec::with_capacity(self.operations.len());
		for operation in self.operations {
			entries.push(match operation {
				PendingOperation::Create {
					full_url,
					resource,
					if_none_exist,
				} => {
					let resource_type = resource.resource_type();
					let mut body = serde_json::to_value(&resource)
						.map_err(|_| CastError::InvalidArgument("unserializable resource"))?;
					// The placeholder identity lives on the entry, not in the resource body
					if let Some(object) = body.as_object_mut() {
						object.remove("id");
					}
					let mut request = json!({
						"method": "POST",
						"url": resource_type,
					});
					if let Some(condition) = if_none_exist {
						request["ifNoneExist"] = Value::String(condition);
					}
					json!({
						"fullUrl": full_url,
						"resource": body,
						"request": request,
					})
				}
				PendingOperation::Update { target, resource } => {
					let body = serde_json::to_value(&resource)
						.map_err(|_| CastError::InvalidArgument("unserializable resource"))?;
					json!({
						"resource": body,
						"request": {
							"method": "PUT",
							"url": target,
						},
					})
				}
			});
		}

		Ok(json!({
			"resourceType": "Bundle",
			"type": "transaction",
			"entry": entries,
		}))
	}
}

/// Outcome of an accepted transaction: the per-entry response statuses in
/// submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionResult {
	pub entry_status: Vec<String>,
}

impl TransactionResult {
	pub fn applied(&self) -> usize {
		self.entry_status.len()
	}
}
