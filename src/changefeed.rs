use crate::error::CastError;
use crate::fhir::client::AuthorizedDispatch;
use crate::types::{InstanceIdentifiers, InstanceMetadata};
use dicom::object::InMemDicomObject;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Action recorded for a change-feed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeFeedAction {
	Create,
	Delete,
}

/// One instance-level change reported by the DICOMweb service.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeFeedEntry {
	pub sequence: u64,
	pub action: ChangeFeedAction,
	pub study_instance_uid: String,
	pub series_instance_uid: String,
	pub sop_instance_uid: String,
	/// DICOM JSON metadata of the instance; absent for delete entries on
	/// most servers.
	#[serde(default)]
	pub metadata: Option<Value>,
}

impl ChangeFeedEntry {
	/// # Errors
	/// Returns [`CastError::InvalidArgument`] if any UID is empty.
	pub fn identifiers(&self) -> Result<InstanceIdentifiers, CastError> {
		InstanceIdentifiers::new(
			self.study_instance_uid.clone(),
			self.series_instance_uid.clone(),
			self.sop_instance_uid.clone(),
		)
	}

	/// Decodes the DICOM JSON metadata payload.
	pub fn dataset(&self) -> Result<Option<InMemDicomObject>, CastError> {
		let Some(metadata) = &self.metadata else {
			return Ok(None);
		};
		let dataset = dicom_json::from_str(&metadata.to_string())
			.map_err(|_| CastError::InvalidArgument("changefeed metadata is not DICOM JSON"))?;
		Ok(Some(dataset))
	}

	/// Extracts the typed facts the pipeline needs, or `None` when the entry
	/// carries no metadata.
	///
	/// # Errors
	/// Returns [`CastError::InvalidArgument`] if the metadata disagrees with
	/// the entry's own identifiers.
	pub fn facts(&self) -> Result<Option<InstanceMetadata>, CastError> {
		let Some(dataset) = self.dataset()? else {
			return Ok(None);
		};
		let facts = InstanceMetadata::from_dataset(&dataset)?;
		if facts.identifiers != self.identifiers()? {
			return Err(CastError::InvalidArgument(
				"changefeed entry and metadata identifiers disagree",
			));
		}
		Ok(Some(facts))
	}
}

/// Polls the DICOMweb change feed with the same bearer credential used for
/// FHIR calls.
pub struct ChangeFeedClient {
	dispatch: AuthorizedDispatch,
	base_url: Url,
	batch_size: usize,
}

impl ChangeFeedClient {
	pub fn new(
		base_url: Url,
		credential: Arc<dyn crate::auth::TokenCredential>,
		batch_size: usize,
	) -> Self {
		Self {
			dispatch: AuthorizedDispatch::new(credential),
			base_url,
			batch_size,
		}
	}

	/// Fetches up to `batch_size` entries with a sequence greater than
	/// `offset`, oldest first.
	pub async fn fetch(
		&self,
		offset: u64,
		cancel: &CancellationToken,
	) -> Result<Vec<ChangeFeedEntry>, CastError> {
		let mut url = self.base_url.clone();
		url.path_segments_mut()
			.map_err(|()| CastError::InvalidArgument("dicom.service_url cannot be a base"))?
			.pop_if_empty()
			.push("changefeed");
		url.query_pairs_mut()
			.append_pair("offset", &offset.to_string())
			.append_pair("limit", &self.batch_size.to_string())
			.append_pair("includeMetadata", "true");

		let request = self.dispatch.get(url);
		let response = self.dispatch.send(request, cancel).await?;
		let response = response.error_for_status()?;
		let entries: Vec<ChangeFeedEntry> = response.json().await?;
		Ok(entries)
	}
}

/// Collapses repeated events for the same instance within one batch; the
/// latest entry wins. Entries with malformed identifiers are kept so the
/// pipeline can report them.
pub fn dedup_batch(entries: Vec<ChangeFeedEntry>) -> Vec<ChangeFeedEntry> {
	let mut result: Vec<ChangeFeedEntry> = Vec::with_capacity(entries.len());
	let mut seen: HashMap<InstanceIdentifiers, usize> = HashMap::new();

	for entry in entries {
		match entry.identifiers() {
			Ok(key) => {
				if let Some(&index) = seen.get(&key) {
					result[index] = entry;
				} else {
					seen.insert(key, result.len());
					result.push(entry);
				}
			}
			Err(_) => result.push(entry),
		}
	}
	result
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::auth::StaticTokenCredential;
	use serde_json::json;
	use wiremock::matchers::{header, method, path, query_param};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn entry_json(sequence: u64, sop: &str) -> Value {
		json!({
			"sequence": sequence,
			"action": "create",
			"studyInstanceUid": "1.2.3",
			"seriesInstanceUid": "1.2.3.4",
			"sopInstanceUid": sop,
			"metadata": {
				"0020000D": { "vr": "UI", "Value": ["1.2.3"] },
				"0020000E": { "vr": "UI", "Value": ["1.2.3.4"] },
				"00080018": { "vr": "UI", "Value": [sop] },
				"00100020": { "vr": "LO", "Value": ["PAT-42"] },
				"00080060": { "vr": "CS", "Value": ["CT"] },
			},
		})
	}

	#[test]
	fn entry_decodes_dicom_json_metadata_into_facts() {
		let entry: ChangeFeedEntry =
			serde_json::from_value(entry_json(7, "1.2.3.4.5")).unwrap();
		assert_eq!(entry.action, ChangeFeedAction::Create);

		let facts = entry.facts().unwrap().unwrap();
		assert_eq!(facts.patient_id, "PAT-42");
		assert_eq!(facts.modality.as_deref(), Some("CT"));
		assert_eq!(facts.identifiers, entry.identifiers().unwrap());
	}

	#[test]
	fn delete_entries_without_metadata_yield_no_facts() {
		let entry: ChangeFeedEntry = serde_json::from_value(json!({
			"sequence": 8,
			"action": "delete",
			"studyInstanceUid": "1.2.3",
			"seriesInstanceUid": "1.2.3.4",
			"sopInstanceUid": "1.2.3.4.5",
		}))
		.unwrap();

		assert_eq!(entry.action, ChangeFeedAction::Delete);
		assert!(entry.facts().unwrap().is_none());
	}

	#[test]
	fn mismatched_metadata_identifiers_are_rejected() {
		let mut value = entry_json(9, "1.2.3.4.5");
		value["sopInstanceUid"] = json!("9.9.9");
		let entry: ChangeFeedEntry = serde_json::from_value(value).unwrap();

		assert!(matches!(
			entry.facts(),
			Err(CastError::InvalidArgument(_))
		));
	}

	#[test]
	fn dedup_keeps_the_latest_entry_per_instance() {
		let first: ChangeFeedEntry =
			serde_json::from_value(entry_json(1, "1.2.3.4.5")).unwrap();
		let mut second: ChangeFeedEntry =
			serde_json::from_value(entry_json(2, "1.2.3.4.5")).unwrap();
		second.action = ChangeFeedAction::Delete;
		let other: ChangeFeedEntry =
			serde_json::from_value(entry_json(3, "1.2.3.4.6")).unwrap();

		let deduped = dedup_batch(vec![first, second, other]);
		assert_eq!(deduped.len(), 2);
		assert_eq!(deduped[0].sequence, 2);
		assert_eq!(deduped[0].action, ChangeFeedAction::Delete);
		assert_eq!(deduped[1].sequence, 3);
	}

	#[tokio::test]
	async fn fetch_polls_the_changefeed_with_offset_and_limit() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/v2/changefeed"))
			.and(header("authorization", "Bearer secret"))
			.and(query_param("offset", "41"))
			.and(query_param("limit", "10"))
			.and(query_param("includeMetadata", "true"))
			.respond_with(
				ResponseTemplate::new(200)
					.set_body_json(json!([entry_json(42, "1.2.3.4.5")])),
			)
			.expect(1)
			.mount(&server)
			.await;

		let client = ChangeFeedClient::new(
			Url::parse(&format!("{}/v2", server.uri())).unwrap(),
			Arc::new(StaticTokenCredential::new("secret")),
			10,
		);

		let entries = client.fetch(41, &CancellationToken::new()).await.unwrap();
		assert_eq!(entries.len(), 1);
		assert_eq!(entries[0].sequence, 42);
	}
}
