use crate::auth::TokenCredential;
use crate::error::CastError;
use crate::fhir::model::Resource;
use crate::fhir::transaction::TransactionResult;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

pub const FHIR_JSON: &str = "application/fhir+json";

/// Ordered search parameters rendered as query-string pairs.
///
/// Parameters are always derived from configuration or DICOM facts, never
/// from free text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchParams(Vec<(String, String)>);

impl SearchParams {
	pub fn new() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn add(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.0.push((name.into(), value.into()));
		self
	}

	pub fn pairs(&self) -> &[(String, String)] {
		&self.0
	}

	/// Renders the parameters as an url-encoded query string, the form used
	/// for `If-None-Exist` preconditions.
	pub fn to_query(&self) -> String {
		let mut serializer = url::form_urlencoded::Serializer::new(String::new());
		for (name, value) in &self.0 {
			serializer.append_pair(name, value);
		}
		serializer.finish()
	}
}

/// Remote FHIR store operations the pipeline depends on.
#[async_trait]
pub trait FhirStore: Send + Sync {
	/// Searches `resource_type` by the given match parameters, returning at
	/// most `limit` resources.
	async fn search(
		&self,
		resource_type: &str,
		params: &SearchParams,
		limit: usize,
		cancel: &CancellationToken,
	) -> Result<Vec<Resource>, CastError>;

	/// Applies a transaction bundle atomically. A rejection means nothing
	/// was applied.
	async fn transaction(
		&self,
		bundle: Value,
		cancel: &CancellationToken,
	) -> Result<TransactionResult, CastError>;
}

/// Attaches a bearer credential to every outbound request, then forwards the
/// request unchanged.
///
/// No retry or backoff logic lives here; credential acquisition failures
/// abort the call with [`CastError::AuthenticationFailed`].
pub struct AuthorizedDispatch {
	http: reqwest::Client,
	credential: Arc<dyn TokenCredential>,
}

impl AuthorizedDispatch {
	pub fn new(credential: Arc<dyn TokenCredential>) -> Self {
		Self {
			http: reqwest::Client::new(),
			credential,
		}
	}

	pub fn get(&self, url: Url) -> reqwest::RequestBuilder {
		self.http.get(url)
	}

	pub fn post(&self, url: Url) -> reqwest::RequestBuilder {
		self.http.post(url)
	}

	/// # Errors
	/// Returns [`CastError::AuthenticationFailed`] if no token could be
	/// acquired, [`CastError::Cancelled`] if cancellation was observed
	/// before the response arrived.
	pub async fn send(
		&self,
		request: reqwest::RequestBuilder,
		cancel: &CancellationToken,
	) -> Result<reqwest::Response, CastError> {
		let token = self.credential.token(cancel).await?;
		let request = if token.token.is_empty() {
			request
		} else {
			request.header(AUTHORIZATION, format!("Bearer {}", token.token))
		};

		tokio::select! {
			() = cancel.cancelled() => Err(CastError::Cancelled),
			result = request.send() => Ok(result?),
		}
	}
}

/// [`FhirStore`] implementation against a FHIR R4 REST endpoint.
pub struct RestFhirClient {
	dispatch: AuthorizedDispatch,
	base_url: Url,
}

impl RestFhirClient {
	pub fn new(base_url: Url, credential: Arc<dyn TokenCredential>) -> Self {
		Self {
			dispatch: AuthorizedDispatch::new(credential),
			base_url,
		}
	}

	fn resource_url(&self, resource_type: &str) -> Result<Url, CastError> {
		let mut url = self.base_url.clone();
		url.path_segments_mut()
			.map_err(|()| CastError::InvalidArgument("fhir.service_url cannot be a base"))?
			.pop_if_empty()
			.push(resource_type);
		Ok(url)
	}
}

#[async_trait]
impl FhirStore for RestFhirClient {
	async fn search(
		&self,
		resource_type: &str,
		params: &SearchParams,
		limit: usize,
		cancel: &CancellationToken,
	) -> Result<Vec<Resource>, CastError> {
		let mut url = self.resource_url(resource_type)?;
		{
			let mut query = url.query_pairs_mut();
			for (name, value) in params.pairs() {
				query.append_pair(name, value);
			}
			query.append_pair("_count", &limit.to_string());
		}

		let request = self.dispatch.get(url).header(ACCEPT, FHIR_JSON);
		let response = self.dispatch.send(request, cancel).await?;
		let response = response.error_for_status()?;
		let bundle: Value = response.json().await?;

		let mut matches = Vec::new();
		if let Some(entries) = bundle.get("entry").and_then(Value::as_array) {
			for entry in entries {
				let Some(resource) = entry.get("resource") else {
					continue;
				};
				// Searchset bundles may carry OperationOutcome or included
				// resources of other types
				if resource.get("resourceType").and_then(Value::as_str) != Some(resource_type) {
					continue;
				}
				match serde_json::from_value::<Resource>(resource.clone()) {
					Ok(resource) => matches.push(resource),
					Err(err) => warn!("Skipped malformed {resource_type} search match: {err}"),
				}
			}
		}
		matches.truncate(limit);
		Ok(matches)
	}

	async fn transaction(
		&self,
		bundle: Value,
		cancel: &CancellationToken,
	) -> Result<TransactionResult, CastError> {
		let request = self
			.dispatch
			.post(self.base_url.clone())
			.header(CONTENT_TYPE, FHIR_JSON)
			.header(ACCEPT, FHIR_JSON)
			.json(&bundle);
		let response = self.dispatch.send(request, cancel).await?;

		let status = response.status();
		if !status.is_success() {
			let diagnostics = response.text().await.unwrap_or_default();
			return Err(CastError::RemoteRejected {
				status: status.as_u16(),
				diagnostics,
			});
		}

		let body: Value = response.json().await?;
		let entry_status = body
			.get("entry")
			.and_then(Value::as_array)
			.map(|entries| {
				entries
					.iter()
					.filter_map(|entry| {
						entry
							.pointer("/response/status")
							.and_then(Value::as_str)
							.map(ToOwned::to_owned)
					})
					.collect()
			})
			.unwrap_or_default();

		Ok(TransactionResult { entry_status })
	}
}
