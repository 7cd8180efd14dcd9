use crate::config::AuthConfig;
use crate::error::CastError;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Tokens are refreshed this long before their reported expiry so an
/// in-flight request never carries a token that expires mid-call.
const EXPIRY_LEEWAY: Duration = Duration::from_secs(30);

/// A bearer credential and the instant it stops being usable.
#[derive(Debug, Clone)]
pub struct AccessToken {
	pub token: String,
	pub expires_at: Instant,
}

impl AccessToken {
	fn is_stale(&self) -> bool {
		Instant::now() + EXPIRY_LEEWAY >= self.expires_at
	}
}

/// Supplies bearer credentials for outbound calls.
///
/// Implementations cache internally; callers request a token per call and
/// rely on the provider to avoid redundant round-trips. Acquisition failures
/// are terminal for the current call.
#[async_trait]
pub trait TokenCredential: Send + Sync {
	async fn token(&self, cancel: &CancellationToken) -> Result<AccessToken, CastError>;
}

/// A pre-issued, never-expiring token. An empty token disables the
/// `Authorization` header entirely.
pub struct StaticTokenCredential {
	token: String,
}

impl StaticTokenCredential {
	pub fn new(token: impl Into<String>) -> Self {
		Self {
			token: token.into(),
		}
	}
}

#[async_trait]
impl TokenCredential for StaticTokenCredential {
	async fn token(&self, _cancel: &CancellationToken) -> Result<AccessToken, CastError> {
		Ok(AccessToken {
			token: self.token.clone(),
			expires_at: Instant::now() + Duration::from_secs(u32::MAX.into()),
		})
	}
}

/// OAuth2 client-credentials provider.
///
/// The current token is cached behind an async `RwLock` and refreshed only
/// once it is about to expire, so concurrent pipeline runs share one token
/// and one refresh.
pub struct ClientCredentialProvider {
	http: reqwest::Client,
	token_url: Url,
	client_id: String,
	client_secret: String,
	scope: Option<String>,
	cached: RwLock<Option<AccessToken>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
	access_token: String,
	#[serde(default = "default_expires_in")]
	expires_in: u64,
}

const fn default_expires_in() -> u64 {
	3600
}

impl ClientCredentialProvider {
	pub fn new(
		token_url: Url,
		client_id: impl Into<String>,
		client_secret: impl Into<String>,
		scope: Option<String>,
	) -> Self {
		Self {
			http: reqwest::Client::new(),
			token_url,
			client_id: client_id.into(),
			client_secret: client_secret.into(),
			scope,
			cached: RwLock::new(None),
		}
	}

	async fn fetch(&self, cancel: &CancellationToken) -> Result<AccessToken, CastError> {
		let mut form: Vec<(&str, &str)> = vec![
			("grant_type", "client_credentials"),
			("client_id", &self.client_id),
			("client_secret", &self.client_secret),
		];
		if let Some(scope) = &self.scope {
			form.push(("scope", scope));
		}

		let request = self.http.post(self.token_url.clone()).form(&form);
		let response = tokio::select! {
			() = cancel.cancelled() => return Err(CastError::Cancelled),
			result = request.send() => {
				result.map_err(|err| CastError::AuthenticationFailed(err.to_string()))?
			}
		};

		if !response.status().is_success() {
			return Err(CastError::AuthenticationFailed(format!(
				"token endpoint returned {}",
				response.status()
			)));
		}

		let body: TokenResponse = response
			.json()
			.await
			.map_err(|err| CastError::AuthenticationFailed(err.to_string()))?;

		Ok(AccessToken {
			token: body.access_token,
			expires_at: Instant::now() + Duration::from_secs(body.expires_in),
		})
	}
}

#[async_trait]
impl TokenCredential for ClientCredentialProvider {
	async fn token(&self, cancel: &CancellationToken) -> Result<AccessToken, CastError> {
		{
			let cached = self.cached.read().await;
			if let Some(token) = cached.as_ref() {
				if !token.is_stale() {
					return Ok(token.clone());
				}
			}
		}

		let mut cached = self.cached.write().await;
		// Another task may have refreshed while we waited for the write lock
		if let Some(token) = cached.as_ref() {
			if !token.is_stale() {
				return Ok(token.clone());
			}
		}

		let token = self.fetch(cancel).await?;
		*cached = Some(token.clone());
		Ok(token)
	}
}

/// Builds the credential implied by the auth configuration.
///
/// # Errors
/// Returns [`CastError::InvalidArgument`] if a token endpoint is configured
/// without client credentials.
pub fn credential_from_config(config: &AuthConfig) -> Result<Arc<dyn TokenCredential>, CastError> {
	match &config.token_url {
		Some(token_url) => {
			let client_id = config
				.client_id
				.as_deref()
				.ok_or(CastError::InvalidArgument("auth.client_id"))?;
			let client_secret = config
				.client_secret
				.as_deref()
				.ok_or(CastError::InvalidArgument("auth.client_secret"))?;
			Ok(Arc::new(ClientCredentialProvider::new(
				token_url.clone(),
				client_id,
				client_secret,
				config.scope.clone(),
			)))
		}
		None => Ok(Arc::new(StaticTokenCredential::new(
			config.static_token.clone().unwrap_or_default(),
		))),
	}
}
