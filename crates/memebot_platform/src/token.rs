#![forbid(unsafe_code)]

//! Bearer credentials per identity, refreshed on expiry.
//!
//! A token is served from cache until it is within [`TokenProvider::skew`] of its expiry;
//! after that the platform's refresh-token exchange runs once per identity (concurrent
//! callers wait on the same refresh) and the result is persisted through a [`CredentialStore`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use memebot_domain::{Platform, UserId};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::SecretString;
use crate::http::{DEFAULT_REQUEST_TIMEOUT, build_http_client};

pub const DEFAULT_EXPIRY_SKEW: Duration = Duration::from_secs(60);

/// Who a token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TokenIdentity {
	/// The platform account a local user linked.
	User { user_id: UserId, platform: Platform },
	/// A specific external account (bot override or global bot).
	ExternalAccount(String),
}

impl fmt::Display for TokenIdentity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::User { user_id, platform } => write!(f, "user:{platform}:{user_id}"),
			Self::ExternalAccount(id) => write!(f, "account:{id}"),
		}
	}
}

/// Stored credential row for an external account.
#[derive(Debug, Clone)]
pub struct StoredCredential {
	pub external_account_id: String,
	pub platform: Platform,
	pub platform_user_id: Option<String>,
	pub access_token: Option<SecretString>,
	pub refresh_token: Option<SecretString>,
	pub expires_at_ms: Option<i64>,
	pub scopes: Vec<String>,
}

/// Result of a successful refresh exchange.
#[derive(Debug, Clone)]
pub struct RefreshedToken {
	pub access_token: SecretString,
	/// Present when the platform rotated the refresh token.
	pub refresh_token: Option<SecretString>,
	pub expires_in: Duration,
	/// `None` when the platform did not echo scopes.
	pub scopes: Option<Vec<String>>,
}

/// Persistence seam for credentials.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
	async fn load(&self, identity: &TokenIdentity) -> anyhow::Result<Option<StoredCredential>>;

	async fn save_refreshed(
		&self,
		external_account_id: &str,
		refreshed: &RefreshedToken,
		expires_at_ms: i64,
	) -> anyhow::Result<()>;
}

/// OAuth client registration for one platform.
#[derive(Debug, Clone)]
pub struct OAuthClient {
	pub client_id: String,
	pub client_secret: SecretString,
	pub required_scopes: Vec<String>,
}

impl OAuthClient {
	fn is_configured(&self) -> bool {
		!self.client_id.trim().is_empty() && !self.client_secret.is_empty()
	}
}

/// A usable bearer token.
#[derive(Debug, Clone)]
pub struct AccessToken {
	pub token: SecretString,
	pub platform_user_id: Option<String>,
	pub expires_at_ms: Option<i64>,
}

/// Why no token could be produced.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenFailure {
	#[error("no linked account")]
	AccountNotFound,
	#[error("no refresh token stored")]
	MissingRefreshToken,
	#[error("refresh grant revoked: {0}")]
	RevokedGrant(String),
	#[error("missing scopes: {}", .0.join(","))]
	MissingScopes(Vec<String>),
	#[error("transient token failure: {0}")]
	Transient(String),
}

impl TokenFailure {
	/// The account must be linked again before it can be used.
	pub fn needs_relink(&self) -> bool {
		!matches!(self, Self::Transient(_))
	}

	pub fn reason(&self) -> &'static str {
		match self {
			Self::AccountNotFound => "account_not_found",
			Self::MissingRefreshToken => "missing_refresh_token",
			Self::RevokedGrant(_) => "revoked_grant",
			Self::MissingScopes(_) => "missing_scopes",
			Self::Transient(_) => "transient",
		}
	}
}

/// Only configuration problems are errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenConfigError {
	#[error("missing oauth client id/secret for {0}")]
	MissingClient(Platform),
}

#[derive(Debug, Clone)]
pub enum TokenLookup {
	Ready(AccessToken),
	Unavailable(TokenFailure),
}

impl TokenLookup {
	pub fn into_result(self) -> Result<AccessToken, TokenFailure> {
		match self {
			Self::Ready(t) => Ok(t),
			Self::Unavailable(f) => Err(f),
		}
	}
}

/// Refresh exchange failure, before classification.
#[derive(Debug)]
pub enum RefreshError {
	Rejected { status: StatusCode, body: String },
	Network(anyhow::Error),
}

/// Refresh-token exchange seam.
#[async_trait]
pub trait TokenRefresher: Send + Sync + 'static {
	async fn refresh(
		&self,
		platform: Platform,
		client: &OAuthClient,
		refresh_token: &str,
	) -> Result<RefreshedToken, RefreshError>;
}

pub const TWITCH_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
pub const YOUTUBE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const KICK_TOKEN_URL: &str = "https://id.kick.com/oauth/token";
pub const VKVIDEO_TOKEN_URL: &str = "https://api.live.vkvideo.ru/oauth/server/token";
pub const TROVO_TOKEN_URL: &str = "https://open-api.trovo.live/openplatform/refreshtoken";

#[derive(Debug, Deserialize)]
struct RefreshResponse {
	access_token: String,
	#[serde(default)]
	refresh_token: Option<String>,
	#[serde(default)]
	expires_in: Option<u64>,
	#[serde(default)]
	scope: Option<serde_json::Value>,
}

/// Scopes arrive either as a space separated string or as an array.
fn parse_scopes(value: Option<serde_json::Value>) -> Option<Vec<String>> {
	match value? {
		serde_json::Value::String(s) => Some(s.split([' ', ',']).filter(|s| !s.is_empty()).map(str::to_string).collect()),
		serde_json::Value::Array(items) => Some(
			items
				.into_iter()
				.filter_map(|v| v.as_str().map(str::to_string))
				.collect(),
		),
		_ => None,
	}
}

/// HTTP refresh exchange against each platform's OAuth endpoint.
pub struct HttpTokenRefresher {
	http: reqwest::Client,
}

impl HttpTokenRefresher {
	pub fn new(timeout: Duration) -> anyhow::Result<Self> {
		Ok(Self {
			http: build_http_client("memebot/0.x (oauth-refresh)", timeout)?,
		})
	}
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
	async fn refresh(
		&self,
		platform: Platform,
		client: &OAuthClient,
		refresh_token: &str,
	) -> Result<RefreshedToken, RefreshError> {
		let form = [
			("grant_type", "refresh_token"),
			("client_id", client.client_id.as_str()),
			("client_secret", client.client_secret.expose()),
			("refresh_token", refresh_token),
		];
		let req = match platform {
			Platform::Twitch => self.http.post(TWITCH_TOKEN_URL).form(&form),
			Platform::YouTube => self.http.post(YOUTUBE_TOKEN_URL).form(&form),
			Platform::Kick => self.http.post(KICK_TOKEN_URL).form(&form),
			Platform::VkVideo => {
				let basic = BASE64_STANDARD.encode(format!("{}:{}", client.client_id, client.client_secret.expose()));
				self.http
					.post(VKVIDEO_TOKEN_URL)
					.header("Authorization", format!("Basic {basic}"))
					.form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
			}
			Platform::Trovo => self.http.post(TROVO_TOKEN_URL).header("Client-ID", &client.client_id).json(
				&serde_json::json!({
					"client_secret": client.client_secret.expose(),
					"grant_type": "refresh_token",
					"refresh_token": refresh_token,
				}),
			),
		};

		let resp = req
			.send()
			.await
			.with_context(|| format!("{platform} refresh token request"))
			.map_err(RefreshError::Network)?;
		let status = resp.status();
		let body = resp
			.text()
			.await
			.with_context(|| format!("{platform} refresh token read body"))
			.map_err(RefreshError::Network)?;

		if !status.is_success() {
			return Err(RefreshError::Rejected { status, body });
		}

		let parsed: RefreshResponse = serde_json::from_str(&body)
			.with_context(|| format!("{platform} refresh token parse json"))
			.map_err(RefreshError::Network)?;

		Ok(RefreshedToken {
			access_token: SecretString::new(parsed.access_token),
			refresh_token: parsed.refresh_token.filter(|t| !t.trim().is_empty()).map(SecretString::new),
			expires_in: Duration::from_secs(parsed.expires_in.unwrap_or(3600)),
			scopes: parse_scopes(parsed.scope),
		})
	}
}

fn classify_refresh_error(err: RefreshError) -> TokenFailure {
	match err {
		RefreshError::Rejected { status, body } => {
			let lower = body.to_ascii_lowercase();
			if lower.contains("invalid_grant")
				|| matches!(
					status,
					StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
				) {
				TokenFailure::RevokedGrant(format!("status={status}"))
			} else {
				TokenFailure::Transient(format!("status={status}"))
			}
		}
		RefreshError::Network(e) => TokenFailure::Transient(e.to_string()),
	}
}

fn missing_scopes(required: &[String], granted: &[String]) -> Vec<String> {
	required
		.iter()
		.filter(|r| !granted.iter().any(|g| g.eq_ignore_ascii_case(r)))
		.cloned()
		.collect()
}

#[derive(Debug, Clone)]
struct CachedToken {
	token: AccessToken,
	expires_at_ms: i64,
}

/// Resolves valid bearer tokens, refreshing on expiry.
pub struct TokenProvider {
	store: Arc<dyn CredentialStore>,
	refresher: Arc<dyn TokenRefresher>,
	clients: HashMap<Platform, OAuthClient>,
	cache: Mutex<HashMap<TokenIdentity, CachedToken>>,
	refresh_locks: Mutex<HashMap<TokenIdentity, Arc<tokio::sync::Mutex<()>>>>,
	skew: Duration,
}

impl TokenProvider {
	pub fn new(
		store: Arc<dyn CredentialStore>,
		refresher: Arc<dyn TokenRefresher>,
		clients: HashMap<Platform, OAuthClient>,
	) -> Self {
		Self {
			store,
			refresher,
			clients,
			cache: Mutex::new(HashMap::new()),
			refresh_locks: Mutex::new(HashMap::new()),
			skew: DEFAULT_EXPIRY_SKEW,
		}
	}

	/// Provider using the HTTP refresh exchange.
	pub fn with_http(store: Arc<dyn CredentialStore>, clients: HashMap<Platform, OAuthClient>) -> anyhow::Result<Self> {
		let refresher = Arc::new(HttpTokenRefresher::new(DEFAULT_REQUEST_TIMEOUT)?);
		Ok(Self::new(store, refresher, clients))
	}

	/// Fails when `platform` has no usable OAuth client registration.
	pub fn ensure_client(&self, platform: Platform) -> Result<&OAuthClient, TokenConfigError> {
		self.clients
			.get(&platform)
			.filter(|c| c.is_configured())
			.ok_or(TokenConfigError::MissingClient(platform))
	}

	pub fn client_id(&self, platform: Platform) -> Option<&str> {
		self.clients.get(&platform).map(|c| c.client_id.as_str())
	}

	/// Drop a cached token, e.g. after the platform rejected it.
	pub fn invalidate(&self, identity: &TokenIdentity) {
		self.cache.lock().remove(identity);
	}

	fn cached(&self, identity: &TokenIdentity, now_ms: i64) -> Option<AccessToken> {
		let skew_ms = self.skew.as_millis() as i64;
		let guard = self.cache.lock();
		let entry = guard.get(identity)?;
		(entry.expires_at_ms - skew_ms > now_ms).then(|| entry.token.clone())
	}

	fn refresh_lock(&self, identity: &TokenIdentity) -> Arc<tokio::sync::Mutex<()>> {
		self.refresh_locks
			.lock()
			.entry(identity.clone())
			.or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
			.clone()
	}

	pub async fn get_valid_token(&self, identity: &TokenIdentity) -> Result<TokenLookup, TokenConfigError> {
		let now_ms = unix_ms_now();
		if let Some(token) = self.cached(identity, now_ms) {
			return Ok(TokenLookup::Ready(token));
		}

		let lock = self.refresh_lock(identity);
		let _guard = lock.lock().await;

		// Another caller may have refreshed while we waited.
		let now_ms = unix_ms_now();
		if let Some(token) = self.cached(identity, now_ms) {
			return Ok(TokenLookup::Ready(token));
		}

		let stored = match self.store.load(identity).await {
			Ok(Some(stored)) => stored,
			Ok(None) => return Ok(TokenLookup::Unavailable(TokenFailure::AccountNotFound)),
			Err(e) => {
				warn!(identity = %identity, error = %e, "credential load failed");
				return Ok(TokenLookup::Unavailable(TokenFailure::Transient(e.to_string())));
			}
		};

		let skew_ms = self.skew.as_millis() as i64;
		if let Some(access) = stored.access_token.as_ref()
			&& !access.is_empty()
			&& let Some(expires_at_ms) = stored.expires_at_ms
			&& expires_at_ms - skew_ms > now_ms
		{
			let token = AccessToken {
				token: access.clone(),
				platform_user_id: stored.platform_user_id.clone(),
				expires_at_ms: Some(expires_at_ms),
			};
			self.cache.lock().insert(
				identity.clone(),
				CachedToken {
					token: token.clone(),
					expires_at_ms,
				},
			);
			return Ok(TokenLookup::Ready(token));
		}

		let client = self.ensure_client(stored.platform)?.clone();

		let Some(refresh_token) = stored.refresh_token.as_ref().filter(|t| !t.is_empty()) else {
			info!(identity = %identity, platform = %stored.platform, "token expired and no refresh token stored");
			metrics::counter!("memebot_token_refresh_total", "result" => "missing_refresh_token").increment(1);
			return Ok(TokenLookup::Unavailable(TokenFailure::MissingRefreshToken));
		};

		debug!(identity = %identity, platform = %stored.platform, "refreshing access token");
		let refreshed = match self
			.refresher
			.refresh(stored.platform, &client, refresh_token.expose())
			.await
		{
			Ok(r) => r,
			Err(e) => {
				let failure = classify_refresh_error(e);
				warn!(identity = %identity, platform = %stored.platform, reason = failure.reason(), error = %failure, "token refresh failed");
				metrics::counter!("memebot_token_refresh_total", "result" => failure.reason()).increment(1);
				return Ok(TokenLookup::Unavailable(failure));
			}
		};

		let granted = refreshed.scopes.clone().unwrap_or_else(|| stored.scopes.clone());
		let missing = missing_scopes(&client.required_scopes, &granted);
		if !missing.is_empty() {
			warn!(identity = %identity, platform = %stored.platform, missing = ?missing, "refreshed token lacks required scopes");
			metrics::counter!("memebot_token_refresh_total", "result" => "missing_scopes").increment(1);
			return Ok(TokenLookup::Unavailable(TokenFailure::MissingScopes(missing)));
		}

		let expires_at_ms = now_ms + refreshed.expires_in.as_millis() as i64;
		if let Err(e) = self
			.store
			.save_refreshed(&stored.external_account_id, &refreshed, expires_at_ms)
			.await
		{
			// The token is still valid for this process.
			warn!(identity = %identity, error = %e, "persisting refreshed token failed");
		}

		let token = AccessToken {
			token: refreshed.access_token.clone(),
			platform_user_id: stored.platform_user_id.clone(),
			expires_at_ms: Some(expires_at_ms),
		};
		self.cache.lock().insert(
			identity.clone(),
			CachedToken {
				token: token.clone(),
				expires_at_ms,
			},
		);
		metrics::counter!("memebot_token_refresh_total", "result" => "ok").increment(1);
		info!(identity = %identity, platform = %stored.platform, "access token refreshed");
		Ok(TokenLookup::Ready(token))
	}

	/// Token for adapter use: configuration errors and failures both become [`crate::PlatformError`].
	pub async fn bearer(&self, identity: &TokenIdentity) -> Result<AccessToken, crate::PlatformError> {
		match self.get_valid_token(identity).await {
			Ok(TokenLookup::Ready(t)) => Ok(t),
			Ok(TokenLookup::Unavailable(f)) => Err(f.into()),
			Err(e) => Err(crate::PlatformError::Other(e.into())),
		}
	}
}

pub(crate) fn unix_ms_now() -> i64 {
	chrono::Utc::now().timestamp_millis()
}
