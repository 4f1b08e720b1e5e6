#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use memebot_domain::Platform;
use parking_lot::Mutex;
use reqwest::StatusCode;

use crate::SecretString;
use crate::token::{
	CredentialStore, OAuthClient, RefreshError, RefreshedToken, StoredCredential, TokenConfigError, TokenFailure,
	TokenIdentity, TokenLookup, TokenProvider, TokenRefresher, unix_ms_now,
};

#[derive(Default)]
struct MemStore {
	rows: Mutex<HashMap<String, StoredCredential>>,
	saves: AtomicUsize,
}

impl MemStore {
	fn with(row: StoredCredential) -> Arc<Self> {
		let store = Self::default();
		store.rows.lock().insert(row.external_account_id.clone(), row);
		Arc::new(store)
	}
}

#[async_trait]
impl CredentialStore for MemStore {
	async fn load(&self, identity: &TokenIdentity) -> anyhow::Result<Option<StoredCredential>> {
		let TokenIdentity::ExternalAccount(id) = identity else {
			return Ok(None);
		};
		Ok(self.rows.lock().get(id).cloned())
	}

	async fn save_refreshed(
		&self,
		external_account_id: &str,
		refreshed: &RefreshedToken,
		expires_at_ms: i64,
	) -> anyhow::Result<()> {
		self.saves.fetch_add(1, Ordering::SeqCst);
		let mut rows = self.rows.lock();
		if let Some(row) = rows.get_mut(external_account_id) {
			row.access_token = Some(refreshed.access_token.clone());
			if let Some(rt) = refreshed.refresh_token.clone() {
				row.refresh_token = Some(rt);
			}
			row.expires_at_ms = Some(expires_at_ms);
		}
		Ok(())
	}
}

enum Script {
	Ok(Option<Vec<String>>),
	Rejected(StatusCode, &'static str),
	Network,
}

struct ScriptedRefresher {
	script: Script,
	calls: AtomicUsize,
}

impl ScriptedRefresher {
	fn new(script: Script) -> Arc<Self> {
		Arc::new(Self {
			script,
			calls: AtomicUsize::new(0),
		})
	}
}

#[async_trait]
impl TokenRefresher for ScriptedRefresher {
	async fn refresh(
		&self,
		_platform: Platform,
		_client: &OAuthClient,
		_refresh_token: &str,
	) -> Result<RefreshedToken, RefreshError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		tokio::time::sleep(Duration::from_millis(5)).await;
		match &self.script {
			Script::Ok(scopes) => Ok(RefreshedToken {
				access_token: SecretString::new("fresh"),
				refresh_token: Some(SecretString::new("rotated")),
				expires_in: Duration::from_secs(3600),
				scopes: scopes.clone(),
			}),
			Script::Rejected(status, body) => Err(RefreshError::Rejected {
				status: *status,
				body: body.to_string(),
			}),
			Script::Network => Err(RefreshError::Network(anyhow::anyhow!("connection reset"))),
		}
	}
}

fn row(expires_in_ms: i64, refresh: Option<&str>) -> StoredCredential {
	StoredCredential {
		external_account_id: "acct-1".to_string(),
		platform: Platform::Twitch,
		platform_user_id: Some("42".to_string()),
		access_token: Some(SecretString::new("stale")),
		refresh_token: refresh.map(SecretString::new),
		expires_at_ms: Some(unix_ms_now() + expires_in_ms),
		scopes: vec!["user:write:chat".to_string()],
	}
}

fn clients(required: &[&str]) -> HashMap<Platform, OAuthClient> {
	let mut map = HashMap::new();
	map.insert(
		Platform::Twitch,
		OAuthClient {
			client_id: "cid".to_string(),
			client_secret: SecretString::new("secret"),
			required_scopes: required.iter().map(|s| s.to_string()).collect(),
		},
	);
	map
}

fn identity() -> TokenIdentity {
	TokenIdentity::ExternalAccount("acct-1".to_string())
}

#[tokio::test]
async fn valid_stored_token_is_returned_without_refresh() {
	let store = MemStore::with(row(10 * 60_000, Some("r")));
	let refresher = ScriptedRefresher::new(Script::Network);
	let provider = TokenProvider::new(store, refresher.clone(), clients(&[]));

	let lookup = provider.get_valid_token(&identity()).await.expect("no config error");
	let TokenLookup::Ready(token) = lookup else {
		panic!("expected token");
	};
	assert_eq!(token.token.expose(), "stale");
	assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn token_inside_skew_is_refreshed_and_persisted() {
	let store = MemStore::with(row(30_000, Some("r")));
	let refresher = ScriptedRefresher::new(Script::Ok(None));
	let provider = TokenProvider::new(store.clone(), refresher.clone(), clients(&["user:write:chat"]));

	let token = provider
		.get_valid_token(&identity())
		.await
		.expect("no config error")
		.into_result()
		.expect("token");
	assert_eq!(token.token.expose(), "fresh");
	assert_eq!(store.saves.load(Ordering::SeqCst), 1);
	let saved = store.rows.lock().get("acct-1").cloned().expect("row");
	assert_eq!(saved.refresh_token.expect("refresh").expose(), "rotated");

	// Second call is served from cache.
	let _ = provider.get_valid_token(&identity()).await.expect("no config error");
	assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh() {
	let store = MemStore::with(row(-1, Some("r")));
	let refresher = ScriptedRefresher::new(Script::Ok(None));
	let provider = Arc::new(TokenProvider::new(store, refresher.clone(), clients(&[])));

	let mut handles = Vec::new();
	for _ in 0..8 {
		let provider = Arc::clone(&provider);
		handles.push(tokio::spawn(async move { provider.get_valid_token(&identity()).await }));
	}
	for h in handles {
		let lookup = h.await.expect("join").expect("no config error");
		assert!(matches!(lookup, TokenLookup::Ready(_)));
	}
	assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_refresh_token_is_a_relink_failure() {
	let store = MemStore::with(row(-1, None));
	let provider = TokenProvider::new(store, ScriptedRefresher::new(Script::Network), clients(&[]));

	let failure = provider
		.get_valid_token(&identity())
		.await
		.expect("no config error")
		.into_result()
		.expect_err("no token");
	assert_eq!(failure, TokenFailure::MissingRefreshToken);
	assert!(failure.needs_relink());
}

#[tokio::test]
async fn invalid_grant_is_revoked_and_network_is_transient() {
	let provider = TokenProvider::new(
		MemStore::with(row(-1, Some("r"))),
		ScriptedRefresher::new(Script::Rejected(StatusCode::BAD_REQUEST, "{\"error\":\"invalid_grant\"}")),
		clients(&[]),
	);
	let failure = provider
		.get_valid_token(&identity())
		.await
		.expect("no config error")
		.into_result()
		.expect_err("no token");
	assert!(matches!(failure, TokenFailure::RevokedGrant(_)));

	let provider = TokenProvider::new(
		MemStore::with(row(-1, Some("r"))),
		ScriptedRefresher::new(Script::Network),
		clients(&[]),
	);
	let failure = provider
		.get_valid_token(&identity())
		.await
		.expect("no config error")
		.into_result()
		.expect_err("no token");
	assert!(matches!(failure, TokenFailure::Transient(_)));
	assert!(!failure.needs_relink());
}

#[tokio::test]
async fn missing_required_scope_is_reported() {
	let provider = TokenProvider::new(
		MemStore::with(row(-1, Some("r"))),
		ScriptedRefresher::new(Script::Ok(Some(vec!["chat:read".to_string()]))),
		clients(&["chat:read", "user:write:chat"]),
	);
	let failure = provider
		.get_valid_token(&identity())
		.await
		.expect("no config error")
		.into_result()
		.expect_err("no token");
	assert_eq!(failure, TokenFailure::MissingScopes(vec!["user:write:chat".to_string()]));
}

#[tokio::test]
async fn missing_client_registration_is_a_config_error() {
	let provider = TokenProvider::new(
		MemStore::with(row(-1, Some("r"))),
		ScriptedRefresher::new(Script::Ok(None)),
		HashMap::new(),
	);
	let err = provider.get_valid_token(&identity()).await.expect_err("config error");
	assert_eq!(err, TokenConfigError::MissingClient(Platform::Twitch));
}

#[tokio::test]
async fn unknown_account_is_not_found() {
	let provider = TokenProvider::new(
		Arc::new(MemStore::default()),
		ScriptedRefresher::new(Script::Ok(None)),
		clients(&[]),
	);
	let lookup = provider.get_valid_token(&identity()).await.expect("no config error");
	assert!(matches!(lookup, TokenLookup::Unavailable(TokenFailure::AccountNotFound)));
}
