#![forbid(unsafe_code)]

use anyhow::Context;
use async_trait::async_trait;
use memebot_platform::SecretString;
use memebot_platform::token::{CredentialStore, RefreshedToken, StoredCredential, TokenIdentity};
use sqlx::Row;

use super::{Store, on_pool};

struct RawCredential {
	id: String,
	provider: String,
	provider_account_id: String,
	access_token: Option<String>,
	refresh_token: Option<String>,
	token_expires_at: Option<i64>,
	scopes: String,
}

impl RawCredential {
	fn into_credential(self) -> anyhow::Result<StoredCredential> {
		Ok(StoredCredential {
			external_account_id: self.id,
			platform: self.provider.parse().context("external account provider")?,
			platform_user_id: Some(self.provider_account_id).filter(|s| !s.trim().is_empty()),
			access_token: self.access_token.filter(|s| !s.is_empty()).map(SecretString::new),
			refresh_token: self.refresh_token.filter(|s| !s.is_empty()).map(SecretString::new),
			expires_at_ms: self.token_expires_at,
			scopes: split_scopes(&self.scopes),
		})
	}
}

fn split_scopes(raw: &str) -> Vec<String> {
	raw.split(|c: char| c == ' ' || c == ',')
		.filter(|s| !s.is_empty())
		.map(str::to_string)
		.collect()
}

const CREDENTIAL_COLUMNS: &str =
	"id, provider, provider_account_id, access_token, refresh_token, token_expires_at, scopes";

#[async_trait]
impl CredentialStore for Store {
	async fn load(&self, identity: &TokenIdentity) -> anyhow::Result<Option<StoredCredential>> {
		let (query, key, provider) = match identity {
			TokenIdentity::ExternalAccount(id) => (
				format!("SELECT {CREDENTIAL_COLUMNS} FROM external_accounts WHERE id = ?"),
				id.clone(),
				None,
			),
			TokenIdentity::User { user_id, platform } => (
				format!(
					"SELECT {CREDENTIAL_COLUMNS} FROM external_accounts WHERE user_id = ? AND provider = ? ORDER BY id LIMIT 1"
				),
				user_id.as_str().to_string(),
				Some(platform.as_str()),
			),
		};
		let sql = self.sql(&query);
		let raw: Option<RawCredential> = on_pool!(self, |pool| {
			let mut q = sqlx::query(&sql).bind(key);
			if let Some(provider) = provider {
				q = q.bind(provider);
			}
			let row = q.fetch_optional(pool).await.context("load credentials")?;
			row.map(|row| -> Result<RawCredential, sqlx::Error> {
				Ok(RawCredential {
					id: row.try_get("id")?,
					provider: row.try_get("provider")?,
					provider_account_id: row.try_get("provider_account_id")?,
					access_token: row.try_get("access_token")?,
					refresh_token: row.try_get("refresh_token")?,
					token_expires_at: row.try_get("token_expires_at")?,
					scopes: row.try_get("scopes")?,
				})
			})
			.transpose()
			.context("decode credentials")?
		});
		raw.map(RawCredential::into_credential).transpose()
	}

	async fn save_refreshed(
		&self,
		external_account_id: &str,
		refreshed: &RefreshedToken,
		expires_at_ms: i64,
	) -> anyhow::Result<()> {
		// Rotation is optional; scopes are only replaced when the platform echoed them.
		let sql = self.sql(
			"UPDATE external_accounts SET access_token = ?, refresh_token = COALESCE(?, refresh_token), \
			token_expires_at = ?, scopes = COALESCE(?, scopes) WHERE id = ?",
		);
		let refresh = refreshed.refresh_token.as_ref().map(|t| t.expose().to_string());
		let scopes = refreshed.scopes.as_ref().map(|s| s.join(" "));
		on_pool!(self, |pool| {
			sqlx::query(&sql)
				.bind(refreshed.access_token.expose())
				.bind(refresh)
				.bind(expires_at_ms)
				.bind(scopes)
				.bind(external_account_id)
				.execute(pool)
				.await
				.context("save refreshed token")?;
		});
		Ok(())
	}
}
