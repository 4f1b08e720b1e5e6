#![forbid(unsafe_code)]

use anyhow::Context;
use memebot_domain::{ChannelId, Platform, PlatformChannelId};
use sqlx::Row;
use tracing::warn;

use super::{Store, on_pool};

/// Enabled subscription joined with its channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRow {
	pub channel_id: ChannelId,
	pub platform_channel_id: PlatformChannelId,
	pub slug: String,
	/// Per-channel bot account; only honored for entitled channels.
	pub bot_override: Option<String>,
	pub custom_bot_entitled: bool,
	pub owner_user_id: Option<String>,
}

/// An external account usable as a bot identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotAccountRow {
	pub external_account_id: String,
	pub provider_account_id: String,
	pub login: Option<String>,
}

struct RawSubscription {
	channel_id: String,
	platform_channel_id: String,
	slug: String,
	bot_override: Option<String>,
	custom_bot_entitled: Option<bool>,
	owner_user_id: Option<String>,
}

impl RawSubscription {
	fn into_row(self) -> Option<SubscriptionRow> {
		let channel_id = ChannelId::new(self.channel_id).ok()?;
		let Ok(platform_channel_id) = PlatformChannelId::new(self.platform_channel_id) else {
			warn!(channel_id = %channel_id, "subscription without platform channel id skipped");
			return None;
		};
		Some(SubscriptionRow {
			channel_id,
			platform_channel_id,
			slug: self.slug,
			bot_override: self.bot_override.filter(|s| !s.trim().is_empty()),
			custom_bot_entitled: self.custom_bot_entitled.unwrap_or(false),
			owner_user_id: self.owner_user_id.filter(|s| !s.trim().is_empty()),
		})
	}
}

impl Store {
	pub async fn enabled_subscriptions(&self, platform: Platform) -> anyhow::Result<Vec<SubscriptionRow>> {
		let sql = self.sql(
			"SELECT s.channel_id, s.platform_channel_id, s.slug, s.bot_external_account_id, \
			c.custom_bot_entitled, c.owner_user_id \
			FROM bot_subscriptions s LEFT JOIN channels c ON c.id = s.channel_id \
			WHERE s.platform = ? AND s.enabled = TRUE ORDER BY s.channel_id",
		);
		let raw: Vec<RawSubscription> = on_pool!(self, |pool| {
			let rows = sqlx::query(&sql)
				.bind(platform.as_str())
				.fetch_all(pool)
				.await
				.context("load bot subscriptions")?;
			rows.iter()
				.map(|row| -> Result<RawSubscription, sqlx::Error> {
					Ok(RawSubscription {
						channel_id: row.try_get("channel_id")?,
						platform_channel_id: row.try_get("platform_channel_id")?,
						slug: row.try_get("slug")?,
						bot_override: row.try_get("bot_external_account_id")?,
						custom_bot_entitled: row.try_get("custom_bot_entitled")?,
						owner_user_id: row.try_get("owner_user_id")?,
					})
				})
				.collect::<Result<Vec<_>, sqlx::Error>>()
				.context("decode bot subscriptions")?
		});
		Ok(raw.into_iter().filter_map(RawSubscription::into_row).collect())
	}

	/// Default bot for the platform.
	pub async fn global_bot_account(&self, platform: Platform) -> anyhow::Result<Option<BotAccountRow>> {
		let sql = self.sql(
			"SELECT a.id, a.provider_account_id, a.login FROM global_bot_accounts g \
			JOIN external_accounts a ON a.id = g.external_account_id WHERE g.platform = ?",
		);
		on_pool!(self, |pool| {
			let row = sqlx::query(&sql)
				.bind(platform.as_str())
				.fetch_optional(pool)
				.await
				.context("load global bot account")?;
			row.map(|row| -> anyhow::Result<BotAccountRow> {
				Ok(BotAccountRow {
					external_account_id: row.try_get("id")?,
					provider_account_id: row.try_get("provider_account_id")?,
					login: row.try_get("login")?,
				})
			})
			.transpose()
		})
	}

	pub async fn bot_account(&self, external_account_id: &str) -> anyhow::Result<Option<BotAccountRow>> {
		let sql = self.sql("SELECT id, provider_account_id, login FROM external_accounts WHERE id = ?");
		on_pool!(self, |pool| {
			let row = sqlx::query(&sql)
				.bind(external_account_id)
				.fetch_optional(pool)
				.await
				.context("load bot account")?;
			row.map(|row| -> anyhow::Result<BotAccountRow> {
				Ok(BotAccountRow {
					external_account_id: row.try_get("id")?,
					provider_account_id: row.try_get("provider_account_id")?,
					login: row.try_get("login")?,
				})
			})
			.transpose()
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::fixtures;

	#[tokio::test]
	async fn only_enabled_rows_for_the_platform_are_loaded() {
		let store = Store::connect_in_memory().await.expect("store");
		fixtures::channel(&store, "c1", "alpha", true).await;
		fixtures::channel(&store, "c2", "beta", false).await;
		fixtures::subscription(&store, "c1", "twitch", "111", Some("bot-override")).await;
		fixtures::subscription(&store, "c2", "twitch", "222", None).await;
		fixtures::subscription(&store, "c2", "kick", "k222", None).await;
		fixtures::disable_subscription(&store, "c2", "twitch").await;

		let rows = store.enabled_subscriptions(Platform::Twitch).await.expect("load");
		assert_eq!(rows.len(), 1);
		assert_eq!(rows[0].channel_id.as_str(), "c1");
		assert_eq!(rows[0].bot_override.as_deref(), Some("bot-override"));
		assert!(rows[0].custom_bot_entitled);
	}

	#[tokio::test]
	async fn global_bot_is_resolved_through_external_accounts() {
		let store = Store::connect_in_memory().await.expect("store");
		fixtures::account(&store, "acct-bot", None, "twitch", "9000", "memebot").await;
		fixtures::global_bot(&store, "twitch", "acct-bot").await;

		let bot = store
			.global_bot_account(Platform::Twitch)
			.await
			.expect("load")
			.expect("bot");
		assert_eq!(bot.provider_account_id, "9000");
		assert_eq!(bot.login.as_deref(), Some("memebot"));
		assert!(store.global_bot_account(Platform::Kick).await.expect("load").is_none());
	}
}
