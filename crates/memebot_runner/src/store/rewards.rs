#![forbid(unsafe_code)]

use std::fmt;

use anyhow::Context;
use memebot_domain::{ChannelId, Platform, SessionId};
use sqlx::Row;

use super::{Store, on_pool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewardStatus {
	Eligible,
	Ignored,
}

impl RewardStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Eligible => "eligible",
			Self::Ignored => "ignored",
		}
	}
}

impl fmt::Display for RewardStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone)]
pub struct NewRewardEvent<'a> {
	pub id: uuid::Uuid,
	pub provider: Platform,
	pub provider_event_id: &'a str,
	pub channel_id: &'a ChannelId,
	pub provider_account_id: &'a str,
	pub event_type: &'a str,
	pub amount: i64,
	pub coins_to_grant: i64,
	pub status: RewardStatus,
	pub reason: Option<&'a str>,
	pub event_at_ms: i64,
	pub raw_payload: &'a str,
	pub session_id: Option<SessionId>,
	pub created_at_ms: i64,
}

/// A grant moved into a wallet by one claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedReward {
	pub reward_event_id: String,
	pub channel_id: String,
	pub event_type: String,
	pub coins: i64,
	/// Wallet balance right after this grant.
	pub balance: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardEventRow {
	pub id: String,
	pub event_type: String,
	pub coins_to_grant: i64,
	pub status: String,
	pub reason: Option<String>,
	pub claimed_by_user_id: Option<String>,
}

impl Store {
	/// Insert unless the `(provider, provider_event_id)` pair exists. Returns whether a row was written.
	pub async fn insert_reward_event(&self, ev: &NewRewardEvent<'_>) -> anyhow::Result<bool> {
		let sql = self.sql(
			"INSERT INTO reward_events (id, provider, provider_event_id, channel_id, provider_account_id, event_type, \
			amount, coins_to_grant, status, reason, event_at, raw_payload, session_id, created_at) \
			VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
			ON CONFLICT (provider, provider_event_id) DO NOTHING",
		);
		let affected = on_pool!(self, |pool| {
			let mut tx = pool.begin().await.context("begin reward insert")?;
			let affected = sqlx::query(&sql)
				.bind(ev.id.to_string())
				.bind(ev.provider.as_str())
				.bind(ev.provider_event_id)
				.bind(ev.channel_id.as_str())
				.bind(ev.provider_account_id)
				.bind(ev.event_type)
				.bind(ev.amount)
				.bind(ev.coins_to_grant)
				.bind(ev.status.as_str())
				.bind(ev.reason)
				.bind(ev.event_at_ms)
				.bind(ev.raw_payload)
				.bind(ev.session_id.map(|s| s.to_string()))
				.bind(ev.created_at_ms)
				.execute(&mut *tx)
				.await
				.context("insert reward_events")?
				.rows_affected();
			tx.commit().await.context("commit reward insert")?;
			affected
		});
		Ok(affected == 1)
	}

	/// Local user linked to the provider account, if any.
	pub async fn user_for_account(&self, provider: Platform, provider_account_id: &str) -> anyhow::Result<Option<String>> {
		let sql =
			self.sql("SELECT user_id FROM external_accounts WHERE provider = ? AND provider_account_id = ? AND user_id IS NOT NULL");
		on_pool!(self, |pool| {
			sqlx::query_scalar::<_, String>(&sql)
				.bind(provider.as_str())
				.bind(provider_account_id)
				.fetch_optional(pool)
				.await
				.context("resolve linked user")
		})
	}

	/// Claim every eligible unclaimed grant for the account and credit the user's wallets, in one transaction.
	pub async fn claim_pending_rewards(
		&self,
		provider: Platform,
		provider_account_id: &str,
		user_id: &str,
		now_ms: i64,
	) -> anyhow::Result<Vec<ClaimedReward>> {
		let select_sql = self.sql(
			"SELECT id, channel_id, event_type, coins_to_grant FROM reward_events \
			WHERE provider = ? AND provider_account_id = ? AND status = 'eligible' AND claimed_at IS NULL \
			ORDER BY event_at, id",
		);
		let claim_sql = self.sql(
			"UPDATE reward_events SET claimed_at = ?, claimed_by_user_id = ? WHERE id = ? AND claimed_at IS NULL",
		);
		let wallet_sql = self.sql(
			"INSERT INTO wallets (user_id, channel_id, balance, updated_at) VALUES (?, ?, ?, ?) \
			ON CONFLICT (user_id, channel_id) DO UPDATE SET balance = wallets.balance + excluded.balance, \
			updated_at = excluded.updated_at RETURNING balance",
		);

		on_pool!(self, |pool| {
			let mut tx = pool.begin().await.context("begin reward claim")?;
			let rows = sqlx::query(&select_sql)
				.bind(provider.as_str())
				.bind(provider_account_id)
				.fetch_all(&mut *tx)
				.await
				.context("load unclaimed rewards")?;
			let pending = rows
				.iter()
				.map(|row| -> Result<(String, String, String, i64), sqlx::Error> {
					Ok((
						row.try_get("id")?,
						row.try_get("channel_id")?,
						row.try_get("event_type")?,
						row.try_get("coins_to_grant")?,
					))
				})
				.collect::<Result<Vec<_>, sqlx::Error>>()
				.context("decode unclaimed rewards")?;

			let mut claimed = Vec::with_capacity(pending.len());
			for (id, channel_id, event_type, coins) in pending {
				let affected = sqlx::query(&claim_sql)
					.bind(now_ms)
					.bind(user_id)
					.bind(&id)
					.execute(&mut *tx)
					.await
					.context("claim reward event")?
					.rows_affected();
				if affected != 1 {
					continue;
				}
				let balance: i64 = sqlx::query_scalar(&wallet_sql)
					.bind(user_id)
					.bind(&channel_id)
					.bind(coins)
					.bind(now_ms)
					.fetch_one(&mut *tx)
					.await
					.context("credit wallet")?;
				claimed.push(ClaimedReward {
					reward_event_id: id,
					channel_id,
					event_type,
					coins,
					balance,
				});
			}
			tx.commit().await.context("commit reward claim")?;
			Ok(claimed)
		})
	}

	pub async fn wallet_balance(&self, user_id: &str, channel_id: &str) -> anyhow::Result<Option<i64>> {
		let sql = self.sql("SELECT balance FROM wallets WHERE user_id = ? AND channel_id = ?");
		on_pool!(self, |pool| {
			sqlx::query_scalar::<_, i64>(&sql)
				.bind(user_id)
				.bind(channel_id)
				.fetch_optional(pool)
				.await
				.context("load wallet balance")
		})
	}

	pub async fn reward_event(&self, provider: Platform, provider_event_id: &str) -> anyhow::Result<Option<RewardEventRow>> {
		let sql = self.sql(
			"SELECT id, event_type, coins_to_grant, status, reason, claimed_by_user_id FROM reward_events \
			WHERE provider = ? AND provider_event_id = ?",
		);
		on_pool!(self, |pool| {
			let row = sqlx::query(&sql)
				.bind(provider.as_str())
				.bind(provider_event_id)
				.fetch_optional(pool)
				.await
				.context("load reward event")?;
			row.map(|row| -> anyhow::Result<RewardEventRow> {
				Ok(RewardEventRow {
					id: row.try_get("id")?,
					event_type: row.try_get("event_type")?,
					coins_to_grant: row.try_get("coins_to_grant")?,
					status: row.try_get("status")?,
					reason: row.try_get("reason")?,
					claimed_by_user_id: row.try_get("claimed_by_user_id")?,
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

	fn event<'a>(channel_id: &'a ChannelId, key: &'a str, coins: i64, status: RewardStatus) -> NewRewardEvent<'a> {
		NewRewardEvent {
			id: uuid::Uuid::new_v4(),
			provider: Platform::Twitch,
			provider_event_id: key,
			channel_id,
			provider_account_id: "viewer-1",
			event_type: "follow",
			amount: 0,
			coins_to_grant: coins,
			status,
			reason: None,
			event_at_ms: 1,
			raw_payload: "{}",
			session_id: None,
			created_at_ms: 1,
		}
	}

	#[tokio::test]
	async fn duplicate_keys_insert_once() {
		let store = Store::connect_in_memory().await.expect("store");
		let channel = ChannelId::new("c1").expect("channel id");

		assert!(store.insert_reward_event(&event(&channel, "k1", 10, RewardStatus::Eligible)).await.expect("insert"));
		assert!(!store.insert_reward_event(&event(&channel, "k1", 10, RewardStatus::Eligible)).await.expect("insert"));
		assert_eq!(fixtures::count_reward_events(&store).await, 1);
	}

	#[tokio::test]
	async fn claims_credit_eligible_rows_once() {
		let store = Store::connect_in_memory().await.expect("store");
		let channel = ChannelId::new("c1").expect("channel id");
		store.insert_reward_event(&event(&channel, "k1", 10, RewardStatus::Eligible)).await.expect("insert");
		store.insert_reward_event(&event(&channel, "k2", 15, RewardStatus::Eligible)).await.expect("insert");
		store.insert_reward_event(&event(&channel, "k3", 99, RewardStatus::Ignored)).await.expect("insert");

		let claimed = store
			.claim_pending_rewards(Platform::Twitch, "viewer-1", "user-1", 5)
			.await
			.expect("claim");
		assert_eq!(claimed.len(), 2);
		assert_eq!(claimed.last().map(|c| c.balance), Some(25));
		assert_eq!(store.wallet_balance("user-1", "c1").await.expect("balance"), Some(25));

		let again = store
			.claim_pending_rewards(Platform::Twitch, "viewer-1", "user-1", 6)
			.await
			.expect("claim");
		assert!(again.is_empty());
		assert_eq!(store.wallet_balance("user-1", "c1").await.expect("balance"), Some(25));
	}

	#[tokio::test]
	async fn linked_user_lookup() {
		let store = Store::connect_in_memory().await.expect("store");
		fixtures::account(&store, "a1", None, "twitch", "viewer-1", "viewer").await;
		assert!(store.user_for_account(Platform::Twitch, "viewer-1").await.expect("lookup").is_none());

		fixtures::link_account(&store, "a1", "user-1").await;
		assert_eq!(
			store.user_for_account(Platform::Twitch, "viewer-1").await.expect("lookup").as_deref(),
			Some("user-1")
		);
	}
}
