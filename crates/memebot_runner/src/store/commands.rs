#![forbid(unsafe_code)]

use anyhow::Context;
use memebot_domain::{ChannelId, Platform};
use sqlx::Row;

use super::{Store, on_pool};

/// Static command as stored. Allow-lists are JSON arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRow {
	pub id: String,
	pub trigger: String,
	pub response: String,
	pub only_when_live: bool,
	pub allowed_roles: String,
	pub allowed_users: String,
	pub native_role_ids: String,
}

impl Store {
	/// Enabled commands for the channel, in display order. Rows without a platform apply everywhere.
	pub async fn channel_commands(&self, channel_id: &ChannelId, platform: Platform) -> anyhow::Result<Vec<CommandRow>> {
		if !self.capabilities().commands {
			return Ok(Vec::new());
		}
		let sql = self.sql(
			"SELECT id, trigger_text, response, only_when_live, allowed_roles, allowed_users, native_role_ids \
			FROM bot_commands WHERE channel_id = ? AND enabled = TRUE AND (platform IS NULL OR platform = ?) \
			ORDER BY position, created_at, id",
		);
		on_pool!(self, |pool| {
			let rows = sqlx::query(&sql)
				.bind(channel_id.as_str())
				.bind(platform.as_str())
				.fetch_all(pool)
				.await
				.context("load bot commands")?;
			rows.iter()
				.map(|row| -> Result<CommandRow, sqlx::Error> {
					Ok(CommandRow {
						id: row.try_get("id")?,
						trigger: row.try_get("trigger_text")?,
						response: row.try_get("response")?,
						only_when_live: row.try_get("only_when_live")?,
						allowed_roles: row.try_get("allowed_roles")?,
						allowed_users: row.try_get("allowed_users")?,
						native_role_ids: row.try_get("native_role_ids")?,
					})
				})
				.collect::<Result<Vec<_>, sqlx::Error>>()
				.context("decode bot commands")
		})
	}

	/// Raw JSON config of one smart command kind.
	pub async fn smart_command_config(&self, channel_id: &ChannelId, kind: &str) -> anyhow::Result<Option<String>> {
		if !self.capabilities().smart_commands {
			return Ok(None);
		}
		let sql = self.sql("SELECT config FROM channel_smart_commands WHERE channel_id = ? AND kind = ?");
		on_pool!(self, |pool| {
			sqlx::query_scalar::<_, String>(&sql)
				.bind(channel_id.as_str())
				.bind(kind)
				.fetch_optional(pool)
				.await
				.context("load smart command config")
		})
	}

	/// Raw JSON reward rules of the channel.
	pub async fn reward_config(&self, channel_id: &ChannelId) -> anyhow::Result<Option<String>> {
		if !self.capabilities().rewards {
			return Ok(None);
		}
		let sql = self.sql("SELECT config FROM channel_reward_configs WHERE channel_id = ?");
		on_pool!(self, |pool| {
			sqlx::query_scalar::<_, String>(&sql)
				.bind(channel_id.as_str())
				.fetch_optional(pool)
				.await
				.context("load reward config")
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::StoreCapabilities;
	use crate::store::fixtures;

	fn cid(s: &str) -> ChannelId {
		ChannelId::new(s).expect("channel id")
	}

	#[tokio::test]
	async fn commands_are_ordered_and_platform_scoped() {
		let store = Store::connect_in_memory().await.expect("store");
		fixtures::command(&store, "a", "c1", "!b", "second", false).await;
		fixtures::command(&store, "b", "c1", "!a", "first", true).await;
		fixtures::command(&store, "x", "c2", "!other", "nope", false).await;

		let rows = store.channel_commands(&cid("c1"), Platform::Twitch).await.expect("load");
		let triggers: Vec<&str> = rows.iter().map(|r| r.trigger.as_str()).collect();
		assert_eq!(triggers, vec!["!b", "!a"]);
		assert!(rows[1].only_when_live);
		assert_eq!(rows[0].allowed_roles, "[]");
	}

	#[tokio::test]
	async fn missing_capability_reads_as_empty() {
		let store = Store::connect_in_memory().await.expect("store").with_capabilities(StoreCapabilities {
			commands: false,
			smart_commands: false,
			rewards: false,
		});
		fixtures::command(&store, "a", "c1", "!a", "x", false).await;
		fixtures::reward_config(&store, "c1", "{}").await;

		assert!(store.channel_commands(&cid("c1"), Platform::Kick).await.expect("load").is_empty());
		assert!(store.reward_config(&cid("c1")).await.expect("load").is_none());
	}

	#[tokio::test]
	async fn smart_and_reward_configs_round_trip_as_text() {
		let store = Store::connect_in_memory().await.expect("store");
		fixtures::smart_command(&store, "c1", "stream_duration", r#"{"enabled":true}"#).await;
		let cfg = store
			.smart_command_config(&cid("c1"), "stream_duration")
			.await
			.expect("load");
		assert_eq!(cfg.as_deref(), Some(r#"{"enabled":true}"#));
		assert!(store.smart_command_config(&cid("c1"), "other").await.expect("load").is_none());
	}
}
