#![forbid(unsafe_code)]

//! Seed rows for tests. SQLite only.

use super::{Store, StoreBackend};

fn pool(store: &Store) -> &sqlx::SqlitePool {
	match &store.backend {
		StoreBackend::Sqlite(pool) => pool,
		StoreBackend::Postgres(_) => panic!("fixtures require the sqlite backend"),
	}
}

pub async fn channel(store: &Store, id: &str, slug: &str, custom_bot_entitled: bool) {
	sqlx::query("INSERT INTO channels (id, slug, custom_bot_entitled) VALUES (?, ?, ?)")
		.bind(id)
		.bind(slug)
		.bind(custom_bot_entitled)
		.execute(pool(store))
		.await
		.expect("insert channel");
}

pub async fn channel_owner(store: &Store, id: &str, owner_user_id: &str) {
	sqlx::query("UPDATE channels SET owner_user_id = ? WHERE id = ?")
		.bind(owner_user_id)
		.bind(id)
		.execute(pool(store))
		.await
		.expect("update channel owner");
}

pub async fn subscription(
	store: &Store,
	channel_id: &str,
	platform: &str,
	platform_channel_id: &str,
	bot_override: Option<&str>,
) {
	sqlx::query(
		"INSERT INTO bot_subscriptions (channel_id, platform, platform_channel_id, slug, enabled, bot_external_account_id) \
		VALUES (?, ?, ?, ?, 1, ?)",
	)
	.bind(channel_id)
	.bind(platform)
	.bind(platform_channel_id)
	.bind(format!("{channel_id}-slug"))
	.bind(bot_override)
	.execute(pool(store))
	.await
	.expect("insert subscription");
}

pub async fn set_platform_channel_id(store: &Store, channel_id: &str, platform: &str, platform_channel_id: &str) {
	sqlx::query("UPDATE bot_subscriptions SET platform_channel_id = ? WHERE channel_id = ? AND platform = ?")
		.bind(platform_channel_id)
		.bind(channel_id)
		.bind(platform)
		.execute(pool(store))
		.await
		.expect("update subscription");
}

pub async fn disable_subscription(store: &Store, channel_id: &str, platform: &str) {
	sqlx::query("UPDATE bot_subscriptions SET enabled = 0 WHERE channel_id = ? AND platform = ?")
		.bind(channel_id)
		.bind(platform)
		.execute(pool(store))
		.await
		.expect("disable subscription");
}

pub async fn account(
	store: &Store,
	id: &str,
	user_id: Option<&str>,
	provider: &str,
	provider_account_id: &str,
	login: &str,
) {
	sqlx::query(
		"INSERT INTO external_accounts (id, user_id, provider, provider_account_id, login) VALUES (?, ?, ?, ?, ?)",
	)
	.bind(id)
	.bind(user_id)
	.bind(provider)
	.bind(provider_account_id)
	.bind(login)
	.execute(pool(store))
	.await
	.expect("insert external account");
}

pub async fn link_account(store: &Store, id: &str, user_id: &str) {
	sqlx::query("UPDATE external_accounts SET user_id = ? WHERE id = ?")
		.bind(user_id)
		.bind(id)
		.execute(pool(store))
		.await
		.expect("link account");
}

pub async fn account_tokens(store: &Store, id: &str, access: &str, refresh: &str, expires_at_ms: i64) {
	sqlx::query("UPDATE external_accounts SET access_token = ?, refresh_token = ?, token_expires_at = ? WHERE id = ?")
		.bind(access)
		.bind(refresh)
		.bind(expires_at_ms)
		.bind(id)
		.execute(pool(store))
		.await
		.expect("set tokens");
}

pub async fn global_bot(store: &Store, platform: &str, external_account_id: &str) {
	sqlx::query("INSERT INTO global_bot_accounts (platform, external_account_id) VALUES (?, ?)")
		.bind(platform)
		.bind(external_account_id)
		.execute(pool(store))
		.await
		.expect("insert global bot");
}

/// Static command row with empty allow-lists.
pub async fn command(store: &Store, id: &str, channel_id: &str, trigger: &str, response: &str, only_when_live: bool) {
	sqlx::query(
		"INSERT INTO bot_commands (id, channel_id, trigger_text, response, only_when_live, position, created_at) \
		VALUES (?, ?, ?, ?, ?, 0, 0)",
	)
	.bind(id)
	.bind(channel_id)
	.bind(trigger)
	.bind(response)
	.bind(only_when_live)
	.execute(pool(store))
	.await
	.expect("insert command");
}

pub async fn command_allow_lists(store: &Store, id: &str, roles: &str, users: &str, native_role_ids: &str) {
	sqlx::query("UPDATE bot_commands SET allowed_roles = ?, allowed_users = ?, native_role_ids = ? WHERE id = ?")
		.bind(roles)
		.bind(users)
		.bind(native_role_ids)
		.bind(id)
		.execute(pool(store))
		.await
		.expect("update command allow lists");
}

pub async fn smart_command(store: &Store, channel_id: &str, kind: &str, config: &str) {
	sqlx::query("INSERT INTO channel_smart_commands (channel_id, kind, config) VALUES (?, ?, ?)")
		.bind(channel_id)
		.bind(kind)
		.bind(config)
		.execute(pool(store))
		.await
		.expect("insert smart command");
}

pub async fn reward_config(store: &Store, channel_id: &str, config: &str) {
	sqlx::query("INSERT INTO channel_reward_configs (channel_id, config) VALUES (?, ?)")
		.bind(channel_id)
		.bind(config)
		.execute(pool(store))
		.await
		.expect("insert reward config");
}

pub async fn count_reward_events(store: &Store) -> i64 {
	sqlx::query_scalar("SELECT COUNT(*) FROM reward_events")
		.fetch_one(pool(store))
		.await
		.expect("count reward events")
}

/// Make subscription loads fail.
pub async fn drop_subscriptions(store: &Store) {
	sqlx::query("DROP TABLE bot_subscriptions")
		.execute(pool(store))
		.await
		.expect("drop subscriptions");
}

pub async fn set_slug(store: &Store, channel_id: &str, platform: &str, slug: &str) {
	sqlx::query("UPDATE bot_subscriptions SET slug = ? WHERE channel_id = ? AND platform = ?")
		.bind(slug)
		.bind(channel_id)
		.bind(platform)
		.execute(pool(store))
		.await
		.expect("update slug");
}

/// Make ledger writes fail until [`restore_reward_events`].
pub async fn hide_reward_events(store: &Store) {
	sqlx::query("ALTER TABLE reward_events RENAME TO reward_events_hidden")
		.execute(pool(store))
		.await
		.expect("hide reward events");
}

pub async fn restore_reward_events(store: &Store) {
	sqlx::query("ALTER TABLE reward_events_hidden RENAME TO reward_events")
		.execute(pool(store))
		.await
		.expect("restore reward events");
}
