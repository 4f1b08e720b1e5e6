#![forbid(unsafe_code)]

//! Keeps the channel map in line with the enabled subscriptions of this runner's shard.

use std::collections::HashMap;
use std::sync::Arc;

use memebot_domain::{ChannelId, Platform, UserId};
use memebot_platform::{BotIdentity, ChannelTarget, ChatPlatform, TokenIdentity};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::channel_state::ChannelMap;
use crate::store::Store;
use crate::store::subscriptions::{BotAccountRow, SubscriptionRow};

/// Whether `channel_id` belongs to shard `index` of `count`.
pub fn owns_channel(channel_id: &ChannelId, index: u32, count: u32) -> bool {
	if count <= 1 {
		return true;
	}
	let digest = Sha256::digest(channel_id.as_str().as_bytes());
	let mut head = [0u8; 8];
	head.copy_from_slice(&digest[..8]);
	u64::from_be_bytes(head) % u64::from(count) == u64::from(index)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
	pub added: usize,
	pub updated: usize,
	pub removed: usize,
	/// Subscriptions without a usable bot identity.
	pub skipped: usize,
}

pub struct SubscriptionRegistry {
	store: Store,
	adapter: Arc<dyn ChatPlatform>,
	channels: ChannelMap,
	platform: Platform,
	shard_index: u32,
	shard_count: u32,
}

impl SubscriptionRegistry {
	pub fn new(
		store: Store,
		adapter: Arc<dyn ChatPlatform>,
		channels: ChannelMap,
		shard_index: u32,
		shard_count: u32,
	) -> Self {
		Self {
			store,
			platform: adapter.platform(),
			adapter,
			channels,
			shard_index,
			shard_count: shard_count.max(1),
		}
	}

	/// Reload subscriptions and reconcile the map. The map is untouched when loading fails.
	pub async fn sync(&self) -> anyhow::Result<SyncReport> {
		let mut report = SyncReport::default();
		let desired = self.desired_targets(&mut report).await?;

		for (channel_id, target) in &desired {
			match self.channels.slot(channel_id) {
				None => {
					self.channels.insert(target.clone());
					info!(channel_id = %channel_id, platform = %self.platform, slug = %target.slug, "channel added");
					report.added += 1;
				}
				Some(slot) => {
					if self.channels.target(channel_id).as_ref() == Some(target) {
						continue;
					}
					self.channels.set_target(target.clone());
					slot.lock().await.merge_target(target.clone());
					debug!(channel_id = %channel_id, "channel config updated");
					report.updated += 1;
				}
			}
		}

		for channel_id in self.channels.ids() {
			if desired.contains_key(&channel_id) {
				continue;
			}
			if self.channels.remove(&channel_id) {
				self.adapter.forget_channel(&channel_id).await;
				info!(channel_id = %channel_id, platform = %self.platform, "channel removed");
				report.removed += 1;
			}
		}

		metrics::gauge!("memebot_channels_active", "platform" => self.platform.as_str()).set(self.channels.len() as f64);
		Ok(report)
	}

	async fn desired_targets(&self, report: &mut SyncReport) -> anyhow::Result<HashMap<ChannelId, ChannelTarget>> {
		let rows = self.store.enabled_subscriptions(self.platform).await?;
		let global_bot = self.store.global_bot_account(self.platform).await?;

		let mut desired = HashMap::new();
		for row in rows {
			if !owns_channel(&row.channel_id, self.shard_index, self.shard_count) {
				continue;
			}
			let Some(bot) = self.resolve_bot(&row, global_bot.as_ref()).await? else {
				warn!(channel_id = %row.channel_id, platform = %self.platform, "no bot account for channel; skipped");
				report.skipped += 1;
				continue;
			};
			let owner = row
				.owner_user_id
				.as_deref()
				.and_then(|id| UserId::new(id).ok())
				.map(|user_id| TokenIdentity::User {
					user_id,
					platform: self.platform,
				});
			desired.insert(
				row.channel_id.clone(),
				ChannelTarget {
					channel_id: row.channel_id,
					platform: self.platform,
					platform_channel_id: row.platform_channel_id,
					slug: row.slug,
					bot: BotIdentity {
						external_account_id: bot.external_account_id,
						platform_user_id: Some(bot.provider_account_id),
						login: bot.login,
					},
					owner,
				},
			);
		}
		Ok(desired)
	}

	/// Override bot for entitled channels, else the platform default.
	async fn resolve_bot(
		&self,
		row: &SubscriptionRow,
		global_bot: Option<&BotAccountRow>,
	) -> anyhow::Result<Option<BotAccountRow>> {
		if row.custom_bot_entitled
			&& let Some(override_id) = row.bot_override.as_deref()
		{
			if let Some(bot) = self.store.bot_account(override_id).await? {
				return Ok(Some(bot));
			}
			warn!(channel_id = %row.channel_id, override_id, "bot override account missing; using default bot");
		}
		Ok(global_bot.cloned())
	}
}

#[cfg(test)]
mod tests {
	use memebot_platform::IngestMode;

	use super::*;
	use crate::adapters::DemoAdapter;
	use crate::store::fixtures;

	async fn setup() -> (Store, Arc<DemoAdapter>, ChannelMap, SubscriptionRegistry) {
		let store = Store::connect_in_memory().await.expect("store");
		fixtures::account(&store, "acct-bot", None, "twitch", "9000", "memebot").await;
		fixtures::global_bot(&store, "twitch", "acct-bot").await;
		let adapter = Arc::new(DemoAdapter::new(Platform::Twitch, IngestMode::Poll));
		let channels = ChannelMap::new();
		let registry = SubscriptionRegistry::new(store.clone(), adapter.clone(), channels.clone(), 0, 1);
		(store, adapter, channels, registry)
	}

	fn cid(s: &str) -> ChannelId {
		ChannelId::new(s).expect("channel id")
	}

	#[tokio::test]
	async fn override_bot_only_for_entitled_channels() {
		let (store, _, channels, registry) = setup().await;
		fixtures::account(&store, "acct-custom", None, "twitch", "7777", "custombot").await;
		fixtures::channel(&store, "c1", "alpha", true).await;
		fixtures::channel(&store, "c2", "beta", false).await;
		fixtures::subscription(&store, "c1", "twitch", "111", Some("acct-custom")).await;
		fixtures::subscription(&store, "c2", "twitch", "222", Some("acct-custom")).await;

		let report = registry.sync().await.expect("sync");
		assert_eq!(report.added, 2);

		let c1 = channels.target(&cid("c1")).expect("c1");
		assert_eq!(c1.bot.external_account_id, "acct-custom");
		assert_eq!(c1.bot.platform_user_id.as_deref(), Some("7777"));
		let c2 = channels.target(&cid("c2")).expect("c2");
		assert_eq!(c2.bot.external_account_id, "acct-bot");
		assert_eq!(c2.bot.login.as_deref(), Some("memebot"));
	}

	#[tokio::test]
	async fn owner_identity_is_attached() {
		let (store, _, channels, registry) = setup().await;
		fixtures::channel(&store, "c1", "alpha", false).await;
		fixtures::channel_owner(&store, "c1", "user-1").await;
		fixtures::subscription(&store, "c1", "twitch", "111", None).await;

		registry.sync().await.expect("sync");
		let target = channels.target(&cid("c1")).expect("c1");
		assert_eq!(
			target.owner,
			Some(TokenIdentity::User {
				user_id: UserId::new("user-1").expect("user id"),
				platform: Platform::Twitch,
			})
		);
	}

	#[tokio::test]
	async fn merge_keeps_runtime_state() {
		let (store, _, channels, registry) = setup().await;
		fixtures::channel(&store, "c1", "alpha", false).await;
		fixtures::subscription(&store, "c1", "twitch", "111", None).await;
		registry.sync().await.expect("sync");

		let slot = channels.slot(&cid("c1")).expect("slot");
		slot.lock().await.cursor = Some("cursor-9".to_string());

		// Unchanged rows are a no-op.
		assert_eq!(registry.sync().await.expect("sync"), SyncReport::default());

		fixtures::set_slug(&store, "c1", "twitch", "renamed").await;
		let report = registry.sync().await.expect("sync");
		assert_eq!(report.updated, 1);
		let state = slot.lock().await;
		assert_eq!(state.target.slug, "renamed");
		assert_eq!(state.cursor.as_deref(), Some("cursor-9"));
	}

	#[tokio::test]
	async fn platform_channel_change_resets_the_cursor() {
		let (store, _, channels, registry) = setup().await;
		fixtures::channel(&store, "c1", "alpha", false).await;
		fixtures::subscription(&store, "c1", "twitch", "111", None).await;
		registry.sync().await.expect("sync");
		let slot = channels.slot(&cid("c1")).expect("slot");
		slot.lock().await.cursor = Some("cursor-9".to_string());

		fixtures::set_platform_channel_id(&store, "c1", "twitch", "333").await;
		registry.sync().await.expect("sync");
		let state = slot.lock().await;
		assert_eq!(state.target.platform_channel_id.as_str(), "333");
		assert!(state.cursor.is_none());
	}

	#[tokio::test]
	async fn disabled_subscriptions_are_removed_and_forgotten() {
		let (store, adapter, channels, registry) = setup().await;
		fixtures::channel(&store, "c1", "alpha", false).await;
		fixtures::subscription(&store, "c1", "twitch", "111", None).await;
		registry.sync().await.expect("sync");
		assert_eq!(channels.len(), 1);

		fixtures::disable_subscription(&store, "c1", "twitch").await;
		let report = registry.sync().await.expect("sync");
		assert_eq!(report.removed, 1);
		assert!(channels.is_empty());
		assert_eq!(adapter.forgotten(), vec![cid("c1")]);
	}

	#[tokio::test]
	async fn channels_without_a_bot_are_skipped() {
		let store = Store::connect_in_memory().await.expect("store");
		fixtures::channel(&store, "c1", "alpha", false).await;
		fixtures::subscription(&store, "c1", "kick", "k1", None).await;
		let adapter = Arc::new(DemoAdapter::new(Platform::Kick, IngestMode::Push));
		let channels = ChannelMap::new();
		let registry = SubscriptionRegistry::new(store, adapter, channels.clone(), 0, 1);

		let report = registry.sync().await.expect("sync");
		assert_eq!(report.skipped, 1);
		assert!(channels.is_empty());
	}

	#[tokio::test]
	async fn failed_load_leaves_the_map_alone() {
		let (store, _, channels, registry) = setup().await;
		fixtures::channel(&store, "c1", "alpha", false).await;
		fixtures::subscription(&store, "c1", "twitch", "111", None).await;
		registry.sync().await.expect("sync");

		fixtures::drop_subscriptions(&store).await;
		assert!(registry.sync().await.is_err());
		assert_eq!(channels.len(), 1);
	}

	#[test]
	fn every_channel_has_exactly_one_shard() {
		for n in 0..200 {
			let id = cid(&format!("channel-{n}"));
			let owners = (0..4).filter(|i| owns_channel(&id, *i, 4)).count();
			assert_eq!(owners, 1);
			assert!(owns_channel(&id, 0, 1));
		}
	}
}
