#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use memebot_domain::{ChannelId, PlatformChannelId, SessionId};
use memebot_platform::{ChannelTarget, LiveHandle};
use parking_lot::RwLock;

use super::commands::{BotCommand, STREAM_DURATION_KIND, SmartCommandConfig};
use super::rewards::RewardRules;
use crate::store::Store;

/// Per-channel runtime state. Owned by the registry entry; guarded by the slot mutex.
#[derive(Debug)]
pub struct ChannelState {
	pub target: ChannelTarget,

	pub commands: Vec<BotCommand>,
	pub smart: Option<SmartCommandConfig>,
	pub rewards: RewardRules,
	/// Last successful config load.
	pub config_loaded_at: Option<Instant>,

	pub live: Option<LiveHandle>,
	pub cursor: Option<String>,
	/// The next page only advances the cursor.
	pub first_poll_after_reconnect: bool,
	pub last_poll_at: Option<Instant>,
	pub last_live_check_at: Option<Instant>,
	pub poll_interval_hint: Option<Duration>,
	pub session: Option<SessionId>,
	/// Start of the current stream session (unix ms).
	pub session_started_at_ms: Option<i64>,
}

impl ChannelState {
	pub fn new(target: ChannelTarget) -> Self {
		Self {
			target,
			commands: Vec::new(),
			smart: None,
			rewards: RewardRules::default(),
			config_loaded_at: None,
			live: None,
			cursor: None,
			first_poll_after_reconnect: true,
			last_poll_at: None,
			last_live_check_at: None,
			poll_interval_hint: None,
			session: None,
			session_started_at_ms: None,
		}
	}

	pub fn is_live(&self) -> bool {
		self.live.is_some()
	}

	pub fn config_is_stale(&self, max_age: Duration) -> bool {
		self.config_loaded_at.is_none_or(|at| at.elapsed() >= max_age)
	}

	/// Reload commands, smart command and reward rules. On error the cached config stays in place.
	pub async fn reload_config(&mut self, store: &Store) -> anyhow::Result<()> {
		let channel_id = &self.target.channel_id;
		let rows = store.channel_commands(channel_id, self.target.platform).await?;
		let smart = store.smart_command_config(channel_id, STREAM_DURATION_KIND).await?;
		let rewards = store.reward_config(channel_id).await?;

		self.commands = rows.into_iter().filter_map(BotCommand::from_row).collect();
		self.smart = smart.as_deref().and_then(SmartCommandConfig::parse);
		self.rewards = rewards.as_deref().map(RewardRules::parse).unwrap_or_default();
		self.config_loaded_at = Some(Instant::now());
		Ok(())
	}

	/// Take new configuration fields. Returns whether anything changed.
	pub fn merge_target(&mut self, target: ChannelTarget) -> bool {
		if self.target == target {
			return false;
		}
		if self.target.platform_channel_id != target.platform_channel_id {
			// Different chat entirely.
			self.live = None;
			self.cursor = None;
			self.first_poll_after_reconnect = true;
			self.last_live_check_at = None;
			self.last_poll_at = None;
			self.poll_interval_hint = None;
			self.session = None;
			self.session_started_at_ms = None;
		}
		self.target = target;
		true
	}
}

pub type ChannelSlot = Arc<tokio::sync::Mutex<ChannelState>>;

#[derive(Clone)]
struct ChannelEntry {
	target: ChannelTarget,
	slot: ChannelSlot,
}

/// Channels owned by this runner. Only the registry inserts and removes entries.
#[derive(Clone, Default)]
pub struct ChannelMap {
	inner: Arc<RwLock<HashMap<ChannelId, ChannelEntry>>>,
}

impl ChannelMap {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.inner.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.read().is_empty()
	}

	pub fn slot(&self, channel_id: &ChannelId) -> Option<ChannelSlot> {
		self.inner.read().get(channel_id).map(|e| e.slot.clone())
	}

	/// Current addressing of the channel without waiting on its state lock.
	pub fn target(&self, channel_id: &ChannelId) -> Option<ChannelTarget> {
		self.inner.read().get(channel_id).map(|e| e.target.clone())
	}

	pub fn find_by_platform_channel(&self, platform_channel_id: &PlatformChannelId) -> Option<ChannelSlot> {
		self.inner
			.read()
			.values()
			.find(|e| &e.target.platform_channel_id == platform_channel_id)
			.map(|e| e.slot.clone())
	}

	pub fn snapshot(&self) -> Vec<(ChannelId, ChannelSlot)> {
		self.inner
			.read()
			.iter()
			.map(|(id, e)| (id.clone(), e.slot.clone()))
			.collect()
	}

	pub fn contains(&self, channel_id: &ChannelId) -> bool {
		self.inner.read().contains_key(channel_id)
	}

	pub fn ids(&self) -> Vec<ChannelId> {
		self.inner.read().keys().cloned().collect()
	}

	pub(crate) fn insert(&self, target: ChannelTarget) -> ChannelSlot {
		let slot = Arc::new(tokio::sync::Mutex::new(ChannelState::new(target.clone())));
		self.inner.write().insert(
			target.channel_id.clone(),
			ChannelEntry {
				target,
				slot: slot.clone(),
			},
		);
		slot
	}

	pub(crate) fn set_target(&self, target: ChannelTarget) {
		if let Some(entry) = self.inner.write().get_mut(&target.channel_id) {
			entry.target = target;
		}
	}

	pub(crate) fn remove(&self, channel_id: &ChannelId) -> bool {
		self.inner.write().remove(channel_id).is_some()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bot::test_support::target;
	use crate::store::fixtures;

	#[test]
	fn slug_change_keeps_runtime_state() {
		let mut state = ChannelState::new(target("c1", "111"));
		state.live = Some(LiveHandle::new("s1"));
		state.cursor = Some("cur".into());
		state.first_poll_after_reconnect = false;

		let mut renamed = target("c1", "111");
		renamed.slug = "renamed".into();
		assert!(state.merge_target(renamed));
		assert_eq!(state.cursor.as_deref(), Some("cur"));
		assert!(state.is_live());
		assert!(!state.merge_target(state.target.clone()));
	}

	#[test]
	fn platform_channel_change_resets_runtime_state() {
		let mut state = ChannelState::new(target("c1", "111"));
		state.live = Some(LiveHandle::new("s1"));
		state.cursor = Some("cur".into());
		state.first_poll_after_reconnect = false;

		assert!(state.merge_target(target("c1", "222")));
		assert!(state.live.is_none());
		assert!(state.cursor.is_none());
		assert!(state.first_poll_after_reconnect);
	}

	#[tokio::test]
	async fn reload_reads_commands_and_rules() {
		let store = Store::connect_in_memory().await.expect("store");
		fixtures::command(&store, "cmd-1", "c1", "!Discord", "discord.gg/x", false).await;
		fixtures::smart_command(&store, "c1", STREAM_DURATION_KIND, r#"{"enabled":true,"trigger":"!uptime"}"#).await;
		fixtures::reward_config(&store, "c1", r#"{"follow":{"enabled":true,"coins":50}}"#).await;

		let mut state = ChannelState::new(target("c1", "111"));
		assert!(state.config_is_stale(Duration::from_secs(60)));
		state.reload_config(&store).await.expect("reload");

		assert_eq!(state.commands.len(), 1);
		assert_eq!(state.commands[0].trigger, "!discord");
		assert!(state.smart.as_ref().is_some_and(|s| s.enabled));
		assert!(state.rewards.follow.enabled);
		assert_eq!(state.rewards.follow.coins, 50);
		assert!(!state.config_is_stale(Duration::from_secs(60)));
	}

	#[test]
	fn map_lookups() {
		let map = ChannelMap::new();
		map.insert(target("c1", "111"));
		map.insert(target("c2", "222"));
		assert_eq!(map.len(), 2);
		assert!(map.find_by_platform_channel(&PlatformChannelId::new("222").expect("id")).is_some());
		assert!(map.remove(&ChannelId::new("c1").expect("id")));
		assert!(map.target(&ChannelId::new("c1").expect("id")).is_none());
	}
}
