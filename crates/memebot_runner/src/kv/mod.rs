#![forbid(unsafe_code)]

//! Fast key/value store: dedup markers, counters, locks, stream sessions.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use memebot_domain::{ChannelId, Platform, SessionId};

pub use self::memory::MemoryKv;
pub use self::redis::RedisKv;

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
	async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;

	async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()>;

	/// Set only when absent. Returns whether the value was written.
	async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool>;

	/// Increment, applying `ttl` when the key is created.
	async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<i64>;

	async fn decr(&self, key: &str) -> anyhow::Result<i64>;

	async fn delete(&self, key: &str) -> anyhow::Result<()>;

	/// Delete only while the key still holds `value`.
	async fn delete_if_equals(&self, key: &str, value: &str) -> anyhow::Result<bool>;
}

/// Key layout shared by every runner writing to the same store.
#[derive(Debug, Clone)]
pub struct KeySpace {
	prefix: String,
}

impl Default for KeySpace {
	fn default() -> Self {
		Self::new("memebot")
	}
}

impl KeySpace {
	pub fn new(prefix: impl Into<String>) -> Self {
		let prefix = prefix.into();
		let prefix = prefix.trim().trim_end_matches(':');
		Self {
			prefix: if prefix.is_empty() { "memebot".to_string() } else { prefix.to_string() },
		}
	}

	pub fn outbox_dedup(&self, platform: Platform, channel_id: &ChannelId, text_hash: &str) -> String {
		format!("{}:outbox:dedup:{platform}:{channel_id}:{text_hash}", self.prefix)
	}

	pub fn outbox_lock(&self, platform: Platform, channel_id: &ChannelId) -> String {
		format!("{}:outbox:lock:{platform}:{channel_id}", self.prefix)
	}

	pub fn outbox_channel_window(&self, platform: Platform, channel_id: &ChannelId, window: i64) -> String {
		format!("{}:outbox:rate:{platform}:{channel_id}:{window}", self.prefix)
	}

	pub fn outbox_global_window(&self, platform: Platform, window: i64) -> String {
		format!("{}:outbox:rate:{platform}:_global:{window}", self.prefix)
	}

	pub fn stream_session(&self, platform: Platform, channel_id: &ChannelId) -> String {
		format!("{}:stream_session:{platform}:{channel_id}", self.prefix)
	}

	pub fn chat_count(&self, platform: Platform, channel_id: &ChannelId, session_id: &SessionId, user_id: &str) -> String {
		format!("{}:chat_count:{platform}:{channel_id}:{session_id}:{user_id}", self.prefix)
	}

	pub fn chat_streak(&self, platform: Platform, channel_id: &ChannelId, user_id: &str) -> String {
		format!("{}:chat_streak:{platform}:{channel_id}:{user_id}", self.prefix)
	}
}
