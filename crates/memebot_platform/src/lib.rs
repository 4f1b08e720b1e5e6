#![forbid(unsafe_code)]

pub mod http;
pub mod kick;
pub mod token;
pub mod trovo;
pub mod twitch;
pub mod vkvideo;
pub mod webhook;
pub mod youtube;

#[cfg(test)]
mod token_tests;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use memebot_domain::{ChannelId, Platform, PlatformChannelId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use token::{TokenFailure, TokenIdentity, TokenLookup, TokenProvider};

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_empty(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<<S as serde::Serializer>::Ok, <S as serde::Serializer>::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Platform user reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
	pub id: String,
	pub login: String,
	pub display: Option<String>,
}

impl UserRef {
	pub fn new(id: impl Into<String>, login: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			login: login.into(),
			display: None,
		}
	}
}

/// Coarse chat roles shared by every platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
	Broadcaster,
	Moderator,
	Vip,
	Subscriber,
	Viewer,
}

impl ChatRole {
	pub const fn as_str(self) -> &'static str {
		match self {
			ChatRole::Broadcaster => "broadcaster",
			ChatRole::Moderator => "moderator",
			ChatRole::Vip => "vip",
			ChatRole::Subscriber => "subscriber",
			ChatRole::Viewer => "viewer",
		}
	}
}

impl FromStr for ChatRole {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"broadcaster" | "streamer" | "owner" => Ok(ChatRole::Broadcaster),
			"moderator" | "mod" => Ok(ChatRole::Moderator),
			"vip" => Ok(ChatRole::Vip),
			"subscriber" | "sub" | "member" | "sponsor" => Ok(ChatRole::Subscriber),
			"viewer" | "everyone" => Ok(ChatRole::Viewer),
			other => Err(anyhow!("unknown chat role: {other}")),
		}
	}
}

/// Normalized chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
	/// Platform-native message id.
	pub id: String,

	pub author: UserRef,

	pub text: String,

	#[serde(default)]
	pub roles: Vec<ChatRole>,

	/// Platform time (unix ms), when provided.
	#[serde(default)]
	pub sent_at_ms: Option<i64>,
}

impl ChatMessage {
	pub fn new(id: impl Into<String>, author: UserRef, text: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			author,
			text: text.into(),
			roles: Vec::new(),
			sent_at_ms: None,
		}
	}

	pub fn with_roles(mut self, roles: impl IntoIterator<Item = ChatRole>) -> Self {
		self.roles = roles.into_iter().collect();
		self
	}

	pub fn has_role(&self, role: ChatRole) -> bool {
		self.roles.contains(&role)
	}
}

/// Platform handle for an ongoing broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveHandle {
	/// Stream / broadcast / session id. Two handles with different ids are different streams.
	pub id: String,

	/// Chat addressing, when it differs from the channel (YouTube live chat id).
	#[serde(default)]
	pub chat_id: Option<String>,

	#[serde(default)]
	pub started_at_ms: Option<i64>,

	#[serde(default)]
	pub viewer_count: Option<u64>,
}

impl LiveHandle {
	pub fn new(id: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			chat_id: None,
			started_at_ms: None,
			viewer_count: None,
		}
	}
}

/// Reward-qualifying viewer events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlatformEventKind {
	Follow,
	Subscribe {
		/// Tier key (`1000`, `2000`, `3000`).
		tier: String,
		#[serde(default)]
		is_prime: bool,
		/// The subscription was gifted to `user`.
		#[serde(default)]
		is_gift: bool,
	},
	GiftSubs {
		count: u32,
		tier: String,
	},
	Raid {
		viewers: u64,
	},
	Cheer {
		bits: u64,
	},
	Redemption {
		reward_id: String,
		#[serde(default)]
		reward_title: Option<String>,
	},
}

impl PlatformEventKind {
	/// Stable event type label (ledger `event_type` column).
	pub fn as_str(&self) -> &'static str {
		match self {
			Self::Follow => "follow",
			Self::Subscribe { is_gift: true, .. } => "gift_sub_received",
			Self::Subscribe { .. } => "subscribe",
			Self::GiftSubs { .. } => "gift_sub",
			Self::Raid { .. } => "raid",
			Self::Cheer { .. } => "cheer",
			Self::Redemption { .. } => "channel_points",
		}
	}
}

/// A viewer event reported by a platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlatformEvent {
	/// Natural provider id for the delivery (webhook message id, redemption id...).
	pub event_id: Option<String>,

	/// Viewer the event belongs to. `None` for anonymous events.
	pub user: Option<UserRef>,

	pub kind: PlatformEventKind,

	pub occurred_at_ms: i64,

	/// Provider payload snapshot.
	pub raw: serde_json::Value,
}

/// One page of ingested chat.
#[derive(Debug, Clone, Default)]
pub struct MessagePage {
	pub messages: Vec<ChatMessage>,

	/// Viewer events carried by the chat feed itself.
	pub events: Vec<PlatformEvent>,

	pub next_cursor: Option<String>,

	/// Platform-suggested delay before the next poll.
	pub poll_interval: Option<Duration>,
}

/// Pushed webhook notification, addressed by platform channel id.
#[derive(Debug, Clone)]
pub struct PushEvent {
	pub platform: Platform,
	pub platform_channel_id: PlatformChannelId,
	pub kind: PushEventKind,
}

#[derive(Debug, Clone)]
pub enum PushEventKind {
	Chat(ChatMessage),
	Event(PlatformEvent),
	StreamOnline(LiveHandle),
	StreamOffline,
}

/// Bot identity used to send chat and read platform state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
	pub external_account_id: String,
	/// Platform-native user id of the bot account.
	pub platform_user_id: Option<String>,
	pub login: Option<String>,
}

/// Everything an adapter needs to address one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelTarget {
	pub channel_id: ChannelId,
	pub platform: Platform,
	pub platform_channel_id: PlatformChannelId,
	pub slug: String,
	pub bot: BotIdentity,
	/// Streamer's own linked account, when reads need broadcaster scopes.
	pub owner: Option<TokenIdentity>,
}

impl ChannelTarget {
	pub fn bot_identity(&self) -> TokenIdentity {
		TokenIdentity::ExternalAccount(self.bot.external_account_id.clone())
	}

	pub fn read_identity(&self) -> TokenIdentity {
		self.owner.clone().unwrap_or_else(|| self.bot_identity())
	}
}

/// Adapter error classes.
#[derive(Debug, Error)]
pub enum PlatformError {
	#[error("auth error: {0}")]
	Auth(String),
	#[error("channel is not live")]
	NotLive,
	#[error("rate limited (retry after {retry_after:?})")]
	RateLimited { retry_after: Option<Duration> },
	#[error(transparent)]
	Other(#[from] anyhow::Error),
}

impl PlatformError {
	pub fn other(msg: impl fmt::Display) -> Self {
		Self::Other(anyhow!("{msg}"))
	}

	pub fn is_auth(&self) -> bool {
		matches!(self, Self::Auth(_))
	}

	/// Short label for logs and metrics.
	pub fn class(&self) -> &'static str {
		match self {
			Self::Auth(_) => "auth",
			Self::NotLive => "not_live",
			Self::RateLimited { .. } => "rate_limited",
			Self::Other(_) => "other",
		}
	}
}

impl From<TokenFailure> for PlatformError {
	fn from(value: TokenFailure) -> Self {
		if value.needs_relink() {
			PlatformError::Auth(value.to_string())
		} else {
			PlatformError::other(value)
		}
	}
}

/// How a platform delivers chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
	/// The runner polls `list_new_messages`.
	Poll,
	/// Chat arrives as [`PushEvent`]s from the webhook receiver.
	Push,
}

/// Read/write operations every platform implements.
#[async_trait::async_trait]
pub trait ChatPlatform: Send + Sync + 'static {
	fn platform(&self) -> Platform;

	fn ingest_mode(&self) -> IngestMode;

	/// Current broadcast handle, `None` when offline.
	async fn check_live(&self, target: &ChannelTarget) -> Result<Option<LiveHandle>, PlatformError>;

	/// Chat since `cursor`, in platform order.
	async fn list_new_messages(
		&self,
		target: &ChannelTarget,
		live: &LiveHandle,
		cursor: Option<&str>,
	) -> Result<MessagePage, PlatformError>;

	/// Send as the target's bot identity. Adapters that address chat by live handle resolve it themselves.
	async fn send_message(&self, target: &ChannelTarget, text: &str) -> Result<(), PlatformError>;

	/// Platform-native role ids of `user_id` in the channel.
	async fn fetch_user_role_ids(&self, _target: &ChannelTarget, _user_id: &str) -> Result<Vec<String>, PlatformError> {
		Ok(Vec::new())
	}

	/// Drop per-channel caches and connections.
	async fn forget_channel(&self, _channel_id: &ChannelId) {}
}

/// Validate basic chat invariants before a message enters the pipeline.
pub fn validate_chat_message(msg: &ChatMessage) -> anyhow::Result<()> {
	if msg.text.trim().is_empty() {
		return Err(anyhow!("chat message text must be non-empty"));
	}
	if msg.author.id.trim().is_empty() {
		return Err(anyhow!("chat message author id must be non-empty"));
	}
	Ok(())
}

/// Truncate to at most `max_chars` characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
	match text.char_indices().nth(max_chars) {
		Some((idx, _)) => &text[..idx],
		None => text,
	}
}

#[cfg(test)]
mod tests {
	use proptest::prelude::*;

	use super::*;

	#[test]
	fn secret_string_is_redacted() {
		let s = SecretString::new("hunter2");
		assert_eq!(format!("{s}"), "<redacted>");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(serde_json::to_string(&s).unwrap(), "\"\"");
		assert_eq!(s.expose(), "hunter2");
	}

	#[test]
	fn chat_role_aliases() {
		assert_eq!("Mod".parse::<ChatRole>().unwrap(), ChatRole::Moderator);
		assert_eq!("streamer".parse::<ChatRole>().unwrap(), ChatRole::Broadcaster);
		assert_eq!("member".parse::<ChatRole>().unwrap(), ChatRole::Subscriber);
		assert!("overlord".parse::<ChatRole>().is_err());
	}

	#[test]
	fn truncate_respects_char_boundaries() {
		assert_eq!(truncate_chars("héllo", 2), "hé");
		assert_eq!(truncate_chars("short", 10), "short");
		assert_eq!(truncate_chars("", 3), "");
	}

	#[test]
	fn validate_rejects_blank_messages() {
		let msg = ChatMessage::new("1", UserRef::new("u1", "viewer"), "   ");
		assert!(validate_chat_message(&msg).is_err());
		let msg = ChatMessage::new("1", UserRef::new("", "viewer"), "hi");
		assert!(validate_chat_message(&msg).is_err());
		let msg = ChatMessage::new("1", UserRef::new("u1", "viewer"), "hi");
		assert!(validate_chat_message(&msg).is_ok());
	}

	#[test]
	fn event_kind_labels() {
		let gift = PlatformEventKind::Subscribe {
			tier: "1000".into(),
			is_prime: false,
			is_gift: true,
		};
		assert_eq!(gift.as_str(), "gift_sub_received");
		assert_eq!(PlatformEventKind::Raid { viewers: 3 }.as_str(), "raid");
	}

	#[test]
	fn token_failures_map_to_platform_errors() {
		let err: PlatformError = TokenFailure::RevokedGrant("invalid_grant".into()).into();
		assert!(err.is_auth());
		let err: PlatformError = TokenFailure::Transient("timeout".into()).into();
		assert_eq!(err.class(), "other");
	}

	proptest! {
		#[test]
		fn truncate_is_a_char_prefix(text in "\\PC{0,40}", max in 0usize..50) {
			let out = truncate_chars(&text, max);
			prop_assert!(text.starts_with(out));
			prop_assert_eq!(out.chars().count(), text.chars().count().min(max));
		}
	}
}
