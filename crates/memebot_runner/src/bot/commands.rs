#![forbid(unsafe_code)]

//! Chat command matching: the stream-duration smart command, then static commands with allow-lists.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use memebot_domain::ChannelId;
use memebot_platform::{ChannelTarget, ChatMessage, ChatPlatform, ChatRole, truncate_chars};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

use super::channel_state::{ChannelMap, ChannelState};
use crate::store::commands::CommandRow;

/// `channel_smart_commands.kind` of the uptime command.
pub const STREAM_DURATION_KIND: &str = "stream_duration";

const ROLE_CACHE_TTL: Duration = Duration::from_secs(60);

/// Canonical form used for trigger comparison.
pub fn normalize(text: &str) -> String {
	text.trim().replace("\r\n", "\n").to_lowercase()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SmartCommandConfig {
	pub enabled: bool,
	pub trigger: String,
	pub response_template: String,
	pub offline_response: String,
	pub only_when_live: bool,
}

impl Default for SmartCommandConfig {
	fn default() -> Self {
		Self {
			enabled: false,
			trigger: "!uptime".to_string(),
			response_template: "Stream uptime: {hours}h {minutes}m".to_string(),
			offline_response: "Stream is offline".to_string(),
			only_when_live: false,
		}
	}
}

impl SmartCommandConfig {
	/// Malformed JSON disables the command.
	pub fn parse(raw: &str) -> Option<Self> {
		match serde_json::from_str::<Self>(raw) {
			Ok(cfg) => Some(cfg),
			Err(e) => {
				warn!(error = %e, "malformed smart command config; disabled");
				None
			}
		}
	}

	pub fn render(&self, elapsed_ms: i64) -> String {
		let total_minutes = elapsed_ms.max(0) / 60_000;
		self.response_template
			.replace("{totalMinutes}", &total_minutes.to_string())
			.replace("{hours}", &(total_minutes / 60).to_string())
			.replace("{minutes}", &(total_minutes % 60).to_string())
	}
}

/// A static command ready for matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotCommand {
	pub id: String,
	/// Normalized trigger.
	pub trigger: String,
	pub response: String,
	pub only_when_live: bool,
	pub allowed_roles: Vec<ChatRole>,
	/// Lower-cased logins.
	pub allowed_users: Vec<String>,
	pub native_role_ids: Vec<String>,
	/// Any allow-list is non-empty.
	pub restricted: bool,
}

fn string_list(raw: &str) -> Result<Vec<String>, serde_json::Error> {
	if raw.trim().is_empty() {
		return Ok(Vec::new());
	}
	let list: Vec<String> = serde_json::from_str(raw)?;
	Ok(list.into_iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
}

impl BotCommand {
	/// `None` when the trigger is blank or an allow-list does not parse.
	pub fn from_row(row: CommandRow) -> Option<Self> {
		let trigger = normalize(&row.trigger);
		if trigger.is_empty() {
			return None;
		}
		let lists = (
			string_list(&row.allowed_roles),
			string_list(&row.allowed_users),
			string_list(&row.native_role_ids),
		);
		let (roles, users, native) = match lists {
			(Ok(r), Ok(u), Ok(n)) => (r, u, n),
			(r, u, n) => {
				let error = [r.err(), u.err(), n.err()].into_iter().flatten().next();
				warn!(command_id = %row.id, error = ?error, "malformed command allow-list; command skipped");
				return None;
			}
		};

		let restricted = !roles.is_empty() || !users.is_empty() || !native.is_empty();
		let allowed_roles = roles
			.iter()
			.filter_map(|r| match ChatRole::from_str(r) {
				Ok(role) => Some(role),
				Err(_) => {
					debug!(command_id = %row.id, role = %r, "ignoring unknown chat role");
					None
				}
			})
			.collect();

		Some(Self {
			id: row.id,
			trigger,
			response: row.response,
			only_when_live: row.only_when_live,
			allowed_roles,
			allowed_users: users.into_iter().map(|u| u.to_lowercase()).collect(),
			native_role_ids: native,
			restricted,
		})
	}
}

type RoleCacheKey = (ChannelId, String);

/// Picks the reply for a chat message, if any.
pub struct CommandMatcher {
	adapter: Arc<dyn ChatPlatform>,
	role_cache: Mutex<HashMap<RoleCacheKey, (Vec<String>, Instant)>>,
	role_ttl: Duration,
}

impl CommandMatcher {
	pub fn new(adapter: Arc<dyn ChatPlatform>) -> Self {
		Self {
			adapter,
			role_cache: Mutex::new(HashMap::new()),
			role_ttl: ROLE_CACHE_TTL,
		}
	}

	pub async fn reply_for(&self, state: &ChannelState, msg: &ChatMessage, now_ms: i64) -> Option<String> {
		let text = normalize(&msg.text);
		if text.is_empty() {
			return None;
		}
		let max_chars = state.target.platform.max_message_chars();

		if let Some(smart) = state.smart.as_ref().filter(|s| s.enabled)
			&& normalize(&smart.trigger) == text
		{
			return smart_reply(smart, state, now_ms).map(|r| truncate_chars(&r, max_chars).to_string());
		}

		let command = state.commands.iter().find(|c| c.trigger == text)?;
		if command.only_when_live && !state.is_live() {
			debug!(channel_id = %state.target.channel_id, command_id = %command.id, "live-only command while offline");
			return None;
		}
		if !self.is_permitted(&state.target, command, msg).await {
			debug!(channel_id = %state.target.channel_id, command_id = %command.id, user = %msg.author.login, "command not permitted");
			return None;
		}
		metrics::counter!("memebot_commands_matched_total", "platform" => state.target.platform.as_str()).increment(1);
		Some(truncate_chars(&command.response, max_chars).to_string())
	}

	async fn is_permitted(&self, target: &ChannelTarget, command: &BotCommand, msg: &ChatMessage) -> bool {
		if !command.restricted {
			return true;
		}
		if command.allowed_roles.iter().any(|r| msg.has_role(*r)) {
			return true;
		}
		if command.allowed_users.contains(&msg.author.login.to_lowercase()) {
			return true;
		}
		if command.native_role_ids.is_empty() {
			return false;
		}
		match self.native_role_ids(target, &msg.author.id).await {
			Some(ids) => ids.iter().any(|id| command.native_role_ids.contains(id)),
			None => false,
		}
	}

	/// Drops cached roles of channels no longer on this runner, and expired ones.
	pub fn prune_role_cache(&self, channels: &ChannelMap) {
		let ttl = self.role_ttl;
		self.role_cache
			.lock()
			.retain(|(channel_id, _), (_, at)| at.elapsed() < ttl && channels.contains(channel_id));
	}

	/// Cached per (channel, user). A lookup failure is not cached and denies.
	async fn native_role_ids(&self, target: &ChannelTarget, user_id: &str) -> Option<Vec<String>> {
		let key = (target.channel_id.clone(), user_id.to_string());
		if let Some((ids, at)) = self.role_cache.lock().get(&key)
			&& at.elapsed() < self.role_ttl
		{
			return Some(ids.clone());
		}

		match self.adapter.fetch_user_role_ids(target, user_id).await {
			Ok(ids) => {
				let mut cache = self.role_cache.lock();
				let ttl = self.role_ttl;
				cache.retain(|_, (_, at)| at.elapsed() < ttl);
				cache.insert(key, (ids.clone(), Instant::now()));
				Some(ids)
			}
			Err(e) => {
				warn!(channel_id = %target.channel_id, user_id, error = %e, "native role lookup failed");
				None
			}
		}
	}
}

fn smart_reply(smart: &SmartCommandConfig, state: &ChannelState, now_ms: i64) -> Option<String> {
	let Some(live) = state.live.as_ref() else {
		if smart.only_when_live {
			return None;
		}
		return Some(smart.offline_response.clone());
	};
	// A resumed session keeps counting from its first broadcast.
	let started = state.session_started_at_ms.or(live.started_at_ms).unwrap_or(now_ms);
	Some(smart.render(now_ms - started))
}

#[cfg(test)]
mod tests {
	use memebot_domain::Platform;
	use memebot_platform::{IngestMode, LiveHandle};
	use proptest::prelude::*;

	use super::*;
	use crate::adapters::DemoAdapter;
	use crate::bot::test_support::{chat, target};

	fn row(id: &str, trigger: &str, response: &str) -> CommandRow {
		CommandRow {
			id: id.to_string(),
			trigger: trigger.to_string(),
			response: response.to_string(),
			only_when_live: false,
			allowed_roles: "[]".to_string(),
			allowed_users: "[]".to_string(),
			native_role_ids: "[]".to_string(),
		}
	}

	fn matcher() -> (Arc<DemoAdapter>, CommandMatcher) {
		let adapter = Arc::new(DemoAdapter::new(Platform::Twitch, IngestMode::Push));
		let matcher = CommandMatcher::new(adapter.clone());
		(adapter, matcher)
	}

	fn live(state: &mut ChannelState, started_at_ms: i64) {
		let mut handle = LiveHandle::new("s1");
		handle.started_at_ms = Some(started_at_ms);
		state.live = Some(handle);
	}

	#[test]
	fn normalization() {
		assert_eq!(normalize("  !Discord \r\n"), "!discord");
		assert_eq!(normalize("a\r\nB"), "a\nb");
	}

	#[tokio::test]
	async fn first_matching_command_wins() {
		let (_, matcher) = matcher();
		let mut state = ChannelState::new(target("c1", "111"));
		state.commands = vec![
			BotCommand::from_row(row("1", "!Discord", "first")).expect("command"),
			BotCommand::from_row(row("2", "!discord ", "second")).expect("command"),
		];

		let reply = matcher.reply_for(&state, &chat("m1", "u1", "viewer", "!DISCORD"), 0).await;
		assert_eq!(reply.as_deref(), Some("first"));
		assert!(matcher.reply_for(&state, &chat("m2", "u1", "viewer", "!discord now"), 0).await.is_none());
	}

	#[tokio::test]
	async fn live_only_commands_are_silent_offline() {
		let (_, matcher) = matcher();
		let mut state = ChannelState::new(target("c1", "111"));
		let mut r = row("1", "!clip", "clipped");
		r.only_when_live = true;
		state.commands = vec![BotCommand::from_row(r).expect("command")];

		assert!(matcher.reply_for(&state, &chat("m1", "u1", "v", "!clip"), 0).await.is_none());
		live(&mut state, 0);
		assert_eq!(matcher.reply_for(&state, &chat("m2", "u1", "v", "!clip"), 0).await.as_deref(), Some("clipped"));
	}

	#[tokio::test]
	async fn smart_command_renders_uptime_and_short_circuits() {
		let (_, matcher) = matcher();
		let mut state = ChannelState::new(target("c1", "111"));
		state.smart = SmartCommandConfig::parse(r#"{"enabled":true,"trigger":"!uptime","responseTemplate":"up {hours}h {minutes}m ({totalMinutes})"}"#);
		state.commands = vec![BotCommand::from_row(row("1", "!uptime", "static")).expect("command")];

		let offline = matcher.reply_for(&state, &chat("m1", "u1", "v", "!uptime"), 0).await;
		assert_eq!(offline.as_deref(), Some("Stream is offline"));

		live(&mut state, 1_000);
		let now = 1_000 + (2 * 60 + 5) * 60_000 + 59_000;
		let reply = matcher.reply_for(&state, &chat("m2", "u1", "v", "!UPTIME"), now).await;
		assert_eq!(reply.as_deref(), Some("up 2h 5m (125)"));
	}

	#[tokio::test]
	async fn live_only_smart_command_blocks_static_fallback() {
		let (_, matcher) = matcher();
		let mut state = ChannelState::new(target("c1", "111"));
		state.smart = SmartCommandConfig::parse(r#"{"enabled":true,"onlyWhenLive":true}"#);
		state.commands = vec![BotCommand::from_row(row("1", "!uptime", "static")).expect("command")];

		assert!(matcher.reply_for(&state, &chat("m1", "u1", "v", "!uptime"), 0).await.is_none());
	}

	#[tokio::test]
	async fn allow_lists_gate_replies() {
		let (adapter, matcher) = matcher();
		let mut state = ChannelState::new(target("c1", "111"));
		let mut r = row("1", "!secret", "ok");
		r.allowed_roles = r#"["mod"]"#.to_string();
		r.allowed_users = r#"["FriendOfStream"]"#.to_string();
		r.native_role_ids = r#"["role-9"]"#.to_string();
		state.commands = vec![BotCommand::from_row(r).expect("command")];

		let moderator = chat("m1", "u1", "someone", "!secret").with_roles([ChatRole::Moderator]);
		assert!(matcher.reply_for(&state, &moderator, 0).await.is_some());
		assert!(matcher.reply_for(&state, &chat("m2", "u2", "friendofstream", "!secret"), 0).await.is_some());
		assert!(matcher.reply_for(&state, &chat("m3", "u3", "stranger", "!secret"), 0).await.is_none());

		adapter.set_role_ids("u4", &["role-9"]);
		assert!(matcher.reply_for(&state, &chat("m4", "u4", "native", "!secret"), 0).await.is_some());
		assert!(matcher.reply_for(&state, &chat("m5", "u4", "native", "!secret"), 0).await.is_some());
		assert_eq!(adapter.role_lookups(), 2, "u3 and u4 looked up once each");
	}

	#[tokio::test]
	async fn role_cache_drops_expired_and_removed_channels() {
		let (adapter, mut matcher) = matcher();
		matcher.role_ttl = Duration::from_millis(1);
		let mut r = row("1", "!secret", "ok");
		r.native_role_ids = r#"["role-9"]"#.to_string();
		let command = BotCommand::from_row(r).expect("command");
		let mut c1 = ChannelState::new(target("c1", "111"));
		c1.commands = vec![command.clone()];
		let mut c2 = ChannelState::new(target("c2", "222"));
		c2.commands = vec![command];
		adapter.set_role_ids("u1", &["role-9"]);

		assert!(matcher.reply_for(&c1, &chat("m1", "u1", "v", "!secret"), 0).await.is_some());
		std::thread::sleep(Duration::from_millis(5));
		assert!(matcher.reply_for(&c1, &chat("m2", "u2", "w", "!secret"), 0).await.is_none());
		assert_eq!(matcher.role_cache.lock().len(), 1, "expired u1 entry pruned on insert");

		matcher.role_ttl = Duration::from_secs(60);
		assert!(matcher.reply_for(&c2, &chat("m3", "u1", "v", "!secret"), 0).await.is_some());
		assert_eq!(matcher.role_cache.lock().len(), 2);

		let channels = ChannelMap::new();
		channels.insert(target("c2", "222"));
		matcher.prune_role_cache(&channels);
		let cache = matcher.role_cache.lock();
		assert_eq!(cache.len(), 1);
		assert!(cache.keys().all(|(channel_id, _)| channel_id.as_str() == "c2"));
	}

	#[tokio::test]
	async fn role_lookup_failure_denies() {
		let (adapter, matcher) = matcher();
		let mut state = ChannelState::new(target("c1", "111"));
		let mut r = row("1", "!secret", "ok");
		r.native_role_ids = r#"["role-9"]"#.to_string();
		state.commands = vec![BotCommand::from_row(r).expect("command")];

		adapter.set_role_ids("u1", &["role-9"]);
		adapter.fail_role_lookups(true);
		assert!(matcher.reply_for(&state, &chat("m1", "u1", "v", "!secret"), 0).await.is_none());
		adapter.fail_role_lookups(false);
		assert!(matcher.reply_for(&state, &chat("m2", "u1", "v", "!secret"), 0).await.is_some());
	}

	#[tokio::test]
	async fn responses_are_truncated_to_platform_limit() {
		let (_, matcher) = matcher();
		let mut t = target("c1", "111");
		t.platform = Platform::YouTube;
		let mut state = ChannelState::new(t);
		state.commands = vec![BotCommand::from_row(row("1", "!long", &"é".repeat(250))).expect("command")];

		let reply = matcher.reply_for(&state, &chat("m1", "u1", "v", "!long"), 0).await.expect("reply");
		assert_eq!(reply.chars().count(), 200);
	}

	#[test]
	fn malformed_rows_are_skipped() {
		let mut r = row("1", "!x", "y");
		r.allowed_users = "not json".to_string();
		assert!(BotCommand::from_row(r).is_none());
		assert!(BotCommand::from_row(row("2", "   ", "y")).is_none());

		let mut unknown_role = row("3", "!x", "y");
		unknown_role.allowed_roles = r#"["overlord"]"#.to_string();
		let cmd = BotCommand::from_row(unknown_role).expect("command");
		assert!(cmd.restricted);
		assert!(cmd.allowed_roles.is_empty());
	}

	proptest! {
		#[test]
		fn normalize_is_idempotent(s in "[ !a-zA-Z0-9\n]{0,32}") {
			let once = normalize(&s);
			prop_assert_eq!(normalize(&once), once.clone());
		}
	}
}
