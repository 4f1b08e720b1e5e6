#![forbid(unsafe_code)]

//! Reward rules and their evaluation for viewer events and chat activity.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use memebot_domain::{ChannelId, Platform, SessionId};
use memebot_platform::{ChatMessage, PlatformEvent, PlatformEventKind};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::channel_state::ChannelState;
use super::ledger::{RecordOutcome, RewardCandidate, RewardDecision, RewardLedger};
use crate::config::RewardSettings;
use crate::kv::{KeySpace, KvStore};
use crate::util::time::{utc_date_label, utc_day, utc_day_from_label};

pub const REASON_DISABLED: &str = "disabled";
pub const REASON_OFFLINE: &str = "offline";
pub const REASON_ZERO_COINS: &str = "zero_coins";
pub const REASON_BELOW_MINIMUM: &str = "below_minimum";
pub const REASON_NOT_CONFIGURED: &str = "not_configured";

pub const EVENT_CHAT_FIRST_MESSAGE: &str = "chat_first_message";
pub const EVENT_CHAT_THRESHOLD: &str = "chat_message_threshold";
pub const EVENT_CHAT_DAILY_STREAK: &str = "chat_daily_streak";

fn live_only() -> bool {
	true
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FollowRule {
	pub enabled: bool,
	pub coins: i64,
	pub only_when_live: bool,
	/// One grant per (channel, user), ever.
	pub once_ever: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubscribeRule {
	pub enabled: bool,
	/// Keyed by tier (`1000`, `2000`, `3000`).
	pub tier_coins: HashMap<String, i64>,
	pub prime_coins: i64,
	pub only_when_live: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GiftSubRule {
	pub enabled: bool,
	pub giver_coins_per_sub: i64,
	pub recipient_coins: i64,
	pub only_when_live: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RaidRule {
	pub enabled: bool,
	pub base_coins: i64,
	pub coins_per_viewer: i64,
	pub min_viewers: u64,
	pub only_when_live: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheerRule {
	pub enabled: bool,
	pub coins_per_bit: f64,
	pub min_bits: u64,
	pub only_when_live: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelPointsRule {
	pub enabled: bool,
	pub coins_by_reward_id: HashMap<String, i64>,
	pub only_when_live: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirstMessageRule {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub coins: i64,
	#[serde(default = "live_only")]
	pub only_when_live: bool,
}

impl Default for FirstMessageRule {
	fn default() -> Self {
		Self {
			enabled: false,
			coins: 0,
			only_when_live: true,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageThresholdRule {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub thresholds: Vec<i64>,
	#[serde(default)]
	pub coins_by_threshold: HashMap<String, i64>,
	#[serde(default = "live_only")]
	pub only_when_live: bool,
}

impl Default for MessageThresholdRule {
	fn default() -> Self {
		Self {
			enabled: false,
			thresholds: Vec::new(),
			coins_by_threshold: HashMap::new(),
			only_when_live: true,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStreakRule {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub coins_by_streak: HashMap<String, i64>,
	#[serde(default)]
	pub coins_per_day: i64,
	#[serde(default = "live_only")]
	pub only_when_live: bool,
}

impl Default for DailyStreakRule {
	fn default() -> Self {
		Self {
			enabled: false,
			coins_by_streak: HashMap::new(),
			coins_per_day: 0,
			only_when_live: true,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChatRules {
	pub first_message: FirstMessageRule,
	pub message_thresholds: MessageThresholdRule,
	pub daily_streak: DailyStreakRule,
}

/// Per-channel reward configuration (`channel_reward_configs.config`).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RewardRules {
	pub follow: FollowRule,
	pub subscribe: SubscribeRule,
	pub gift_sub: GiftSubRule,
	pub raid: RaidRule,
	pub cheer: CheerRule,
	pub channel_points: ChannelPointsRule,
	pub chat: ChatRules,
}

impl RewardRules {
	/// Malformed JSON disables every rule.
	pub fn parse(raw: &str) -> Self {
		match serde_json::from_str::<Self>(raw) {
			Ok(rules) => rules,
			Err(e) => {
				warn!(error = %e, "malformed reward config; rewards disabled");
				Self::default()
			}
		}
	}
}

/// Shared gate order: disabled, offline, rule-specific check, zero coins.
fn gate(
	enabled: bool,
	only_when_live: bool,
	live: bool,
	amount: i64,
	coins: Result<i64, &'static str>,
) -> RewardDecision {
	if !enabled {
		return RewardDecision::ignored(amount, REASON_DISABLED);
	}
	if only_when_live && !live {
		return RewardDecision::ignored(amount, REASON_OFFLINE);
	}
	match coins {
		Err(reason) => RewardDecision::ignored(amount, reason),
		Ok(c) if c <= 0 => RewardDecision::ignored(amount, REASON_ZERO_COINS),
		Ok(c) => RewardDecision::eligible(amount, c),
	}
}

/// Rule outcome for a platform event.
pub fn evaluate_event(rules: &RewardRules, kind: &PlatformEventKind, live: bool) -> RewardDecision {
	match kind {
		PlatformEventKind::Follow => {
			let r = &rules.follow;
			gate(r.enabled, r.only_when_live, live, 1, Ok(r.coins))
		}
		PlatformEventKind::Subscribe { is_gift: true, .. } => {
			let r = &rules.gift_sub;
			gate(r.enabled, r.only_when_live, live, 1, Ok(r.recipient_coins))
		}
		PlatformEventKind::Subscribe { tier, is_prime, .. } => {
			let r = &rules.subscribe;
			let coins = if *is_prime {
				Ok(r.prime_coins)
			} else {
				r.tier_coins.get(tier.as_str()).copied().ok_or(REASON_NOT_CONFIGURED)
			};
			gate(r.enabled, r.only_when_live, live, 1, coins)
		}
		PlatformEventKind::GiftSubs { count, .. } => {
			let r = &rules.gift_sub;
			let count = i64::from(*count);
			gate(r.enabled, r.only_when_live, live, count, Ok(r.giver_coins_per_sub.saturating_mul(count)))
		}
		PlatformEventKind::Raid { viewers } => {
			let r = &rules.raid;
			let amount = i64::try_from(*viewers).unwrap_or(i64::MAX);
			let coins = if *viewers < r.min_viewers {
				Err(REASON_BELOW_MINIMUM)
			} else {
				Ok(r.base_coins.saturating_add(r.coins_per_viewer.saturating_mul(amount)))
			};
			gate(r.enabled, r.only_when_live, live, amount, coins)
		}
		PlatformEventKind::Cheer { bits } => {
			let r = &rules.cheer;
			let amount = i64::try_from(*bits).unwrap_or(i64::MAX);
			let coins = if *bits < r.min_bits {
				Err(REASON_BELOW_MINIMUM)
			} else {
				Ok((*bits as f64 * r.coins_per_bit).floor() as i64)
			};
			gate(r.enabled, r.only_when_live, live, amount, coins)
		}
		PlatformEventKind::Redemption { reward_id, .. } => {
			let r = &rules.channel_points;
			let coins = r
				.coins_by_reward_id
				.get(reward_id.as_str())
				.copied()
				.ok_or(REASON_NOT_CONFIGURED);
			gate(r.enabled, r.only_when_live, live, 1, coins)
		}
	}
}

fn sha256_hex(bytes: &[u8]) -> String {
	format!("{:x}", Sha256::digest(bytes))
}

/// Idempotency key for a platform event.
///
/// Native delivery ids win. Without one, the canonical payload hash stands in (object keys serialize sorted).
pub fn event_idempotency_key(
	provider: Platform,
	channel_id: &ChannelId,
	user_id: &str,
	ev: &PlatformEvent,
	once_ever: bool,
) -> String {
	let event_type = ev.kind.as_str();
	if once_ever {
		return format!("{provider}:{event_type}:{channel_id}:{user_id}");
	}
	if let Some(id) = ev.event_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
		return format!("{provider}:{event_type}:{id}");
	}
	if !ev.raw.is_null() {
		return sha256_hex(ev.raw.to_string().as_bytes());
	}
	format!("{provider}:{event_type}:{channel_id}:-:{user_id}:{}", ev.occurred_at_ms)
}

/// One chat-activity milestone.
struct ChatGrant {
	event_type: &'static str,
	key: String,
	decision: RewardDecision,
	counter: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StreakState {
	last_date: String,
	streak: i64,
}

/// `None` when today was already counted.
fn advance_streak(previous: Option<&StreakState>, today: i64) -> Option<i64> {
	let Some(prev) = previous else {
		return Some(1);
	};
	match utc_day_from_label(&prev.last_date) {
		Some(day) if day == today => None,
		Some(day) if day + 1 == today => Some(prev.streak + 1),
		_ => Some(1),
	}
}

/// Turns events and chat activity into ledger entries.
pub struct RewardProcessor {
	ledger: Arc<RewardLedger>,
	kv: Arc<dyn KvStore>,
	keys: KeySpace,
	platform: Platform,
	settings: RewardSettings,
}

impl RewardProcessor {
	pub fn new(
		ledger: Arc<RewardLedger>,
		kv: Arc<dyn KvStore>,
		keys: KeySpace,
		platform: Platform,
		settings: RewardSettings,
	) -> Self {
		Self {
			ledger,
			kv,
			keys,
			platform,
			settings,
		}
	}

	/// `None` when the event cannot be attributed to a viewer.
	pub async fn on_event(
		&self,
		state: &ChannelState,
		ev: &PlatformEvent,
		now_ms: i64,
	) -> anyhow::Result<Option<RecordOutcome>> {
		if !self.settings.enabled {
			return Ok(None);
		}
		let Some(user) = ev.user.as_ref().filter(|u| !u.id.trim().is_empty()) else {
			debug!(channel_id = %state.target.channel_id, event_type = ev.kind.as_str(), "anonymous event skipped");
			return Ok(None);
		};

		let channel_id = &state.target.channel_id;
		let decision = evaluate_event(&state.rewards, &ev.kind, state.is_live());
		let once_ever = matches!(ev.kind, PlatformEventKind::Follow) && state.rewards.follow.once_ever;
		let candidate = RewardCandidate {
			provider: self.platform,
			provider_event_id: event_idempotency_key(self.platform, channel_id, &user.id, ev, once_ever),
			channel_id: channel_id.clone(),
			provider_account_id: user.id.clone(),
			event_type: ev.kind.as_str().to_string(),
			decision,
			event_at_ms: if ev.occurred_at_ms > 0 { ev.occurred_at_ms } else { now_ms },
			raw_payload: ev.raw.to_string(),
			session_id: state.session,
		};
		self.ledger.record(&candidate).await.map(Some)
	}

	/// Chat-activity rewards for one message. Disabled chat rules write nothing.
	///
	/// Grants are recorded independently; a failed one is logged and the rest still run. Counter and
	/// streak state only stay advanced when their grants were recorded, so a failed grant is retried
	/// on the user's next message.
	pub async fn on_chat(
		&self,
		state: &ChannelState,
		msg: &ChatMessage,
		now_ms: i64,
	) -> anyhow::Result<Vec<RecordOutcome>> {
		if !self.settings.enabled {
			return Ok(Vec::new());
		}
		let mut outcomes = Vec::new();
		let mut failed = 0usize;

		self.chat_counter_grants(state, msg, now_ms, &mut outcomes, &mut failed)
			.await;
		self.daily_streak_grant(state, msg, now_ms, &mut outcomes, &mut failed)
			.await;

		if failed > 0 {
			return Err(anyhow!("{failed} chat reward grant(s) failed"));
		}
		Ok(outcomes)
	}

	async fn chat_counter_grants(
		&self,
		state: &ChannelState,
		msg: &ChatMessage,
		now_ms: i64,
		outcomes: &mut Vec<RecordOutcome>,
		failed: &mut usize,
	) {
		let rules = &state.rewards.chat;
		if !rules.first_message.enabled && !rules.message_thresholds.enabled {
			return;
		}
		let Some(session) = state.session.as_ref() else {
			debug!(channel_id = %state.target.channel_id, "no stream session; chat counters skipped");
			return;
		};
		let counter_key = self
			.keys
			.chat_count(self.platform, &state.target.channel_id, session, &msg.author.id);
		let count = match self.kv.incr(&counter_key, self.settings.counter_ttl).await {
			Ok(count) => count,
			Err(e) => {
				warn!(channel_id = %state.target.channel_id, user_id = %msg.author.id, error = %e, "chat counter update failed");
				*failed += 1;
				return;
			}
		};

		let mut grants = Vec::new();
		if count == 1 && rules.first_message.enabled {
			let r = &rules.first_message;
			grants.push(ChatGrant {
				event_type: EVENT_CHAT_FIRST_MESSAGE,
				key: self.chat_key(EVENT_CHAT_FIRST_MESSAGE, state, Some(session), &msg.author.id, "1"),
				decision: gate(true, r.only_when_live, state.is_live(), 1, Ok(r.coins)),
				counter: count,
			});
		}
		let r = &rules.message_thresholds;
		if r.enabled && r.thresholds.contains(&count) {
			let coins = r
				.coins_by_threshold
				.get(&count.to_string())
				.copied()
				.ok_or(REASON_NOT_CONFIGURED);
			grants.push(ChatGrant {
				event_type: EVENT_CHAT_THRESHOLD,
				key: self.chat_key(EVENT_CHAT_THRESHOLD, state, Some(session), &msg.author.id, &count.to_string()),
				decision: gate(true, r.only_when_live, state.is_live(), count, coins),
				counter: count,
			});
		}

		let mut lost = false;
		for grant in grants {
			let event_type = grant.event_type;
			match self.record_chat(state, msg, grant, now_ms).await {
				Ok(outcome) => outcomes.push(outcome),
				Err(e) => {
					warn!(channel_id = %state.target.channel_id, user_id = %msg.author.id, event_type, error = %e, "chat reward failed");
					*failed += 1;
					lost = true;
				}
			}
		}

		// Step back so the next message lands on the same count; recorded grants dedup by key.
		if lost && let Err(e) = self.kv.decr(&counter_key).await {
			warn!(channel_id = %state.target.channel_id, user_id = %msg.author.id, error = %e, "chat counter rollback failed");
		}
	}

	async fn daily_streak_grant(
		&self,
		state: &ChannelState,
		msg: &ChatMessage,
		now_ms: i64,
		outcomes: &mut Vec<RecordOutcome>,
		failed: &mut usize,
	) {
		let r = &state.rewards.chat.daily_streak;
		if !r.enabled || (r.only_when_live && !state.is_live()) {
			return;
		}
		let day = utc_day(msg.sent_at_ms.unwrap_or(now_ms));
		let streak_key = self.keys.chat_streak(self.platform, &state.target.channel_id, &msg.author.id);
		let next = match self.next_streak(&streak_key, day).await {
			Ok(Some(next)) => next,
			Ok(None) => return,
			Err(e) => {
				warn!(channel_id = %state.target.channel_id, user_id = %msg.author.id, error = %e, "streak lookup failed");
				*failed += 1;
				return;
			}
		};

		let coins = r
			.coins_by_streak
			.get(&next.streak.to_string())
			.copied()
			.unwrap_or(r.coins_per_day);
		let grant = ChatGrant {
			event_type: EVENT_CHAT_DAILY_STREAK,
			key: self.chat_key(EVENT_CHAT_DAILY_STREAK, state, None, &msg.author.id, &next.last_date),
			decision: gate(true, false, true, next.streak, Ok(coins)),
			counter: next.streak,
		};
		match self.record_chat(state, msg, grant, now_ms).await {
			Ok(outcome) => {
				outcomes.push(outcome);
				if let Err(e) = self.store_streak(&streak_key, &next).await {
					warn!(channel_id = %state.target.channel_id, user_id = %msg.author.id, error = %e, "streak update failed");
				}
			}
			Err(e) => {
				warn!(
					channel_id = %state.target.channel_id,
					user_id = %msg.author.id,
					event_type = EVENT_CHAT_DAILY_STREAK,
					error = %e,
					"chat reward failed"
				);
				*failed += 1;
			}
		}
	}

	/// The streak state today's message would produce, or `None` when today already counted.
	async fn next_streak(&self, key: &str, today: i64) -> anyhow::Result<Option<StreakState>> {
		let previous = match self.kv.get(key).await? {
			Some(raw) => serde_json::from_str::<StreakState>(&raw).ok(),
			None => None,
		};
		Ok(advance_streak(previous.as_ref(), today).map(|streak| StreakState {
			last_date: utc_date_label(today),
			streak,
		}))
	}

	async fn store_streak(&self, key: &str, next: &StreakState) -> anyhow::Result<()> {
		let raw = serde_json::to_string(next).context("encode streak state")?;
		self.kv.set(key, &raw, Some(self.settings.streak_ttl)).await
	}

	/// Deterministic key: `provider:eventType:channelId:sessionId:userId:counter`.
	fn chat_key(
		&self,
		event_type: &str,
		state: &ChannelState,
		session: Option<&SessionId>,
		user_id: &str,
		counter: &str,
	) -> String {
		let session = session.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string());
		format!(
			"{}:{event_type}:{}:{session}:{user_id}:{counter}",
			self.platform, state.target.channel_id
		)
	}

	async fn record_chat(
		&self,
		state: &ChannelState,
		msg: &ChatMessage,
		grant: ChatGrant,
		now_ms: i64,
	) -> anyhow::Result<RecordOutcome> {
		let raw = serde_json::json!({
			"messageId": msg.id,
			"userId": msg.author.id,
			"login": msg.author.login,
			"counter": grant.counter,
		});
		let candidate = RewardCandidate {
			provider: self.platform,
			provider_event_id: grant.key,
			channel_id: state.target.channel_id.clone(),
			provider_account_id: msg.author.id.clone(),
			event_type: grant.event_type.to_string(),
			decision: grant.decision,
			event_at_ms: msg.sent_at_ms.unwrap_or(now_ms),
			raw_payload: raw.to_string(),
			session_id: state.session,
		};
		self.ledger.record(&candidate).await
	}
}
