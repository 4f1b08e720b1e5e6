#![forbid(unsafe_code)]

//! EventSub webhook transport: signature checks and notification decoding.

use std::time::Duration;

use anyhow::Context;
use hmac::{Hmac, Mac};
use memebot_domain::{Platform, PlatformChannelId};
use serde::Deserialize;
use sha2::Sha256;

use crate::{ChatMessage, ChatRole, LiveHandle, PlatformEvent, PlatformEventKind, PushEvent, PushEventKind, UserRef};

pub const HEADER_MESSAGE_ID: &str = "Twitch-Eventsub-Message-Id";
pub const HEADER_MESSAGE_TIMESTAMP: &str = "Twitch-Eventsub-Message-Timestamp";
pub const HEADER_MESSAGE_SIGNATURE: &str = "Twitch-Eventsub-Message-Signature";
pub const HEADER_MESSAGE_TYPE: &str = "Twitch-Eventsub-Message-Type";

/// Notifications older than this are rejected as replays.
pub const MAX_MESSAGE_AGE: Duration = Duration::from_secs(10 * 60);

/// Check `sha256=<hex>` over `message_id + timestamp + body`.
pub fn verify_signature(secret: &str, message_id: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
	let Some(provided) = signature.trim().strip_prefix("sha256=") else {
		return false;
	};
	let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
		return false;
	};
	mac.update(message_id.as_bytes());
	mac.update(timestamp.as_bytes());
	mac.update(body);
	let expected = to_hex(&mac.finalize().into_bytes());
	constant_time_eq(expected.as_bytes(), provided.to_ascii_lowercase().as_bytes())
}

#[cfg(test)]
pub(crate) fn sign(secret: &str, message_id: &str, timestamp: &str, body: &[u8]) -> String {
	let mut mac = match Hmac::<Sha256>::new_from_slice(secret.as_bytes()) {
		Ok(mac) => mac,
		Err(_) => return String::new(),
	};
	mac.update(message_id.as_bytes());
	mac.update(timestamp.as_bytes());
	mac.update(body);
	format!("sha256={}", to_hex(&mac.finalize().into_bytes()))
}

fn to_hex(bytes: &[u8]) -> String {
	const DIGITS: &[u8; 16] = b"0123456789abcdef";
	let mut out = String::with_capacity(bytes.len() * 2);
	for b in bytes {
		out.push(DIGITS[(b >> 4) as usize] as char);
		out.push(DIGITS[(b & 0x0f) as usize] as char);
	}
	out
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Parse an EventSub RFC3339 timestamp into unix ms.
pub(crate) fn parse_timestamp_ms(ts: &str) -> anyhow::Result<i64> {
	let parsed = chrono::DateTime::parse_from_rfc3339(ts.trim()).context("parse eventsub timestamp")?;
	Ok(parsed.timestamp_millis())
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubEnvelope {
	pub(crate) subscription: EventSubSubscription,
	#[serde(default)]
	pub(crate) challenge: Option<String>,
	#[serde(default)]
	pub(crate) event: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventSubSubscription {
	#[allow(dead_code)]
	pub(crate) id: String,
	#[serde(default)]
	pub(crate) status: String,
	#[serde(rename = "type")]
	pub(crate) r#type: String,
}

#[derive(Debug, Deserialize)]
struct ChannelChatMessageEvent {
	broadcaster_user_id: String,
	chatter_user_id: String,
	chatter_user_login: String,
	#[serde(default)]
	chatter_user_name: Option<String>,
	message_id: String,
	message: ChannelChatMessageBody,
	#[serde(default)]
	badges: Vec<ChannelChatBadge>,
}

#[derive(Debug, Deserialize)]
struct ChannelChatMessageBody {
	text: String,
}

#[derive(Debug, Deserialize)]
struct ChannelChatBadge {
	set_id: String,
}

#[derive(Debug, Deserialize)]
struct UserEvent {
	broadcaster_user_id: String,
	#[serde(default)]
	user_id: Option<String>,
	#[serde(default)]
	user_login: Option<String>,
	#[serde(default)]
	user_name: Option<String>,
}

impl UserEvent {
	fn user(&self) -> Option<UserRef> {
		let id = self.user_id.as_deref().filter(|s| !s.is_empty())?;
		Some(UserRef {
			id: id.to_string(),
			login: self.user_login.clone().unwrap_or_default(),
			display: self.user_name.clone(),
		})
	}
}

#[derive(Debug, Deserialize)]
struct SubscribeEvent {
	#[serde(flatten)]
	user: UserEvent,
	tier: String,
	#[serde(default)]
	is_gift: bool,
}

#[derive(Debug, Deserialize)]
struct GiftEvent {
	#[serde(flatten)]
	user: UserEvent,
	total: u32,
	tier: String,
}

#[derive(Debug, Deserialize)]
struct CheerEvent {
	#[serde(flatten)]
	user: UserEvent,
	bits: u64,
}

#[derive(Debug, Deserialize)]
struct RaidEvent {
	from_broadcaster_user_id: String,
	from_broadcaster_user_login: String,
	#[serde(default)]
	from_broadcaster_user_name: Option<String>,
	to_broadcaster_user_id: String,
	viewers: u64,
}

#[derive(Debug, Deserialize)]
struct RedemptionEvent {
	#[serde(flatten)]
	user: UserEvent,
	id: String,
	reward: RedemptionReward,
}

#[derive(Debug, Deserialize)]
struct RedemptionReward {
	id: String,
	#[serde(default)]
	title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamOnlineEvent {
	id: String,
	broadcaster_user_id: String,
	#[serde(default)]
	started_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamOfflineEvent {
	broadcaster_user_id: String,
}

fn roles_from_badges(badges: &[ChannelChatBadge]) -> Vec<ChatRole> {
	badges
		.iter()
		.filter_map(|b| match b.set_id.as_str() {
			"broadcaster" => Some(ChatRole::Broadcaster),
			"moderator" => Some(ChatRole::Moderator),
			"vip" => Some(ChatRole::Vip),
			"subscriber" | "founder" => Some(ChatRole::Subscriber),
			_ => None,
		})
		.collect()
}

fn push(channel: &str, kind: PushEventKind) -> anyhow::Result<PushEvent> {
	Ok(PushEvent {
		platform: Platform::Twitch,
		platform_channel_id: PlatformChannelId::new(channel.to_string()).context("eventsub broadcaster id")?,
		kind,
	})
}

fn viewer_event(
	channel: &str,
	message_id: &str,
	user: Option<UserRef>,
	kind: PlatformEventKind,
	occurred_at_ms: i64,
	raw: serde_json::Value,
) -> anyhow::Result<PushEvent> {
	push(
		channel,
		PushEventKind::Event(PlatformEvent {
			event_id: Some(message_id.to_string()),
			user,
			kind,
			occurred_at_ms,
			raw,
		}),
	)
}

/// Decode a `notification` body into push events. Unknown types decode to nothing.
pub fn decode_notification(message_id: &str, occurred_at_ms: i64, body: &[u8]) -> anyhow::Result<Vec<PushEvent>> {
	let envelope: EventSubEnvelope = serde_json::from_slice(body).context("parse eventsub envelope")?;
	let Some(event) = envelope.event else {
		return Ok(Vec::new());
	};
	let raw = event.clone();

	let out = match envelope.subscription.r#type.as_str() {
		"channel.chat.message" => {
			let e: ChannelChatMessageEvent = serde_json::from_value(event).context("parse channel.chat.message")?;
			let mut msg = ChatMessage::new(
				e.message_id,
				UserRef {
					id: e.chatter_user_id,
					login: e.chatter_user_login,
					display: e.chatter_user_name,
				},
				e.message.text,
			)
			.with_roles(roles_from_badges(&e.badges));
			msg.sent_at_ms = Some(occurred_at_ms);
			vec![push(&e.broadcaster_user_id, PushEventKind::Chat(msg))?]
		}
		"channel.follow" => {
			let e: UserEvent = serde_json::from_value(event).context("parse channel.follow")?;
			vec![viewer_event(
				&e.broadcaster_user_id,
				message_id,
				e.user(),
				PlatformEventKind::Follow,
				occurred_at_ms,
				raw,
			)?]
		}
		"channel.subscribe" => {
			let e: SubscribeEvent = serde_json::from_value(event).context("parse channel.subscribe")?;
			vec![viewer_event(
				&e.user.broadcaster_user_id,
				message_id,
				e.user.user(),
				PlatformEventKind::Subscribe {
					is_prime: false,
					tier: e.tier,
					is_gift: e.is_gift,
				},
				occurred_at_ms,
				raw,
			)?]
		}
		"channel.subscription.gift" => {
			let e: GiftEvent = serde_json::from_value(event).context("parse channel.subscription.gift")?;
			vec![viewer_event(
				&e.user.broadcaster_user_id,
				message_id,
				e.user.user(),
				PlatformEventKind::GiftSubs {
					count: e.total,
					tier: e.tier,
				},
				occurred_at_ms,
				raw,
			)?]
		}
		"channel.cheer" => {
			let e: CheerEvent = serde_json::from_value(event).context("parse channel.cheer")?;
			vec![viewer_event(
				&e.user.broadcaster_user_id,
				message_id,
				e.user.user(),
				PlatformEventKind::Cheer { bits: e.bits },
				occurred_at_ms,
				raw,
			)?]
		}
		"channel.raid" => {
			let e: RaidEvent = serde_json::from_value(event).context("parse channel.raid")?;
			let raider = UserRef {
				id: e.from_broadcaster_user_id,
				login: e.from_broadcaster_user_login,
				display: e.from_broadcaster_user_name,
			};
			vec![viewer_event(
				&e.to_broadcaster_user_id,
				message_id,
				Some(raider),
				PlatformEventKind::Raid { viewers: e.viewers },
				occurred_at_ms,
				raw,
			)?]
		}
		"channel.channel_points_custom_reward_redemption.add" => {
			let e: RedemptionEvent = serde_json::from_value(event).context("parse channel points redemption")?;
			let mut ev = viewer_event(
				&e.user.broadcaster_user_id,
				message_id,
				e.user.user(),
				PlatformEventKind::Redemption {
					reward_id: e.reward.id,
					reward_title: e.reward.title,
				},
				occurred_at_ms,
				raw,
			)?;
			// Redemption ids are stable across re-deliveries with new message ids.
			if let PushEventKind::Event(pe) = &mut ev.kind {
				pe.event_id = Some(e.id);
			}
			vec![ev]
		}
		"stream.online" => {
			let e: StreamOnlineEvent = serde_json::from_value(event).context("parse stream.online")?;
			let mut handle = LiveHandle::new(e.id);
			handle.started_at_ms = e.started_at.as_deref().and_then(|ts| parse_timestamp_ms(ts).ok());
			vec![push(&e.broadcaster_user_id, PushEventKind::StreamOnline(handle))?]
		}
		"stream.offline" => {
			let e: StreamOfflineEvent = serde_json::from_value(event).context("parse stream.offline")?;
			vec![push(&e.broadcaster_user_id, PushEventKind::StreamOffline)?]
		}
		_ => Vec::new(),
	};

	Ok(out)
}

/// Peek the `challenge` of a `webhook_callback_verification` body.
pub fn decode_challenge(body: &[u8]) -> anyhow::Result<String> {
	let envelope: EventSubEnvelope = serde_json::from_slice(body).context("parse eventsub envelope")?;
	envelope.challenge.context("verification body without challenge")
}

/// `(type, status)` of a revocation body.
pub fn decode_revocation(body: &[u8]) -> anyhow::Result<(String, String)> {
	let envelope: EventSubEnvelope = serde_json::from_slice(body).context("parse eventsub envelope")?;
	Ok((envelope.subscription.r#type, envelope.subscription.status))
}
