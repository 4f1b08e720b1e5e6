#![forbid(unsafe_code)]

//! Kick webhook payloads.

use anyhow::Context;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use memebot_domain::{Platform, PlatformChannelId};
use rsa::RsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::{ChatMessage, ChatRole, LiveHandle, PlatformEvent, PlatformEventKind, PushEvent, PushEventKind, UserRef};

pub const HEADER_EVENT_TYPE: &str = "Kick-Event-Type";
pub const HEADER_MESSAGE_ID: &str = "Kick-Event-Message-Id";
pub const HEADER_MESSAGE_TIMESTAMP: &str = "Kick-Event-Message-Timestamp";
pub const HEADER_SIGNATURE: &str = "Kick-Event-Signature";

pub fn parse_public_key(pem: &str) -> anyhow::Result<RsaPublicKey> {
	RsaPublicKey::from_public_key_pem(pem.trim()).context("parse kick webhook public key")
}

/// RSA PKCS#1 v1.5 SHA-256 over `message_id.timestamp.body`.
pub fn verify_signature(key: &RsaPublicKey, message_id: &str, timestamp: &str, body: &[u8], signature: &str) -> bool {
	if message_id.is_empty() || timestamp.is_empty() || signature.is_empty() {
		return false;
	}
	let mut signed = Vec::with_capacity(message_id.len() + timestamp.len() + body.len() + 2);
	signed.extend_from_slice(message_id.as_bytes());
	signed.push(b'.');
	signed.extend_from_slice(timestamp.as_bytes());
	signed.push(b'.');
	signed.extend_from_slice(body);
	let hash = Sha256::digest(&signed);
	let Ok(signature_bytes) = BASE64_STANDARD.decode(signature.trim()) else {
		return false;
	};
	key.verify(rsa::pkcs1v15::Pkcs1v15Sign::new::<Sha256>(), &hash, &signature_bytes)
		.is_ok()
}

#[derive(Debug, Deserialize)]
struct KickUser {
	#[serde(default)]
	is_anonymous: bool,
	#[serde(default)]
	user_id: Option<u64>,
	#[serde(default)]
	username: Option<String>,
	#[serde(default)]
	identity: Option<KickIdentity>,
}

impl KickUser {
	fn user_ref(&self) -> Option<UserRef> {
		if self.is_anonymous {
			return None;
		}
		let id = self.user_id?;
		let login = self.username.clone().unwrap_or_default();
		Some(UserRef {
			id: id.to_string(),
			display: Some(login.clone()),
			login,
		})
	}
}

#[derive(Debug, Deserialize)]
struct KickIdentity {
	#[serde(default)]
	badges: Vec<KickBadge>,
}

#[derive(Debug, Deserialize)]
struct KickBadge {
	#[serde(rename = "type")]
	badge_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageSent {
	message_id: String,
	content: String,
	#[serde(default)]
	created_at: Option<String>,
	broadcaster: KickUser,
	sender: KickUser,
}

#[derive(Debug, Deserialize)]
struct ChannelFollowed {
	broadcaster: KickUser,
	follower: KickUser,
}

#[derive(Debug, Deserialize)]
struct SubscriptionNew {
	broadcaster: KickUser,
	subscriber: KickUser,
}

#[derive(Debug, Deserialize)]
struct SubscriptionGifts {
	broadcaster: KickUser,
	#[serde(default)]
	gifter: Option<KickUser>,
	#[serde(default)]
	giftees: Vec<KickUser>,
}

#[derive(Debug, Deserialize)]
struct LivestreamStatus {
	broadcaster: KickUser,
	is_live: bool,
	#[serde(default)]
	started_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KicksGifted {
	broadcaster: KickUser,
	sender: KickUser,
	gift: KicksGift,
}

#[derive(Debug, Deserialize)]
struct KicksGift {
	amount: u64,
}

fn roles_from_identity(identity: Option<&KickIdentity>) -> Vec<ChatRole> {
	identity
		.map(|identity| {
			identity
				.badges
				.iter()
				.filter_map(|b| match b.badge_type.as_deref() {
					Some("broadcaster") => Some(ChatRole::Broadcaster),
					Some("moderator") => Some(ChatRole::Moderator),
					Some("vip") | Some("og") => Some(ChatRole::Vip),
					Some("subscriber") | Some("founder") => Some(ChatRole::Subscriber),
					_ => None,
				})
				.collect()
		})
		.unwrap_or_default()
}

fn rfc3339_ms(ts: Option<&str>) -> Option<i64> {
	ts.and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
		.map(|dt| dt.timestamp_millis())
}

fn push(broadcaster: &KickUser, kind: PushEventKind) -> anyhow::Result<PushEvent> {
	let id = broadcaster.user_id.context("kick payload without broadcaster id")?;
	Ok(PushEvent {
		platform: Platform::Kick,
		platform_channel_id: PlatformChannelId::new(id.to_string())?,
		kind,
	})
}

fn viewer_event(
	broadcaster: &KickUser,
	event_id: String,
	user: Option<UserRef>,
	kind: PlatformEventKind,
	occurred_at_ms: i64,
	raw: &serde_json::Value,
) -> anyhow::Result<PushEvent> {
	push(
		broadcaster,
		PushEventKind::Event(PlatformEvent {
			event_id: Some(event_id),
			user,
			kind,
			occurred_at_ms,
			raw: raw.clone(),
		}),
	)
}

/// Decode a webhook body by its `Kick-Event-Type`. Unknown types decode to nothing.
pub fn decode(event_type: &str, message_id: &str, received_at_ms: i64, body: &[u8]) -> anyhow::Result<Vec<PushEvent>> {
	let raw: serde_json::Value = serde_json::from_slice(body).context("parse kick webhook body")?;

	let out = match event_type {
		"chat.message.sent" => {
			let p: ChatMessageSent = serde_json::from_value(raw).context("parse chat.message.sent")?;
			let Some(author) = p.sender.user_ref() else {
				return Ok(Vec::new());
			};
			let mut msg = ChatMessage::new(p.message_id, author, p.content)
				.with_roles(roles_from_identity(p.sender.identity.as_ref()));
			msg.sent_at_ms = rfc3339_ms(p.created_at.as_deref()).or(Some(received_at_ms));
			vec![push(&p.broadcaster, PushEventKind::Chat(msg))?]
		}
		"channel.followed" => {
			let p: ChannelFollowed = serde_json::from_value(raw.clone()).context("parse channel.followed")?;
			vec![viewer_event(
				&p.broadcaster,
				message_id.to_string(),
				p.follower.user_ref(),
				PlatformEventKind::Follow,
				received_at_ms,
				&raw,
			)?]
		}
		"channel.subscription.new" | "channel.subscription.renewal" => {
			let p: SubscriptionNew = serde_json::from_value(raw.clone()).context("parse channel.subscription")?;
			vec![viewer_event(
				&p.broadcaster,
				message_id.to_string(),
				p.subscriber.user_ref(),
				PlatformEventKind::Subscribe {
					tier: "1000".to_string(),
					is_prime: false,
					is_gift: false,
				},
				received_at_ms,
				&raw,
			)?]
		}
		"channel.subscription.gifts" => {
			let p: SubscriptionGifts = serde_json::from_value(raw.clone()).context("parse channel.subscription.gifts")?;
			let mut out = vec![viewer_event(
				&p.broadcaster,
				message_id.to_string(),
				p.gifter.as_ref().and_then(KickUser::user_ref),
				PlatformEventKind::GiftSubs {
					count: p.giftees.len() as u32,
					tier: "1000".to_string(),
				},
				received_at_ms,
				&raw,
			)?];
			for giftee in &p.giftees {
				let Some(user) = giftee.user_ref() else {
					continue;
				};
				out.push(viewer_event(
					&p.broadcaster,
					format!("{message_id}:{}", user.id),
					Some(user),
					PlatformEventKind::Subscribe {
						tier: "1000".to_string(),
						is_prime: false,
						is_gift: true,
					},
					received_at_ms,
					&raw,
				)?);
			}
			out
		}
		"kicks.gifted" => {
			let p: KicksGifted = serde_json::from_value(raw.clone()).context("parse kicks.gifted")?;
			vec![viewer_event(
				&p.broadcaster,
				message_id.to_string(),
				p.sender.user_ref(),
				PlatformEventKind::Cheer { bits: p.gift.amount },
				received_at_ms,
				&raw,
			)?]
		}
		"livestream.status.updated" => {
			let p: LivestreamStatus = serde_json::from_value(raw).context("parse livestream.status.updated")?;
			if p.is_live {
				let id = p.started_at.clone().unwrap_or_else(|| message_id.to_string());
				let mut handle = LiveHandle::new(id);
				handle.started_at_ms = rfc3339_ms(p.started_at.as_deref());
				vec![push(&p.broadcaster, PushEventKind::StreamOnline(handle))?]
			} else {
				vec![push(&p.broadcaster, PushEventKind::StreamOffline)?]
			}
		}
		_ => Vec::new(),
	};

	Ok(out)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn user(id: u64, name: &str) -> serde_json::Value {
		serde_json::json!({
			"is_anonymous": false,
			"user_id": id,
			"username": name,
			"is_verified": false,
			"profile_picture": "",
			"channel_slug": name,
			"identity": null,
		})
	}

	#[test]
	fn chat_message_sent_routes_by_broadcaster() {
		let mut sender = user(22, "viewer");
		sender["identity"] = serde_json::json!({ "username_color": "#fff", "badges": [{ "text": "Mod", "type": "moderator" }] });
		let body = serde_json::to_vec(&serde_json::json!({
			"message_id": "kmsg-1",
			"broadcaster": user(11, "streamer"),
			"sender": sender,
			"content": "!discord",
			"emotes": [],
			"created_at": "2025-01-14T16:08:06Z",
		}))
		.expect("serialize");

		let events = decode("chat.message.sent", "hook-1", 0, &body).expect("decode");
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].platform_channel_id.as_str(), "11");
		let PushEventKind::Chat(msg) = &events[0].kind else {
			panic!("expected chat");
		};
		assert_eq!(msg.id, "kmsg-1");
		assert_eq!(msg.author.id, "22");
		assert_eq!(msg.roles, vec![ChatRole::Moderator]);
	}

	#[test]
	fn gifts_fan_out_to_giftees() {
		let body = serde_json::to_vec(&serde_json::json!({
			"broadcaster": user(11, "streamer"),
			"gifter": user(33, "generous"),
			"giftees": [user(44, "a"), user(55, "b")],
			"created_at": "2025-01-14T16:08:06Z",
		}))
		.expect("serialize");

		let events = decode("channel.subscription.gifts", "hook-9", 0, &body).expect("decode");
		assert_eq!(events.len(), 3);
		let PushEventKind::Event(giver) = &events[0].kind else {
			panic!("expected event");
		};
		assert_eq!(
			giver.kind,
			PlatformEventKind::GiftSubs {
				count: 2,
				tier: "1000".into()
			}
		);
		let PushEventKind::Event(recipient) = &events[2].kind else {
			panic!("expected event");
		};
		assert_eq!(recipient.event_id.as_deref(), Some("hook-9:55"));
	}

	#[test]
	fn livestream_status_maps_to_online_offline() {
		let body = serde_json::to_vec(&serde_json::json!({
			"broadcaster": user(11, "streamer"),
			"is_live": true,
			"title": "hi",
			"started_at": "2025-01-01T11:00:00+11:00",
			"ended_at": null,
		}))
		.expect("serialize");
		let events = decode("livestream.status.updated", "h", 0, &body).expect("decode");
		assert!(matches!(events[0].kind, PushEventKind::StreamOnline(_)));

		let body = serde_json::to_vec(&serde_json::json!({
			"broadcaster": user(11, "streamer"),
			"is_live": false,
			"title": "hi",
			"started_at": null,
			"ended_at": "2025-01-01T15:00:00+11:00",
		}))
		.expect("serialize");
		let events = decode("livestream.status.updated", "h", 0, &body).expect("decode");
		assert!(matches!(events[0].kind, PushEventKind::StreamOffline));
	}

	#[test]
	fn unknown_event_types_are_ignored() {
		assert!(decode("moderation.banned", "h", 0, b"{}").expect("decode").is_empty());
	}

	const TEST_PUBLIC_KEY: &str = "-----BEGIN PUBLIC KEY-----
MIGfMA0GCSqGSIb3DQEBAQUAA4GNADCBiQKBgQC680E1+bN4aM9ltXasya8K2dOP
nGpK8os6sGxMeMxwicODdKaHpD2JG7ixtIy2hqbe8hzQ8toQPN1VGF9rFDEAgep8
ROKhouWqcDE1xVcww6M2CfiyXdVaouB8sCc02+lpU7wGapynqGqcb18Z71gtp6C5
FjsT7FhRgzp0v7MzjwIDAQAB
-----END PUBLIC KEY-----";

	const TEST_SIGNATURE: &str = "IDpQZdTQSWGd+w7JDA4gQtdHG+h30qhYsHMR86/Soo/JbXeSXoR4559dT95C4aEJO9Rnfwqrjc1c4ss45mmV8h/w1+5qUpq7voPByWknDC08HciKPEGDtkoXu4guBVIrJ6cMSuHgCRuP6c4L84GbKQqHAry6LrtBs+XCha90t68=";

	#[test]
	fn signature_verification() {
		let key = parse_public_key(TEST_PUBLIC_KEY).expect("key");
		let body = br#"{"ok":true}"#;
		assert!(verify_signature(&key, "msg-1", "2025-01-14T16:08:06Z", body, TEST_SIGNATURE));
		assert!(!verify_signature(&key, "msg-2", "2025-01-14T16:08:06Z", body, TEST_SIGNATURE));
		assert!(!verify_signature(&key, "msg-1", "2025-01-14T16:08:06Z", br#"{"ok":false}"#, TEST_SIGNATURE));
		assert!(!verify_signature(&key, "", "ts", body, TEST_SIGNATURE));
		assert!(!verify_signature(&key, "msg-1", "2025-01-14T16:08:06Z", body, "not-base64!"));
	}
}
