#![forbid(unsafe_code)]

//! YouTube Live: live detection via `search` + `videos`, chat via `liveChat/messages` paging.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use memebot_domain::{ChannelId, Platform};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::http::{DEFAULT_REQUEST_TIMEOUT, build_http_client, error_for_status, send_for_json, send_with_retry};
use crate::{
	ChannelTarget, ChatMessage, ChatPlatform, ChatRole, IngestMode, LiveHandle, MessagePage, PlatformError, PlatformEvent,
	PlatformEventKind, TokenProvider, UserRef,
};

#[derive(Debug, Clone)]
pub struct YouTubeConfig {
	pub base_url: String,
	pub request_timeout: Duration,
	pub page_size: u32,
}

impl Default for YouTubeConfig {
	fn default() -> Self {
		Self {
			base_url: "https://www.googleapis.com/youtube/v3".to_string(),
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			page_size: 200,
		}
	}
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
	#[serde(default = "Vec::new")]
	items: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItem {
	id: SearchItemId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchItemId {
	#[serde(default)]
	video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Video {
	id: String,
	#[serde(default)]
	live_streaming_details: Option<LiveStreamingDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveStreamingDetails {
	#[serde(default)]
	active_live_chat_id: Option<String>,
	#[serde(default)]
	actual_start_time: Option<String>,
	#[serde(default)]
	actual_end_time: Option<String>,
	#[serde(default)]
	concurrent_viewers: Option<String>,
}

impl Video {
	/// A video is live while it has an active chat and no end time.
	fn into_live_handle(self) -> Option<LiveHandle> {
		let details = self.live_streaming_details?;
		if details.actual_end_time.is_some() {
			return None;
		}
		let chat_id = details.active_live_chat_id?;
		let mut handle = LiveHandle::new(self.id);
		handle.chat_id = Some(chat_id);
		handle.started_at_ms = rfc3339_ms(details.actual_start_time.as_deref());
		handle.viewer_count = details.concurrent_viewers.and_then(|v| v.parse().ok());
		Some(handle)
	}
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatPage {
	#[serde(default)]
	next_page_token: Option<String>,
	#[serde(default)]
	polling_interval_millis: Option<u64>,
	#[serde(default)]
	offline_at: Option<String>,
	#[serde(default = "Vec::new")]
	items: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatItem {
	id: String,
	snippet: ChatSnippet,
	author_details: AuthorDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatSnippet {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	published_at: Option<String>,
	#[serde(default)]
	display_message: Option<String>,
	#[serde(default)]
	super_chat_details: Option<SuperChatDetails>,
	#[serde(default)]
	new_sponsor_details: Option<NewSponsorDetails>,
	#[serde(default)]
	membership_gifting_details: Option<MembershipGiftingDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuperChatDetails {
	amount_micros: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSponsorDetails {
	#[serde(default)]
	member_level_name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MembershipGiftingDetails {
	gift_memberships_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorDetails {
	channel_id: String,
	display_name: String,
	#[serde(default)]
	is_chat_owner: bool,
	#[serde(default)]
	is_chat_moderator: bool,
	#[serde(default)]
	is_chat_sponsor: bool,
}

impl AuthorDetails {
	fn user(&self) -> UserRef {
		UserRef {
			id: self.channel_id.clone(),
			login: self.display_name.clone(),
			display: Some(self.display_name.clone()),
		}
	}

	fn roles(&self) -> Vec<ChatRole> {
		let mut roles = Vec::new();
		if self.is_chat_owner {
			roles.push(ChatRole::Broadcaster);
		}
		if self.is_chat_moderator {
			roles.push(ChatRole::Moderator);
		}
		if self.is_chat_sponsor {
			roles.push(ChatRole::Subscriber);
		}
		roles
	}
}

fn rfc3339_ms(ts: Option<&str>) -> Option<i64> {
	ts.and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
		.map(|dt| dt.timestamp_millis())
}

/// Split a chat page into messages and viewer events. Unknown item types are skipped.
fn decode_items(items: Vec<serde_json::Value>) -> (Vec<ChatMessage>, Vec<PlatformEvent>) {
	let mut messages = Vec::new();
	let mut events = Vec::new();

	for raw in items {
		let item: ChatItem = match serde_json::from_value(raw.clone()) {
			Ok(item) => item,
			Err(e) => {
				debug!(error = %e, "skipping undecodable youtube chat item");
				continue;
			}
		};
		let at_ms = rfc3339_ms(item.snippet.published_at.as_deref()).unwrap_or_default();
		let user = item.author_details.user();

		let kind = match item.snippet.kind.as_str() {
			"textMessageEvent" => {
				let Some(text) = item.snippet.display_message.clone() else {
					continue;
				};
				let mut msg = ChatMessage::new(item.id, user, text).with_roles(item.author_details.roles());
				msg.sent_at_ms = Some(at_ms);
				messages.push(msg);
				continue;
			}
			"newSponsorEvent" => PlatformEventKind::Subscribe {
				tier: item
					.snippet
					.new_sponsor_details
					.and_then(|d| d.member_level_name)
					.unwrap_or_else(|| "1000".to_string()),
				is_prime: false,
				is_gift: false,
			},
			"giftMembershipReceivedEvent" => PlatformEventKind::Subscribe {
				tier: "1000".to_string(),
				is_prime: false,
				is_gift: true,
			},
			"membershipGiftingEvent" => PlatformEventKind::GiftSubs {
				count: item
					.snippet
					.membership_gifting_details
					.map(|d| d.gift_memberships_count)
					.unwrap_or(1),
				tier: "1000".to_string(),
			},
			"superChatEvent" => {
				// Cents map to the bits scale used by cheer rules.
				let micros = item
					.snippet
					.super_chat_details
					.and_then(|d| d.amount_micros.parse::<u64>().ok())
					.unwrap_or(0);
				PlatformEventKind::Cheer {
					bits: micros / 10_000,
				}
			}
			_ => continue,
		};

		events.push(PlatformEvent {
			event_id: Some(item.id),
			user: Some(user),
			kind,
			occurred_at_ms: at_ms,
			raw,
		});
	}

	(messages, events)
}

/// Polling adapter for YouTube live chat.
pub struct YouTubeAdapter {
	cfg: YouTubeConfig,
	http: reqwest::Client,
	tokens: Arc<TokenProvider>,
	live_by_channel: Mutex<HashMap<ChannelId, LiveHandle>>,
}

impl YouTubeAdapter {
	pub fn new(cfg: YouTubeConfig, tokens: Arc<TokenProvider>) -> anyhow::Result<Self> {
		tokens.ensure_client(Platform::YouTube)?;
		let http = build_http_client("memebot/0.x (youtube)", cfg.request_timeout)?;
		Ok(Self {
			cfg,
			http,
			tokens,
			live_by_channel: Mutex::new(HashMap::new()),
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path)
	}

	/// Live chat ids are only known once a broadcast is seen.
	async fn live_chat_id(&self, target: &ChannelTarget) -> Result<String, PlatformError> {
		let cached = self
			.live_by_channel
			.lock()
			.get(&target.channel_id)
			.and_then(|h| h.chat_id.clone());
		if let Some(chat_id) = cached {
			return Ok(chat_id);
		}
		self.check_live(target)
			.await?
			.and_then(|h| h.chat_id)
			.ok_or(PlatformError::NotLive)
	}
}

#[async_trait]
impl ChatPlatform for YouTubeAdapter {
	fn platform(&self) -> Platform {
		Platform::YouTube
	}

	fn ingest_mode(&self) -> IngestMode {
		IngestMode::Poll
	}

	async fn check_live(&self, target: &ChannelTarget) -> Result<Option<LiveHandle>, PlatformError> {
		let token = self.tokens.bearer(&target.read_identity()).await?;
		let req = self
			.http
			.get(self.url("/search"))
			.query(&[
				("part", "id"),
				("channelId", target.platform_channel_id.as_str()),
				("eventType", "live"),
				("type", "video"),
				("maxResults", "1"),
			])
			.bearer_auth(token.token.expose());
		let search: ListResponse<SearchItem> = send_for_json(req, "youtube GET search").await?;

		let video_id = search.items.into_iter().find_map(|i| i.id.video_id);
		let handle = match video_id {
			None => None,
			Some(video_id) => {
				let req = self
					.http
					.get(self.url("/videos"))
					.query(&[("part", "liveStreamingDetails"), ("id", video_id.as_str())])
					.bearer_auth(token.token.expose());
				let videos: ListResponse<Video> = send_for_json(req, "youtube GET videos").await?;
				videos.items.into_iter().find_map(Video::into_live_handle)
			}
		};

		let mut guard = self.live_by_channel.lock();
		match &handle {
			Some(h) => {
				guard.insert(target.channel_id.clone(), h.clone());
			}
			None => {
				guard.remove(&target.channel_id);
			}
		}
		Ok(handle)
	}

	async fn list_new_messages(
		&self,
		target: &ChannelTarget,
		live: &LiveHandle,
		cursor: Option<&str>,
	) -> Result<MessagePage, PlatformError> {
		let Some(chat_id) = live.chat_id.as_deref() else {
			return Err(PlatformError::NotLive);
		};
		let token = self.tokens.bearer(&target.read_identity()).await?;
		let page_size = self.cfg.page_size.to_string();
		let mut query = vec![
			("liveChatId", chat_id),
			("part", "id,snippet,authorDetails"),
			("maxResults", page_size.as_str()),
		];
		if let Some(c) = cursor {
			query.push(("pageToken", c));
		}

		let req = self
			.http
			.get(self.url("/liveChat/messages"))
			.query(&query)
			.bearer_auth(token.token.expose());
		let resp = send_with_retry(req, "youtube GET liveChat/messages").await?;
		let status = resp.status();
		let headers = resp.headers().clone();
		let body = resp.text().await.context("youtube liveChat/messages read body")?;

		if !status.is_success() {
			// Ended or disabled chats answer 403 liveChatEnded / 404 liveChatNotFound.
			if status == StatusCode::NOT_FOUND || body.contains("liveChatEnded") || body.contains("liveChatDisabled") {
				self.live_by_channel.lock().remove(&target.channel_id);
				return Err(PlatformError::NotLive);
			}
			return Err(error_for_status("youtube GET liveChat/messages", status, &headers, &body));
		}

		let page: ChatPage = serde_json::from_str(&body).context("youtube liveChat/messages parse json")?;
		if page.offline_at.is_some() {
			debug!(channel_id = %target.channel_id, "youtube chat reports offlineAt");
		}
		let (messages, events) = decode_items(page.items);
		Ok(MessagePage {
			messages,
			events,
			next_cursor: page.next_page_token.or_else(|| cursor.map(str::to_string)),
			poll_interval: page.polling_interval_millis.map(Duration::from_millis),
		})
	}

	async fn send_message(&self, target: &ChannelTarget, text: &str) -> Result<(), PlatformError> {
		let chat_id = self.live_chat_id(target).await?;
		let token = self.tokens.bearer(&target.bot_identity()).await?;
		let body = serde_json::json!({
			"snippet": {
				"liveChatId": chat_id,
				"type": "textMessageEvent",
				"textMessageDetails": { "messageText": text },
			}
		});
		let req = self
			.http
			.post(self.url("/liveChat/messages"))
			.query(&[("part", "snippet")])
			.bearer_auth(token.token.expose())
			.json(&body);
		let resp = send_with_retry(req, "youtube POST liveChat/messages").await?;
		let status = resp.status();
		if status.is_success() {
			return Ok(());
		}
		let headers = resp.headers().clone();
		let body = resp.text().await.unwrap_or_default();
		if body.contains("rateLimitExceeded") {
			return Err(PlatformError::RateLimited { retry_after: None });
		}
		if body.contains("liveChatEnded") || status == StatusCode::NOT_FOUND {
			self.live_by_channel.lock().remove(&target.channel_id);
			return Err(PlatformError::NotLive);
		}
		let err = error_for_status("youtube POST liveChat/messages", status, &headers, &body);
		if err.is_auth() {
			warn!(channel_id = %target.channel_id, "youtube rejected bot credentials");
			self.tokens.invalidate(&target.bot_identity());
		}
		Err(err)
	}

	async fn forget_channel(&self, channel_id: &ChannelId) {
		self.live_by_channel.lock().remove(channel_id);
	}
}
