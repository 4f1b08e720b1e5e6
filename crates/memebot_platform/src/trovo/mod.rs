#![forbid(unsafe_code)]

//! Trovo open platform. Liveness and sending over REST; chat is read from a
//! per-channel websocket whose frames are buffered and drained by `list_new_messages`.

pub mod chat;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use memebot_domain::{ChannelId, Platform};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{info, warn};

use self::chat::{BufferedItem, ChatConnectInfo, ChatSocket, ChatTokenSource};
use crate::http::{DEFAULT_REQUEST_TIMEOUT, build_http_client, error_for_status, send_for_json, send_with_retry};
use crate::{ChannelTarget, ChatPlatform, IngestMode, LiveHandle, MessagePage, PlatformError, TokenProvider};

#[derive(Debug, Clone)]
pub struct TrovoConfig {
	pub base_url: String,
	pub chat_ws_url: String,
	pub request_timeout: Duration,
	pub buffer_capacity: usize,
	pub ping_interval: Duration,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
}

impl Default for TrovoConfig {
	fn default() -> Self {
		Self {
			base_url: "https://open-api.trovo.live".to_string(),
			chat_ws_url: "wss://open-chat.trovo.live/chat".to_string(),
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			buffer_capacity: 500,
			ping_interval: Duration::from_secs(30),
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
		}
	}
}

#[derive(Debug, Deserialize)]
struct ChannelInfo {
	#[serde(default)]
	is_live: bool,
	#[serde(default)]
	channel_id: Option<String>,
	#[serde(default)]
	current_viewers: Option<u64>,
	#[serde(default)]
	started_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatTokenResponse {
	token: String,
}

/// REST client shared between the adapter and chat socket tasks.
#[derive(Clone)]
struct TrovoRest {
	base_url: String,
	client_id: String,
	http: reqwest::Client,
}

impl TrovoRest {
	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url.trim_end_matches('/'), path)
	}
}

#[async_trait]
impl ChatTokenSource for TrovoRest {
	async fn chat_token(&self, channel_id: &str) -> anyhow::Result<String> {
		let req = self
			.http
			.get(self.url(&format!("/openplatform/chat/channel-token/{}", urlencoding::encode(channel_id))))
			.header("Accept", "application/json")
			.header("Client-ID", &self.client_id);
		let resp: ChatTokenResponse = send_for_json(req, "trovo GET chat/channel-token").await?;
		Ok(resp.token)
	}
}

fn live_handle(info: ChannelInfo, fallback_channel: &str) -> Option<LiveHandle> {
	if !info.is_live {
		return None;
	}
	let channel = info.channel_id.as_deref().unwrap_or(fallback_channel);
	let started_secs = info.started_at.as_deref().and_then(|s| s.parse::<i64>().ok());
	let id = match started_secs {
		Some(s) => format!("{channel}-{s}"),
		None => format!("{channel}-live"),
	};
	let mut handle = LiveHandle::new(id);
	handle.started_at_ms = started_secs.map(|s| s * 1000);
	handle.viewer_count = info.current_viewers;
	Some(handle)
}

pub struct TrovoAdapter {
	cfg: TrovoConfig,
	rest: TrovoRest,
	tokens: Arc<TokenProvider>,
	sockets: Mutex<HashMap<ChannelId, ChatSocket>>,
}

impl TrovoAdapter {
	pub fn new(cfg: TrovoConfig, tokens: Arc<TokenProvider>) -> anyhow::Result<Self> {
		let client_id = tokens.ensure_client(Platform::Trovo)?.client_id.clone();
		let http = build_http_client("memebot/0.x (trovo)", cfg.request_timeout)?;
		Ok(Self {
			rest: TrovoRest {
				base_url: cfg.base_url.clone(),
				client_id,
				http,
			},
			cfg,
			tokens,
			sockets: Mutex::new(HashMap::new()),
		})
	}

	fn connect_info(&self) -> ChatConnectInfo {
		ChatConnectInfo {
			ws_url: self.cfg.chat_ws_url.clone(),
			ping_interval: self.cfg.ping_interval,
			reconnect_min_delay: self.cfg.reconnect_min_delay,
			reconnect_max_delay: self.cfg.reconnect_max_delay,
			token_source: Arc::new(self.rest.clone()),
		}
	}

	/// Drain the channel's buffer past `cursor`, starting its socket when needed.
	fn drain(&self, target: &ChannelTarget, cursor: Option<&str>) -> MessagePage {
		let platform_channel_id = target.platform_channel_id.as_str();
		let mut sockets = self.sockets.lock();
		let restart = sockets
			.get(&target.channel_id)
			.is_none_or(|s| s.platform_channel_id != platform_channel_id);
		if restart {
			info!(channel_id = %target.channel_id, platform_channel_id, "starting trovo chat socket");
			sockets.insert(
				target.channel_id.clone(),
				ChatSocket::spawn(platform_channel_id.to_string(), self.cfg.buffer_capacity, self.connect_info()),
			);
		}
		let Some(socket) = sockets.get(&target.channel_id) else {
			return MessagePage::default();
		};

		let (items, head) = socket.buffer.lock().since(cursor.and_then(|c| c.parse().ok()));
		let mut page = MessagePage {
			next_cursor: head.map(|h| h.to_string()).or_else(|| cursor.map(str::to_string)),
			..MessagePage::default()
		};
		for item in items {
			match item {
				BufferedItem::Chat(m) => page.messages.push(m),
				BufferedItem::Event(e) => page.events.push(e),
			}
		}
		page
	}
}

#[async_trait]
impl ChatPlatform for TrovoAdapter {
	fn platform(&self) -> Platform {
		Platform::Trovo
	}

	fn ingest_mode(&self) -> IngestMode {
		IngestMode::Poll
	}

	async fn check_live(&self, target: &ChannelTarget) -> Result<Option<LiveHandle>, PlatformError> {
		let body = serde_json::json!({ "channel_id": target.platform_channel_id.as_str() });
		let req = self
			.rest
			.http
			.post(self.rest.url("/openplatform/channels/id"))
			.header("Accept", "application/json")
			.header("Client-ID", &self.rest.client_id)
			.json(&body);
		let info: ChannelInfo = send_for_json(req, "trovo POST channels/id").await?;
		Ok(live_handle(info, target.platform_channel_id.as_str()))
	}

	async fn list_new_messages(
		&self,
		target: &ChannelTarget,
		_live: &LiveHandle,
		cursor: Option<&str>,
	) -> Result<MessagePage, PlatformError> {
		Ok(self.drain(target, cursor))
	}

	async fn send_message(&self, target: &ChannelTarget, text: &str) -> Result<(), PlatformError> {
		let identity = target.bot_identity();
		let token = self.tokens.bearer(&identity).await?;
		let body = serde_json::json!({
			"content": text,
			"channel_id": target.platform_channel_id.as_str(),
		});
		let req = self
			.rest
			.http
			.post(self.rest.url("/openplatform/chat/send"))
			.header("Accept", "application/json")
			.header("Client-ID", &self.rest.client_id)
			.header("Authorization", format!("OAuth {}", token.token.expose()))
			.json(&body);
		let resp = send_with_retry(req, "trovo POST chat/send").await?;
		let status = resp.status();
		if status.is_success() {
			return Ok(());
		}
		let headers = resp.headers().clone();
		let body = resp.text().await.unwrap_or_default();
		let err = error_for_status("trovo POST chat/send", status, &headers, &body);
		if err.is_auth() {
			warn!(channel_id = %target.channel_id, "trovo rejected bot credentials");
			self.tokens.invalidate(&identity);
		}
		Err(err)
	}

	async fn forget_channel(&self, channel_id: &ChannelId) {
		if self.sockets.lock().remove(channel_id).is_some() {
			info!(channel_id = %channel_id, "stopped trovo chat socket");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn live_handle_is_keyed_by_start_time() {
		let info: ChannelInfo = serde_json::from_value(serde_json::json!({
			"is_live": true,
			"channel_id": "100",
			"current_viewers": 12,
			"started_at": "1700000000",
		}))
		.unwrap();
		let handle = live_handle(info, "ignored").unwrap();
		assert_eq!(handle.id, "100-1700000000");
		assert_eq!(handle.started_at_ms, Some(1_700_000_000_000));
		assert_eq!(handle.viewer_count, Some(12));
	}

	#[test]
	fn offline_channels_have_no_handle() {
		let info: ChannelInfo = serde_json::from_value(serde_json::json!({ "is_live": false })).unwrap();
		assert!(live_handle(info, "100").is_none());
	}
}
