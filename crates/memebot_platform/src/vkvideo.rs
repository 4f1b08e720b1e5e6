#![forbid(unsafe_code)]

//! VK Video Live developer API. Chat is read by polling with an `after` message id cursor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use memebot_domain::Platform;
use serde::Deserialize;
use tracing::warn;

use crate::http::{DEFAULT_REQUEST_TIMEOUT, build_http_client, error_for_status, send_for_json, send_with_retry};
use crate::{
	ChannelTarget, ChatMessage, ChatPlatform, ChatRole, IngestMode, LiveHandle, MessagePage, PlatformError, TokenProvider,
	UserRef,
};

#[derive(Debug, Clone)]
pub struct VkVideoConfig {
	pub base_url: String,
	pub request_timeout: Duration,
	pub poll_interval: Duration,
}

impl Default for VkVideoConfig {
	fn default() -> Self {
		Self {
			base_url: "https://apidev.live.vkvideo.ru".to_string(),
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			poll_interval: Duration::from_secs(2),
		}
	}
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
	data: T,
}

#[derive(Debug, Deserialize)]
struct ChannelData {
	#[serde(default)]
	stream: Option<VkStream>,
}

#[derive(Debug, Deserialize)]
struct VkStream {
	id: String,
	#[serde(default)]
	status: Option<String>,
	#[serde(default)]
	started_at: Option<i64>,
	#[serde(default)]
	counters: Option<VkCounters>,
}

#[derive(Debug, Deserialize)]
struct VkCounters {
	#[serde(default)]
	viewers: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ChatData {
	#[serde(default = "Vec::new")]
	chat_messages: Vec<VkChatMessage>,
}

#[derive(Debug, Deserialize)]
struct VkChatMessage {
	id: u64,
	author: VkAuthor,
	#[serde(default = "Vec::new")]
	parts: Vec<VkPart>,
	#[serde(default)]
	created_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct VkAuthor {
	id: u64,
	nick: String,
	#[serde(default)]
	is_owner: bool,
	#[serde(default)]
	is_moderator: bool,
	#[serde(default)]
	is_subscriber: bool,
}

#[derive(Debug, Deserialize)]
struct VkPart {
	#[serde(default)]
	text: Option<VkText>,
	#[serde(default)]
	mention: Option<VkMention>,
	#[serde(default)]
	link: Option<VkText>,
}

#[derive(Debug, Deserialize)]
struct VkText {
	content: String,
}

#[derive(Debug, Deserialize)]
struct VkMention {
	nick: String,
}

#[derive(Debug, Deserialize)]
struct ChannelUserData {
	user: VkChannelUser,
}

#[derive(Debug, Deserialize)]
struct VkChannelUser {
	#[serde(default = "Vec::new")]
	roles: Vec<VkRole>,
}

#[derive(Debug, Deserialize)]
struct VkRole {
	id: serde_json::Value,
}

impl VkRole {
	fn id_string(&self) -> Option<String> {
		match &self.id {
			serde_json::Value::String(s) => Some(s.clone()),
			serde_json::Value::Number(n) => Some(n.to_string()),
			_ => None,
		}
	}
}

impl VkChatMessage {
	fn text(&self) -> String {
		let mut out = String::new();
		for part in &self.parts {
			if let Some(t) = &part.text {
				out.push_str(&t.content);
			} else if let Some(m) = &part.mention {
				out.push('@');
				out.push_str(&m.nick);
			} else if let Some(l) = &part.link {
				out.push_str(&l.content);
			}
		}
		out
	}

	fn into_chat(self) -> Option<ChatMessage> {
		let text = self.text();
		if text.trim().is_empty() {
			return None;
		}
		let mut roles = Vec::new();
		if self.author.is_owner {
			roles.push(ChatRole::Broadcaster);
		}
		if self.author.is_moderator {
			roles.push(ChatRole::Moderator);
		}
		if self.author.is_subscriber {
			roles.push(ChatRole::Subscriber);
		}
		let author = UserRef {
			id: self.author.id.to_string(),
			login: self.author.nick.to_lowercase(),
			display: Some(self.author.nick),
		};
		let mut msg = ChatMessage::new(self.id.to_string(), author, text).with_roles(roles);
		msg.sent_at_ms = self.created_at.map(|s| s * 1000);
		Some(msg)
	}
}

/// Order messages by id and move the cursor to the newest one seen.
fn page_from(mut raw: Vec<VkChatMessage>, cursor: Option<&str>, poll_interval: Duration) -> MessagePage {
	raw.sort_by_key(|m| m.id);
	let floor = cursor.and_then(|c| c.parse::<u64>().ok()).unwrap_or(0);
	raw.retain(|m| m.id > floor);
	let next = raw.last().map(|m| m.id.to_string()).or_else(|| cursor.map(str::to_string));
	MessagePage {
		messages: raw.into_iter().filter_map(VkChatMessage::into_chat).collect(),
		events: Vec::new(),
		next_cursor: next,
		poll_interval: Some(poll_interval),
	}
}

pub struct VkVideoAdapter {
	cfg: VkVideoConfig,
	http: reqwest::Client,
	tokens: Arc<TokenProvider>,
}

impl VkVideoAdapter {
	pub fn new(cfg: VkVideoConfig, tokens: Arc<TokenProvider>) -> anyhow::Result<Self> {
		tokens.ensure_client(Platform::VkVideo)?;
		let http = build_http_client("memebot/0.x (vkvideo)", cfg.request_timeout)?;
		Ok(Self { cfg, http, tokens })
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.cfg.base_url.trim_end_matches('/'), path)
	}

	/// Channels are addressed by their public url slug.
	fn channel_url(target: &ChannelTarget) -> &str {
		if target.slug.is_empty() {
			target.platform_channel_id.as_str()
		} else {
			target.slug.as_str()
		}
	}
}

#[async_trait]
impl ChatPlatform for VkVideoAdapter {
	fn platform(&self) -> Platform {
		Platform::VkVideo
	}

	fn ingest_mode(&self) -> IngestMode {
		IngestMode::Poll
	}

	async fn check_live(&self, target: &ChannelTarget) -> Result<Option<LiveHandle>, PlatformError> {
		let token = self.tokens.bearer(&target.read_identity()).await?;
		let req = self
			.http
			.get(self.url("/v1/channel"))
			.query(&[("channel_url", Self::channel_url(target))])
			.bearer_auth(token.token.expose());
		let resp: Envelope<ChannelData> = send_for_json(req, "vkvideo GET channel").await?;

		Ok(resp
			.data
			.stream
			.filter(|s| s.status.as_deref().is_none_or(|st| st.eq_ignore_ascii_case("online")))
			.map(|s| {
				let mut handle = LiveHandle::new(s.id);
				handle.started_at_ms = s.started_at.map(|t| t * 1000);
				handle.viewer_count = s.counters.and_then(|c| c.viewers);
				handle
			}))
	}

	async fn list_new_messages(
		&self,
		target: &ChannelTarget,
		_live: &LiveHandle,
		cursor: Option<&str>,
	) -> Result<MessagePage, PlatformError> {
		let token = self.tokens.bearer(&target.read_identity()).await?;
		let mut query = vec![("channel_url", Self::channel_url(target)), ("limit", "100")];
		if let Some(c) = cursor {
			query.push(("after", c));
		}
		let req = self
			.http
			.get(self.url("/v1/chat/messages"))
			.query(&query)
			.bearer_auth(token.token.expose());
		let resp = send_with_retry(req, "vkvideo GET chat/messages").await?;
		let status = resp.status();
		if status == reqwest::StatusCode::NOT_FOUND {
			return Err(PlatformError::NotLive);
		}
		let headers = resp.headers().clone();
		let body = resp.text().await.map_err(anyhow::Error::from)?;
		if !status.is_success() {
			return Err(error_for_status("vkvideo GET chat/messages", status, &headers, &body));
		}
		let parsed: Envelope<ChatData> = serde_json::from_str(&body).map_err(anyhow::Error::from)?;
		Ok(page_from(parsed.data.chat_messages, cursor, self.cfg.poll_interval))
	}

	async fn send_message(&self, target: &ChannelTarget, text: &str) -> Result<(), PlatformError> {
		let token = self.tokens.bearer(&target.bot_identity()).await?;
		let body = serde_json::json!({
			"parts": [{ "text": { "content": text } }],
		});
		let req = self
			.http
			.post(self.url("/v1/chat/message/send"))
			.query(&[("channel_url", Self::channel_url(target))])
			.bearer_auth(token.token.expose())
			.json(&body);
		let resp = send_with_retry(req, "vkvideo POST chat/message/send").await?;
		let status = resp.status();
		if status.is_success() {
			return Ok(());
		}
		let headers = resp.headers().clone();
		let body = resp.text().await.unwrap_or_default();
		let err = error_for_status("vkvideo POST chat/message/send", status, &headers, &body);
		if err.is_auth() {
			warn!(channel_id = %target.channel_id, "vkvideo rejected bot credentials");
			self.tokens.invalidate(&target.bot_identity());
		}
		Err(err)
	}

	async fn fetch_user_role_ids(&self, target: &ChannelTarget, user_id: &str) -> Result<Vec<String>, PlatformError> {
		let token = self.tokens.bearer(&target.read_identity()).await?;
		let req = self
			.http
			.get(self.url("/v1/channel/user"))
			.query(&[("channel_url", Self::channel_url(target)), ("user_id", user_id)])
			.bearer_auth(token.token.expose());
		let resp: Envelope<ChannelUserData> = send_for_json(req, "vkvideo GET channel/user").await?;
		Ok(resp.data.user.roles.iter().filter_map(VkRole::id_string).collect())
	}
}
