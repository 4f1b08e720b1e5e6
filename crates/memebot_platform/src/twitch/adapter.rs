#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use memebot_domain::{ChannelId, Platform};
use parking_lot::Mutex;
use tracing::{debug, warn};
use url::Url;

use super::eventsub::parse_timestamp_ms;
use super::helix::HelixClient;
use crate::http::DEFAULT_REQUEST_TIMEOUT;
use crate::{ChannelTarget, ChatPlatform, IngestMode, LiveHandle, MessagePage, PlatformError, TokenProvider};

#[derive(Debug, Clone)]
pub struct TwitchConfig {
	pub helix_base_url: String,
	pub request_timeout: Duration,
	pub resolve_cache_ttl: Duration,
}

impl Default for TwitchConfig {
	fn default() -> Self {
		Self {
			helix_base_url: "https://api.twitch.tv".to_string(),
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			resolve_cache_ttl: Duration::from_secs(600),
		}
	}
}

/// Helix-backed adapter. Chat arrives through EventSub webhooks.
pub struct TwitchAdapter {
	cfg: TwitchConfig,
	helix: HelixClient,
	tokens: Arc<TokenProvider>,
	broadcaster_id_by_channel: Mutex<HashMap<ChannelId, (String, Instant)>>,
}

impl TwitchAdapter {
	/// Fails when no Twitch OAuth client is configured.
	pub fn new(cfg: TwitchConfig, tokens: Arc<TokenProvider>) -> anyhow::Result<Self> {
		let client_id = tokens.ensure_client(Platform::Twitch)?.client_id.clone();
		let base = Url::parse(&cfg.helix_base_url).context("parse helix base url")?;
		let helix = HelixClient::new(base, client_id, cfg.request_timeout)?;
		Ok(Self {
			cfg,
			helix,
			tokens,
			broadcaster_id_by_channel: Mutex::new(HashMap::new()),
		})
	}

	/// Subscriptions may store either the numeric broadcaster id or the login.
	async fn resolve_broadcaster_id(&self, target: &ChannelTarget, bearer: &str) -> Result<String, PlatformError> {
		let raw = target.platform_channel_id.as_str();
		if raw.chars().all(|c| c.is_ascii_digit()) {
			return Ok(raw.to_string());
		}

		if let Some((cached, ts)) = self.broadcaster_id_by_channel.lock().get(&target.channel_id)
			&& ts.elapsed() < self.cfg.resolve_cache_ttl
		{
			return Ok(cached.clone());
		}

		let user = self
			.helix
			.get_user_by_login(bearer, raw)
			.await?
			.ok_or_else(|| PlatformError::other(format!("twitch user not found: {raw}")))?;
		debug!(channel_id = %target.channel_id, login = %user.login, broadcaster_id = %user.id, "resolved twitch broadcaster id");
		self.broadcaster_id_by_channel
			.lock()
			.insert(target.channel_id.clone(), (user.id.clone(), Instant::now()));
		Ok(user.id)
	}

	fn on_error(&self, target: &ChannelTarget, err: PlatformError, identity: &crate::TokenIdentity) -> PlatformError {
		if err.is_auth() {
			warn!(channel_id = %target.channel_id, error = %err, "twitch rejected credentials");
			self.tokens.invalidate(identity);
		}
		err
	}
}

#[async_trait]
impl ChatPlatform for TwitchAdapter {
	fn platform(&self) -> Platform {
		Platform::Twitch
	}

	fn ingest_mode(&self) -> IngestMode {
		IngestMode::Push
	}

	async fn check_live(&self, target: &ChannelTarget) -> Result<Option<LiveHandle>, PlatformError> {
		let identity = target.bot_identity();
		let token = self.tokens.bearer(&identity).await?;
		let bearer = token.token.expose();
		let broadcaster_id = self.resolve_broadcaster_id(target, bearer).await?;

		let stream = match self.helix.get_stream(bearer, &broadcaster_id).await {
			Ok(s) => s,
			Err(e) => return Err(self.on_error(target, e, &identity)),
		};

		Ok(stream.map(|s| {
			let mut handle = LiveHandle::new(s.id);
			handle.started_at_ms = s.started_at.as_deref().and_then(|ts| parse_timestamp_ms(ts).ok());
			handle.viewer_count = s.viewer_count;
			handle
		}))
	}

	async fn list_new_messages(
		&self,
		_target: &ChannelTarget,
		_live: &LiveHandle,
		cursor: Option<&str>,
	) -> Result<MessagePage, PlatformError> {
		Ok(MessagePage {
			next_cursor: cursor.map(str::to_string),
			..MessagePage::default()
		})
	}

	async fn send_message(&self, target: &ChannelTarget, text: &str) -> Result<(), PlatformError> {
		let identity = target.bot_identity();
		let token = self.tokens.bearer(&identity).await?;
		let bearer = token.token.expose();
		let broadcaster_id = self.resolve_broadcaster_id(target, bearer).await?;

		let sender_id = target
			.bot
			.platform_user_id
			.clone()
			.or(token.platform_user_id.clone())
			.ok_or_else(|| PlatformError::other("twitch bot user id unknown"))?;

		self.helix
			.send_chat_message(bearer, &broadcaster_id, &sender_id, text)
			.await
			.map_err(|e| self.on_error(target, e, &identity))
	}

	async fn forget_channel(&self, channel_id: &ChannelId) {
		self.broadcaster_id_by_channel.lock().remove(channel_id);
	}
}
