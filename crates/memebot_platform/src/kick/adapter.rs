#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use memebot_domain::{ChannelId, Platform};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::client::KickClient;
use crate::http::DEFAULT_REQUEST_TIMEOUT;
use crate::{ChannelTarget, ChatPlatform, IngestMode, LiveHandle, MessagePage, PlatformError, TokenProvider};

#[derive(Debug, Clone)]
pub struct KickConfig {
	pub base_url: String,
	pub request_timeout: Duration,
	pub resolve_cache_ttl: Duration,
}

impl Default for KickConfig {
	fn default() -> Self {
		Self {
			base_url: "https://api.kick.com".to_string(),
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			resolve_cache_ttl: Duration::from_secs(600),
		}
	}
}

/// Kick public API adapter. Chat arrives through signed webhooks.
pub struct KickAdapter {
	cfg: KickConfig,
	client: KickClient,
	tokens: Arc<TokenProvider>,
	broadcaster_id_by_channel: Mutex<HashMap<ChannelId, (u64, Instant)>>,
}

impl KickAdapter {
	pub fn new(cfg: KickConfig, tokens: Arc<TokenProvider>) -> anyhow::Result<Self> {
		tokens.ensure_client(Platform::Kick)?;
		let client = KickClient::new(cfg.base_url.clone(), cfg.request_timeout)?;
		Ok(Self {
			cfg,
			client,
			tokens,
			broadcaster_id_by_channel: Mutex::new(HashMap::new()),
		})
	}

	async fn resolve_broadcaster_id(&self, target: &ChannelTarget, access_token: &str) -> Result<u64, PlatformError> {
		let raw = target.platform_channel_id.as_str();
		if let Ok(id) = raw.parse::<u64>() {
			return Ok(id);
		}

		if let Some((cached, ts)) = self.broadcaster_id_by_channel.lock().get(&target.channel_id)
			&& ts.elapsed() < self.cfg.resolve_cache_ttl
		{
			return Ok(*cached);
		}

		let slug = if target.slug.is_empty() { raw } else { target.slug.as_str() };
		let Some(id) = self.client.resolve_broadcaster_id(access_token, slug).await? else {
			return Err(PlatformError::other(format!("kick channel not found: {slug}")));
		};
		debug!(channel_id = %target.channel_id, slug, broadcaster_id = id, "resolved kick broadcaster id");
		self.broadcaster_id_by_channel
			.lock()
			.insert(target.channel_id.clone(), (id, Instant::now()));
		Ok(id)
	}

	fn on_error(&self, target: &ChannelTarget, err: PlatformError) -> PlatformError {
		if err.is_auth() {
			warn!(channel_id = %target.channel_id, error = %err, "kick rejected credentials");
			self.tokens.invalidate(&target.bot_identity());
		}
		err
	}
}

#[async_trait]
impl ChatPlatform for KickAdapter {
	fn platform(&self) -> Platform {
		Platform::Kick
	}

	fn ingest_mode(&self) -> IngestMode {
		IngestMode::Push
	}

	async fn check_live(&self, target: &ChannelTarget) -> Result<Option<LiveHandle>, PlatformError> {
		let token = self.tokens.bearer(&target.bot_identity()).await?;
		let broadcaster_id = self.resolve_broadcaster_id(target, token.token.expose()).await?;
		let stream = self
			.client
			.get_livestream(token.token.expose(), broadcaster_id)
			.await
			.map_err(|e| self.on_error(target, e))?;

		Ok(stream.map(|s| {
			// Kick exposes no stream id; the start time identifies a broadcast.
			let id = s.started_at.clone().unwrap_or_else(|| format!("live-{broadcaster_id}"));
			let mut handle = LiveHandle::new(id);
			handle.started_at_ms = s
				.started_at
				.as_deref()
				.and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
				.map(|dt| dt.timestamp_millis());
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
		let token = self.tokens.bearer(&target.bot_identity()).await?;
		let broadcaster_id = self.resolve_broadcaster_id(target, token.token.expose()).await?;
		self.client
			.send_chat_message(token.token.expose(), broadcaster_id, text)
			.await
			.map_err(|e| self.on_error(target, e))
	}

	async fn forget_channel(&self, channel_id: &ChannelId) {
		self.broadcaster_id_by_channel.lock().remove(channel_id);
	}
}
