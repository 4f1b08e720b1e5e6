#![forbid(unsafe_code)]

//! Stream sessions in the key/value store. A session survives short breaks so per-stream
//! counters are not reset when a stream briefly drops.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use memebot_domain::{ChannelId, Platform, SessionId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::kv::{KeySpace, KvStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSession {
	pub session_id: SessionId,
	pub started_at_ms: i64,
	#[serde(default)]
	pub offline_since_ms: Option<i64>,
}

#[derive(Clone)]
pub struct StreamSessions {
	kv: Arc<dyn KvStore>,
	keys: KeySpace,
	platform: Platform,
	break_credit: Duration,
	ttl: Duration,
}

impl StreamSessions {
	pub fn new(kv: Arc<dyn KvStore>, keys: KeySpace, platform: Platform, break_credit: Duration) -> Self {
		Self {
			kv,
			keys,
			platform,
			break_credit,
			ttl: Duration::from_secs(7 * 86_400),
		}
	}

	pub async fn current(&self, channel_id: &ChannelId) -> anyhow::Result<Option<StreamSession>> {
		let key = self.keys.stream_session(self.platform, channel_id);
		let Some(raw) = self.kv.get(&key).await? else {
			return Ok(None);
		};
		Ok(serde_json::from_str(&raw).ok())
	}

	async fn save(&self, channel_id: &ChannelId, session: &StreamSession) -> anyhow::Result<()> {
		let key = self.keys.stream_session(self.platform, channel_id);
		let raw = serde_json::to_string(session).context("encode stream session")?;
		self.kv.set(&key, &raw, Some(self.ttl)).await
	}

	/// Record "stream online". Resumes the previous session inside the break-credit window.
	pub async fn online(
		&self,
		channel_id: &ChannelId,
		started_at_ms: Option<i64>,
		now_ms: i64,
	) -> anyhow::Result<StreamSession> {
		let previous = self.current(channel_id).await?;
		let break_ms = self.break_credit.as_millis() as i64;

		let session = match previous {
			Some(prev) if prev.offline_since_ms.is_none_or(|off| now_ms - off < break_ms) => {
				debug!(channel_id = %channel_id, session_id = %prev.session_id, "resuming stream session");
				StreamSession {
					offline_since_ms: None,
					..prev
				}
			}
			_ => {
				let session = StreamSession {
					session_id: SessionId::new_v4(),
					started_at_ms: started_at_ms.unwrap_or(now_ms),
					offline_since_ms: None,
				};
				info!(channel_id = %channel_id, platform = %self.platform, session_id = %session.session_id, "stream session started");
				metrics::counter!("memebot_stream_sessions_started_total", "platform" => self.platform.as_str()).increment(1);
				session
			}
		};
		self.save(channel_id, &session).await?;
		Ok(session)
	}

	/// Record "stream offline"; the session stays resumable for the break-credit window.
	pub async fn offline(&self, channel_id: &ChannelId, now_ms: i64) -> anyhow::Result<()> {
		let Some(mut session) = self.current(channel_id).await? else {
			return Ok(());
		};
		if session.offline_since_ms.is_none() {
			session.offline_since_ms = Some(now_ms);
			self.save(channel_id, &session).await?;
			info!(channel_id = %channel_id, platform = %self.platform, session_id = %session.session_id, "stream went offline");
		}
		Ok(())
	}
}
