#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use memebot_domain::{ChannelId, Platform, PlatformChannelId};
use memebot_platform::{
	ChannelTarget, ChatMessage, ChatPlatform, IngestMode, LiveHandle, MessagePage, PlatformError, UserRef,
};
use parking_lot::Mutex;
use tracing::{debug, info};

/// A message the adapter was asked to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
	pub channel_id: ChannelId,
	pub platform_channel_id: PlatformChannelId,
	pub text: String,
}

#[derive(Default)]
struct DemoState {
	live: HashMap<PlatformChannelId, LiveHandle>,
	pages: HashMap<PlatformChannelId, VecDeque<MessagePage>>,
	send_errors: VecDeque<PlatformError>,
	sent: Vec<SentMessage>,
	role_ids: HashMap<String, Vec<String>>,
	role_lookups: usize,
	fail_role_lookups: bool,
	forgotten: Vec<ChannelId>,
	generated: u64,
}

/// Scripted adapter used by tests and by dev builds.
///
/// In generating mode every channel reports live and each poll yields one synthetic chat line.
pub struct DemoAdapter {
	platform: Platform,
	mode: IngestMode,
	generate: bool,
	state: Mutex<DemoState>,
}

impl DemoAdapter {
	pub fn new(platform: Platform, mode: IngestMode) -> Self {
		Self {
			platform,
			mode,
			generate: false,
			state: Mutex::new(DemoState::default()),
		}
	}

	/// Always-live adapter emitting a chat line per poll.
	pub fn generating(platform: Platform) -> Self {
		Self {
			generate: true,
			..Self::new(platform, IngestMode::Poll)
		}
	}

	fn make_user(n: u64) -> UserRef {
		UserRef {
			id: format!("demo-user-{}", n % 5),
			login: format!("demo_user_{}", n % 5),
			display: Some("DemoUser".to_string()),
		}
	}
}

#[cfg(test)]
impl DemoAdapter {
	fn key(platform_channel_id: &str) -> PlatformChannelId {
		PlatformChannelId::new(platform_channel_id).expect("platform channel id")
	}

	pub fn set_live(&self, platform_channel_id: &str, handle: Option<LiveHandle>) {
		let mut state = self.state.lock();
		match handle {
			Some(h) => state.live.insert(Self::key(platform_channel_id), h),
			None => state.live.remove(&Self::key(platform_channel_id)),
		};
	}

	pub fn push_page(&self, platform_channel_id: &str, page: MessagePage) {
		self.state
			.lock()
			.pages
			.entry(Self::key(platform_channel_id))
			.or_default()
			.push_back(page);
	}

	pub fn fail_next_send(&self, err: PlatformError) {
		self.state.lock().send_errors.push_back(err);
	}

	pub fn set_role_ids(&self, user_id: &str, ids: &[&str]) {
		self.state
			.lock()
			.role_ids
			.insert(user_id.to_string(), ids.iter().map(|s| s.to_string()).collect());
	}

	pub fn fail_role_lookups(&self, fail: bool) {
		self.state.lock().fail_role_lookups = fail;
	}

	pub fn role_lookups(&self) -> usize {
		self.state.lock().role_lookups
	}

	pub fn sent(&self) -> Vec<SentMessage> {
		self.state.lock().sent.clone()
	}

	pub fn forgotten(&self) -> Vec<ChannelId> {
		self.state.lock().forgotten.clone()
	}
}

#[async_trait]
impl ChatPlatform for DemoAdapter {
	fn platform(&self) -> Platform {
		self.platform
	}

	fn ingest_mode(&self) -> IngestMode {
		self.mode
	}

	async fn check_live(&self, target: &ChannelTarget) -> Result<Option<LiveHandle>, PlatformError> {
		if self.generate {
			return Ok(Some(LiveHandle::new(format!("demo-{}", target.platform_channel_id))));
		}
		Ok(self.state.lock().live.get(&target.platform_channel_id).cloned())
	}

	async fn list_new_messages(
		&self,
		target: &ChannelTarget,
		_live: &LiveHandle,
		cursor: Option<&str>,
	) -> Result<MessagePage, PlatformError> {
		let mut state = self.state.lock();
		if let Some(page) = state
			.pages
			.get_mut(&target.platform_channel_id)
			.and_then(|q| q.pop_front())
		{
			return Ok(page);
		}
		if !self.generate {
			return Ok(MessagePage {
				next_cursor: cursor.map(str::to_string),
				..MessagePage::default()
			});
		}

		state.generated += 1;
		let n = state.generated;
		let text = format!("demo chat message #{n} in {}", target.slug);
		debug!(platform = %self.platform, channel_id = %target.channel_id, n, "demo adapter generated chat");
		Ok(MessagePage {
			messages: vec![ChatMessage::new(format!("demo-{n}"), Self::make_user(n), text)],
			next_cursor: Some(n.to_string()),
			..MessagePage::default()
		})
	}

	async fn send_message(&self, target: &ChannelTarget, text: &str) -> Result<(), PlatformError> {
		let mut state = self.state.lock();
		if let Some(err) = state.send_errors.pop_front() {
			return Err(err);
		}
		if self.generate {
			info!(platform = %self.platform, channel_id = %target.channel_id, %text, "demo adapter sent chat");
			return Ok(());
		}
		state.sent.push(SentMessage {
			channel_id: target.channel_id.clone(),
			platform_channel_id: target.platform_channel_id.clone(),
			text: text.to_string(),
		});
		Ok(())
	}

	async fn fetch_user_role_ids(&self, _target: &ChannelTarget, user_id: &str) -> Result<Vec<String>, PlatformError> {
		let mut state = self.state.lock();
		state.role_lookups += 1;
		if state.fail_role_lookups {
			return Err(PlatformError::other("demo role lookup failure"));
		}
		Ok(state.role_ids.get(user_id).cloned().unwrap_or_default())
	}

	async fn forget_channel(&self, channel_id: &ChannelId) {
		self.state.lock().forgotten.push(channel_id.clone());
	}
}
