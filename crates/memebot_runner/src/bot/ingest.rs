#![forbid(unsafe_code)]

//! Per-channel live tracking and chat ingestion. One tick runs at a time per channel; busy channels
//! are skipped by the scheduler and picked up on the next tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use memebot_domain::Platform;
use memebot_platform::{
	ChatMessage, ChatPlatform, IngestMode, LiveHandle, PlatformError, PlatformEvent, PushEvent, PushEventKind,
	validate_chat_message,
};
use tracing::{debug, info, warn};

use super::channel_state::{ChannelMap, ChannelSlot, ChannelState};
use super::commands::CommandMatcher;
use super::credits::CreditsReporter;
use super::outbox::Outbox;
use super::rewards::RewardProcessor;
use super::sessions::StreamSessions;
use crate::config::RunnerSettings;
use crate::store::Store;
use crate::util::time::unix_ms_now;

const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct Ingestor {
	adapter: Arc<dyn ChatPlatform>,
	platform: Platform,
	store: Store,
	outbox: Arc<Outbox>,
	rewards: Arc<RewardProcessor>,
	sessions: StreamSessions,
	credits: CreditsReporter,
	matcher: CommandMatcher,
	settings: RunnerSettings,
}

impl Ingestor {
	pub fn new(
		adapter: Arc<dyn ChatPlatform>,
		store: Store,
		outbox: Arc<Outbox>,
		rewards: Arc<RewardProcessor>,
		sessions: StreamSessions,
		credits: CreditsReporter,
		settings: RunnerSettings,
	) -> Self {
		Self {
			platform: adapter.platform(),
			matcher: CommandMatcher::new(adapter.clone()),
			adapter,
			store,
			outbox,
			rewards,
			sessions,
			credits,
			settings,
		}
	}

	/// Drop per-channel caches of channels that left this runner.
	pub fn prune_caches(&self, channels: &ChannelMap) {
		self.matcher.prune_role_cache(channels);
	}

	/// One scheduler pass over a channel.
	pub async fn tick(&self, slot: &ChannelSlot) {
		let Ok(mut state) = slot.try_lock() else {
			metrics::counter!("memebot_ticks_skipped_total", "platform" => self.platform.as_str()).increment(1);
			return;
		};

		self.refresh_config_if_stale(&mut state).await;
		self.check_live_if_due(&mut state).await;

		if !state.is_live() || self.adapter.ingest_mode() == IngestMode::Push {
			return;
		}
		let min_interval = MIN_POLL_INTERVAL.max(state.poll_interval_hint.unwrap_or_default());
		if let Some(at) = state.last_poll_at
			&& at.elapsed() < min_interval
		{
			return;
		}
		self.poll(&mut state).await;
	}

	/// Webhook delivery. Waits for the channel instead of skipping it.
	pub async fn handle_push(&self, channels: &ChannelMap, push: PushEvent) {
		if push.platform != self.platform {
			debug!(platform = %push.platform, "push event for another platform dropped");
			return;
		}
		let Some(slot) = channels.find_by_platform_channel(&push.platform_channel_id) else {
			debug!(platform_channel_id = %push.platform_channel_id, "push event for unknown channel dropped");
			metrics::counter!("memebot_push_unrouted_total", "platform" => self.platform.as_str()).increment(1);
			return;
		};

		let mut state = slot.lock().await;
		self.refresh_config_if_stale(&mut state).await;
		let now = unix_ms_now();
		match push.kind {
			PushEventKind::Chat(msg) => self.handle_chat(&state, &msg, now).await,
			PushEventKind::Event(ev) => self.handle_event(&state, &ev, now).await,
			PushEventKind::StreamOnline(handle) => {
				self.apply_live(&mut state, Some(handle), now).await;
				state.last_live_check_at = Some(Instant::now());
			}
			PushEventKind::StreamOffline => {
				self.apply_live(&mut state, None, now).await;
				state.last_live_check_at = Some(Instant::now());
			}
		}
	}

	async fn refresh_config_if_stale(&self, state: &mut ChannelState) {
		if state.config_is_stale(self.settings.commands_refresh_interval) {
			self.refresh_config(state).await;
		}
	}

	pub async fn refresh_config(&self, state: &mut ChannelState) {
		if let Err(e) = state.reload_config(&self.store).await {
			warn!(channel_id = %state.target.channel_id, error = %e, "config refresh failed; keeping cached config");
			metrics::counter!("memebot_config_refresh_failures_total", "platform" => self.platform.as_str()).increment(1);
		}
	}

	async fn check_live_if_due(&self, state: &mut ChannelState) {
		if let Some(at) = state.last_live_check_at
			&& at.elapsed() < self.settings.live_check_interval
		{
			return;
		}
		state.last_live_check_at = Some(Instant::now());

		match self.adapter.check_live(&state.target).await {
			Ok(handle) => self.apply_live(state, handle, unix_ms_now()).await,
			Err(e) => {
				warn!(
					channel_id = %state.target.channel_id,
					platform = %self.platform,
					class = e.class(),
					error = %e,
					"live check failed"
				);
				metrics::counter!("memebot_live_check_failures_total", "platform" => self.platform.as_str(), "class" => e.class())
					.increment(1);
			}
		}
	}

	/// Drive the OFFLINE/LIVE state machine. A different handle is a restart: offline, then online.
	async fn apply_live(&self, state: &mut ChannelState, handle: Option<LiveHandle>, now_ms: i64) {
		let current_id = state.live.as_ref().map(|l| l.id.clone());
		match (current_id, handle) {
			(None, None) => {}
			(Some(current), Some(next)) if current == next.id => state.live = Some(next),
			(Some(_), Some(next)) => {
				self.go_offline(state, now_ms).await;
				self.go_online(state, next, now_ms).await;
			}
			(None, Some(next)) => self.go_online(state, next, now_ms).await,
			(Some(_), None) => self.go_offline(state, now_ms).await,
		}
	}

	async fn go_online(&self, state: &mut ChannelState, handle: LiveHandle, now_ms: i64) {
		let channel_id = state.target.channel_id.clone();
		match self.sessions.online(&channel_id, handle.started_at_ms, now_ms).await {
			Ok(session) => {
				state.session = Some(session.session_id);
				state.session_started_at_ms = Some(session.started_at_ms);
			}
			Err(e) => {
				warn!(channel_id = %channel_id, error = %e, "failed to record stream online");
				state.session = None;
				state.session_started_at_ms = None;
			}
		}
		info!(channel_id = %channel_id, platform = %self.platform, live_id = %handle.id, "channel is live");
		metrics::counter!("memebot_live_transitions_total", "platform" => self.platform.as_str(), "to" => "online")
			.increment(1);

		state.live = Some(handle);
		state.cursor = None;
		state.first_poll_after_reconnect = true;
		state.last_poll_at = None;
		state.poll_interval_hint = None;
	}

	async fn go_offline(&self, state: &mut ChannelState, now_ms: i64) {
		let channel_id = state.target.channel_id.clone();
		if let Err(e) = self.sessions.offline(&channel_id, now_ms).await {
			warn!(channel_id = %channel_id, error = %e, "failed to record stream offline");
		}
		info!(channel_id = %channel_id, platform = %self.platform, "channel went offline");
		metrics::counter!("memebot_live_transitions_total", "platform" => self.platform.as_str(), "to" => "offline")
			.increment(1);

		state.live = None;
		state.first_poll_after_reconnect = true;
	}

	async fn poll(&self, state: &mut ChannelState) {
		let Some(live) = state.live.clone() else {
			return;
		};
		state.last_poll_at = Some(Instant::now());

		let page = match self
			.adapter
			.list_new_messages(&state.target, &live, state.cursor.as_deref())
			.await
		{
			Ok(page) => page,
			Err(PlatformError::NotLive) => {
				debug!(channel_id = %state.target.channel_id, "chat reports stream ended");
				self.apply_live(state, None, unix_ms_now()).await;
				return;
			}
			Err(PlatformError::RateLimited { retry_after }) => {
				state.poll_interval_hint = retry_after;
				debug!(channel_id = %state.target.channel_id, ?retry_after, "chat poll rate limited");
				return;
			}
			Err(e) => {
				warn!(channel_id = %state.target.channel_id, class = e.class(), error = %e, "chat poll failed");
				metrics::counter!("memebot_poll_failures_total", "platform" => self.platform.as_str(), "class" => e.class())
					.increment(1);
				return;
			}
		};

		state.poll_interval_hint = page.poll_interval;
		if page.next_cursor.is_some() {
			state.cursor = page.next_cursor;
		}
		if state.first_poll_after_reconnect {
			state.first_poll_after_reconnect = false;
			debug!(
				channel_id = %state.target.channel_id,
				discarded = page.messages.len() + page.events.len(),
				"first poll after reconnect; backlog discarded"
			);
			return;
		}

		let now = unix_ms_now();
		for msg in &page.messages {
			self.handle_chat(state, msg, now).await;
		}
		for ev in &page.events {
			self.handle_event(state, ev, now).await;
		}
	}

	fn is_own_message(state: &ChannelState, msg: &ChatMessage) -> bool {
		let bot = &state.target.bot;
		bot.platform_user_id.as_deref() == Some(msg.author.id.as_str())
			|| bot
				.login
				.as_deref()
				.is_some_and(|login| login.eq_ignore_ascii_case(&msg.author.login))
	}

	async fn handle_chat(&self, state: &ChannelState, msg: &ChatMessage, now_ms: i64) {
		if let Err(e) = validate_chat_message(msg) {
			debug!(channel_id = %state.target.channel_id, error = %e, "invalid chat message dropped");
			return;
		}
		if Self::is_own_message(state, msg) {
			return;
		}
		metrics::counter!("memebot_chat_messages_total", "platform" => self.platform.as_str()).increment(1);

		if let Err(e) = self.rewards.on_chat(state, msg, now_ms).await {
			warn!(channel_id = %state.target.channel_id, user_id = %msg.author.id, error = %e, "chat reward failed");
		}

		self.credits
			.chatter_seen(self.platform, &state.target.channel_id, &msg.author, msg.sent_at_ms.unwrap_or(now_ms));

		let Some(reply) = self.matcher.reply_for(state, msg, now_ms).await else {
			return;
		};
		match self.outbox.enqueue(&state.target, &reply).await {
			Ok(id) => debug!(channel_id = %state.target.channel_id, outbox_id = %id, "command reply queued"),
			Err(e) => warn!(channel_id = %state.target.channel_id, error = %e, "failed to queue command reply"),
		}
	}

	async fn handle_event(&self, state: &ChannelState, ev: &PlatformEvent, now_ms: i64) {
		if let Err(e) = self.rewards.on_event(state, ev, now_ms).await {
			warn!(
				channel_id = %state.target.channel_id,
				event_type = ev.kind.as_str(),
				error = %e,
				"event reward failed"
			);
		}
	}
}
