#![forbid(unsafe_code)]

//! Durable reply queue. Delivery is rate limited per channel and globally, serialized per channel
//! through a key/value lock, and retried until `max_attempts`.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use memebot_domain::{ChannelId, OutboxId, Platform};
use memebot_platform::{ChannelTarget, ChatPlatform, PlatformError};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::channel_state::ChannelMap;
use super::commands::normalize;
use crate::config::OutboxSettings;
use crate::kv::{KeySpace, KvStore};
use crate::store::Store;
use crate::store::outbox::{NewOutboxMessage, OutboxRow, OutboxStatus};
use crate::util::time::unix_ms_now;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
	Sent,
	/// Channel busy or over its limit; skip the channel for this pass.
	Deferred,
	/// Global window exhausted; end the pass.
	GlobalLimited,
	/// Another worker claimed the row first.
	Lost,
	Retry,
	Failed,
}

/// Counters of one delivery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
	pub sent: usize,
	pub retried: usize,
	pub failed: usize,
	pub deferred: usize,
	pub lost: usize,
	pub errors: usize,
}

pub struct Outbox {
	store: Store,
	kv: Arc<dyn KvStore>,
	keys: KeySpace,
	platform: Platform,
	settings: OutboxSettings,
}

fn millis(d: std::time::Duration) -> i64 {
	(d.as_millis() as i64).max(1)
}

impl Outbox {
	pub fn new(
		store: Store,
		kv: Arc<dyn KvStore>,
		keys: KeySpace,
		platform: Platform,
		settings: OutboxSettings,
	) -> Self {
		Self {
			store,
			kv,
			keys,
			platform,
			settings,
		}
	}

	/// Queue a reply. The same normalized text for the same channel inside the dedup window returns the first id.
	pub async fn enqueue(&self, target: &ChannelTarget, text: &str) -> anyhow::Result<OutboxId> {
		let text = text.trim();
		if text.is_empty() {
			return Err(anyhow!("outbox text must be non-empty"));
		}

		let hash = format!("{:x}", Sha256::digest(normalize(text).as_bytes()));
		let dedup_key = self.keys.outbox_dedup(self.platform, &target.channel_id, &hash);
		let id = OutboxId::generate();
		let id_str = id.to_string();

		if !self.kv.set_nx(&dedup_key, &id_str, self.settings.dedup_ttl).await? {
			if let Some(existing) = self.kv.get(&dedup_key).await?
				&& let Ok(existing) = existing.parse::<OutboxId>()
			{
				debug!(channel_id = %target.channel_id, outbox_id = %existing, "duplicate reply suppressed");
				metrics::counter!("memebot_outbox_deduplicated_total", "platform" => self.platform.as_str()).increment(1);
				return Ok(existing);
			}
			// Marker expired between the two calls.
			self.kv.set(&dedup_key, &id_str, Some(self.settings.dedup_ttl)).await?;
		}

		let inserted = self
			.store
			.insert_outbox(&NewOutboxMessage {
				id,
				platform: self.platform,
				channel_id: &target.channel_id,
				platform_channel_id: target.platform_channel_id.as_str(),
				text,
				created_at_ms: unix_ms_now(),
			})
			.await;
		if let Err(e) = inserted {
			if let Err(cleanup) = self.kv.delete_if_equals(&dedup_key, &id_str).await {
				warn!(error = %cleanup, "failed to drop dedup marker");
			}
			return Err(e);
		}

		debug!(channel_id = %target.channel_id, outbox_id = %id, "reply queued");
		metrics::counter!("memebot_outbox_enqueued_total", "platform" => self.platform.as_str()).increment(1);
		Ok(id)
	}

	/// One pass over the due rows, oldest first.
	pub async fn deliver_pass(&self, channels: &ChannelMap, adapter: &dyn ChatPlatform) -> anyhow::Result<DeliveryReport> {
		let now = unix_ms_now();
		let stale_before = now - millis(self.settings.stale_processing);
		let rows = self
			.store
			.outbox_candidates(self.platform, stale_before, self.settings.batch_size)
			.await
			.context("load outbox candidates")?;

		let mut report = DeliveryReport::default();
		let mut deferred: HashSet<ChannelId> = HashSet::new();
		let total = rows.len();

		for (idx, row) in rows.iter().enumerate() {
			if deferred.contains(&row.channel_id) {
				report.deferred += 1;
				continue;
			}
			// Anything but a send or a terminal failure leaves this row ahead of the channel's newer rows.
			match self.deliver_one(row, channels, adapter).await {
				Ok(Delivery::Sent) => report.sent += 1,
				Ok(Delivery::Failed) => report.failed += 1,
				Ok(Delivery::Retry) => {
					deferred.insert(row.channel_id.clone());
					report.retried += 1;
				}
				Ok(Delivery::Lost) => {
					deferred.insert(row.channel_id.clone());
					report.lost += 1;
				}
				Ok(Delivery::Deferred) => {
					deferred.insert(row.channel_id.clone());
					report.deferred += 1;
				}
				Ok(Delivery::GlobalLimited) => {
					report.deferred += total - idx;
					debug!(platform = %self.platform, "global send window exhausted");
					break;
				}
				Err(e) => {
					warn!(outbox_id = %row.id, channel_id = %row.channel_id, error = %e, "outbox delivery error");
					deferred.insert(row.channel_id.clone());
					report.errors += 1;
				}
			}
		}

		if report.deferred > 0 {
			metrics::counter!("memebot_outbox_deferred_total", "platform" => self.platform.as_str())
				.increment(report.deferred as u64);
		}
		Ok(report)
	}

	async fn deliver_one(
		&self,
		row: &OutboxRow,
		channels: &ChannelMap,
		adapter: &dyn ChatPlatform,
	) -> anyhow::Result<Delivery> {
		let lock_key = self.keys.outbox_lock(self.platform, &row.channel_id);
		let token = uuid::Uuid::new_v4().to_string();
		if !self.kv.set_nx(&lock_key, &token, self.settings.lock_ttl).await? {
			return Ok(Delivery::Deferred);
		}

		let result = self.deliver_locked(row, channels, adapter).await;

		if let Err(e) = self.kv.delete_if_equals(&lock_key, &token).await {
			warn!(channel_id = %row.channel_id, error = %e, "failed to release outbox lock");
		}
		result
	}

	async fn deliver_locked(
		&self,
		row: &OutboxRow,
		channels: &ChannelMap,
		adapter: &dyn ChatPlatform,
	) -> anyhow::Result<Delivery> {
		let now = unix_ms_now();
		let channel_window = millis(self.settings.channel_window);
		let channel_key = self
			.keys
			.outbox_channel_window(self.platform, &row.channel_id, now / channel_window);
		if self.kv.incr(&channel_key, self.settings.channel_window).await? > self.settings.channel_limit {
			self.kv.decr(&channel_key).await?;
			return Ok(Delivery::Deferred);
		}

		let global_window = millis(self.settings.global_window);
		let global_key = self.keys.outbox_global_window(self.platform, now / global_window);
		if self.kv.incr(&global_key, self.settings.global_window).await? > self.settings.global_limit {
			self.kv.decr(&global_key).await?;
			self.kv.decr(&channel_key).await?;
			return Ok(Delivery::GlobalLimited);
		}

		if !self.store.claim_outbox(row, now).await? {
			self.kv.decr(&global_key).await?;
			self.kv.decr(&channel_key).await?;
			return Ok(Delivery::Lost);
		}

		let Some(target) = channels.target(&row.channel_id) else {
			return self.fail(row, "channel is not active on this runner").await;
		};

		match adapter.send_message(&target, &row.text).await {
			Ok(()) => {
				if !self.store.mark_outbox_sent(row.id, unix_ms_now()).await? {
					warn!(outbox_id = %row.id, "outbox row left processing before it was marked sent");
				}
				info!(outbox_id = %row.id, channel_id = %row.channel_id, platform = %self.platform, "reply sent");
				metrics::counter!("memebot_outbox_sent_total", "platform" => self.platform.as_str()).increment(1);
				Ok(Delivery::Sent)
			}
			Err(PlatformError::RateLimited { retry_after }) => {
				self.store.release_outbox(row.id).await?;
				debug!(outbox_id = %row.id, channel_id = %row.channel_id, ?retry_after, "platform rate limited send");
				Ok(Delivery::Deferred)
			}
			Err(e) => {
				warn!(outbox_id = %row.id, channel_id = %row.channel_id, class = e.class(), error = %e, "send failed");
				self.fail(row, &e.to_string()).await
			}
		}
	}

	async fn fail(&self, row: &OutboxRow, error: &str) -> anyhow::Result<Delivery> {
		let status = self
			.store
			.record_outbox_failure(row.id, error, self.settings.max_attempts, unix_ms_now())
			.await?;
		match status {
			Some(OutboxStatus::Failed) => {
				warn!(outbox_id = %row.id, channel_id = %row.channel_id, "reply failed permanently");
				metrics::counter!("memebot_outbox_failed_total", "platform" => self.platform.as_str()).increment(1);
				Ok(Delivery::Failed)
			}
			_ => {
				metrics::counter!("memebot_outbox_retries_total", "platform" => self.platform.as_str()).increment(1);
				Ok(Delivery::Retry)
			}
		}
	}
}
