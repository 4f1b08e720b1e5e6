#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, anyhow};
use memebot_domain::{ChannelId, OutboxId, Platform};
use sqlx::Row;

use super::{Store, on_pool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutboxStatus {
	Pending,
	Processing,
	Sent,
	Failed,
}

impl OutboxStatus {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Processing => "processing",
			Self::Sent => "sent",
			Self::Failed => "failed",
		}
	}
}

impl fmt::Display for OutboxStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl FromStr for OutboxStatus {
	type Err = anyhow::Error;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"pending" => Ok(Self::Pending),
			"processing" => Ok(Self::Processing),
			"sent" => Ok(Self::Sent),
			"failed" => Ok(Self::Failed),
			other => Err(anyhow!("unknown outbox status: {other}")),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxRow {
	pub id: OutboxId,
	pub platform: Platform,
	pub channel_id: ChannelId,
	pub platform_channel_id: String,
	pub text: String,
	pub status: OutboxStatus,
	pub attempts: i64,
	pub created_at_ms: i64,
	pub processing_at_ms: Option<i64>,
	pub sent_at_ms: Option<i64>,
	pub failed_at_ms: Option<i64>,
	pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewOutboxMessage<'a> {
	pub id: OutboxId,
	pub platform: Platform,
	pub channel_id: &'a ChannelId,
	pub platform_channel_id: &'a str,
	pub text: &'a str,
	pub created_at_ms: i64,
}

struct RawOutbox {
	id: String,
	platform: String,
	channel_id: String,
	platform_channel_id: String,
	text: String,
	status: String,
	attempts: i64,
	created_at: i64,
	processing_at: Option<i64>,
	sent_at: Option<i64>,
	failed_at: Option<i64>,
	last_error: Option<String>,
}

impl RawOutbox {
	fn into_row(self) -> anyhow::Result<OutboxRow> {
		Ok(OutboxRow {
			id: self.id.parse().context("outbox id")?,
			platform: self.platform.parse().context("outbox platform")?,
			channel_id: ChannelId::new(self.channel_id).context("outbox channel id")?,
			platform_channel_id: self.platform_channel_id,
			text: self.text,
			status: self.status.parse()?,
			attempts: self.attempts,
			created_at_ms: self.created_at,
			processing_at_ms: self.processing_at,
			sent_at_ms: self.sent_at,
			failed_at_ms: self.failed_at,
			last_error: self.last_error,
		})
	}
}

const OUTBOX_COLUMNS: &str = "id, platform, channel_id, platform_channel_id, text, status, attempts, created_at, \
	processing_at, sent_at, failed_at, last_error";

macro_rules! raw_outbox {
	($row:expr) => {
		RawOutbox {
			id: $row.try_get("id")?,
			platform: $row.try_get("platform")?,
			channel_id: $row.try_get("channel_id")?,
			platform_channel_id: $row.try_get("platform_channel_id")?,
			text: $row.try_get("text")?,
			status: $row.try_get("status")?,
			attempts: $row.try_get("attempts")?,
			created_at: $row.try_get("created_at")?,
			processing_at: $row.try_get("processing_at")?,
			sent_at: $row.try_get("sent_at")?,
			failed_at: $row.try_get("failed_at")?,
			last_error: $row.try_get("last_error")?,
		}
	};
}

impl Store {
	pub async fn insert_outbox(&self, msg: &NewOutboxMessage<'_>) -> anyhow::Result<()> {
		let sql = self.sql(
			"INSERT INTO bot_outbox (id, platform, channel_id, platform_channel_id, text, status, attempts, created_at) \
			VALUES (?, ?, ?, ?, ?, 'pending', 0, ?)",
		);
		on_pool!(self, |pool| {
			sqlx::query(&sql)
				.bind(msg.id.to_string())
				.bind(msg.platform.as_str())
				.bind(msg.channel_id.as_str())
				.bind(msg.platform_channel_id)
				.bind(msg.text)
				.bind(msg.created_at_ms)
				.execute(pool)
				.await
				.context("insert bot_outbox")?;
		});
		Ok(())
	}

	/// Pending rows plus rows stuck in processing since before `stale_before_ms`, oldest first.
	pub async fn outbox_candidates(
		&self,
		platform: Platform,
		stale_before_ms: i64,
		limit: i64,
	) -> anyhow::Result<Vec<OutboxRow>> {
		let query = format!(
			"SELECT {OUTBOX_COLUMNS} FROM bot_outbox WHERE platform = ? \
			AND (status = 'pending' OR (status = 'processing' AND processing_at < ?)) \
			ORDER BY created_at, id LIMIT ?"
		);
		let sql = self.sql(&query);
		let raw: Vec<RawOutbox> = on_pool!(self, |pool| {
			let rows = sqlx::query(&sql)
				.bind(platform.as_str())
				.bind(stale_before_ms)
				.bind(limit)
				.fetch_all(pool)
				.await
				.context("load outbox candidates")?;
			rows.iter()
				.map(|row| -> Result<RawOutbox, sqlx::Error> { Ok(raw_outbox!(row)) })
				.collect::<Result<Vec<_>, sqlx::Error>>()
				.context("decode outbox rows")?
		});
		raw.into_iter().map(RawOutbox::into_row).collect()
	}

	pub async fn get_outbox(&self, id: OutboxId) -> anyhow::Result<Option<OutboxRow>> {
		let query = format!("SELECT {OUTBOX_COLUMNS} FROM bot_outbox WHERE id = ?");
		let sql = self.sql(&query);
		let raw: Option<RawOutbox> = on_pool!(self, |pool| {
			let row = sqlx::query(&sql)
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.context("load outbox row")?;
			row.map(|row| -> Result<RawOutbox, sqlx::Error> { Ok(raw_outbox!(row)) })
				.transpose()
				.context("decode outbox row")?
		});
		raw.map(RawOutbox::into_row).transpose()
	}

	/// Move the row into processing. Guarded by the status it was read with so only one claimer wins.
	pub async fn claim_outbox(&self, row: &OutboxRow, now_ms: i64) -> anyhow::Result<bool> {
		let affected = match row.status {
			OutboxStatus::Pending => {
				let sql = self.sql(
					"UPDATE bot_outbox SET status = 'processing', processing_at = ? WHERE id = ? AND status = 'pending'",
				);
				on_pool!(self, |pool| {
					sqlx::query(&sql)
						.bind(now_ms)
						.bind(row.id.to_string())
						.execute(pool)
						.await
						.context("claim pending outbox row")?
						.rows_affected()
				})
			}
			OutboxStatus::Processing => {
				let sql = self.sql(
					"UPDATE bot_outbox SET processing_at = ? WHERE id = ? AND status = 'processing' AND processing_at = ?",
				);
				on_pool!(self, |pool| {
					sqlx::query(&sql)
						.bind(now_ms)
						.bind(row.id.to_string())
						.bind(row.processing_at_ms)
						.execute(pool)
						.await
						.context("reclaim stale outbox row")?
						.rows_affected()
				})
			}
			OutboxStatus::Sent | OutboxStatus::Failed => 0,
		};
		Ok(affected == 1)
	}

	pub async fn mark_outbox_sent(&self, id: OutboxId, now_ms: i64) -> anyhow::Result<bool> {
		let sql = self.sql(
			"UPDATE bot_outbox SET status = 'sent', sent_at = ?, processing_at = NULL WHERE id = ? AND status = 'processing'",
		);
		let affected = on_pool!(self, |pool| {
			sqlx::query(&sql)
				.bind(now_ms)
				.bind(id.to_string())
				.execute(pool)
				.await
				.context("mark outbox sent")?
				.rows_affected()
		});
		Ok(affected == 1)
	}

	/// Count one failed attempt. Returns the resulting status, `None` when the row was not in processing.
	pub async fn record_outbox_failure(
		&self,
		id: OutboxId,
		error: &str,
		max_attempts: i64,
		now_ms: i64,
	) -> anyhow::Result<Option<OutboxStatus>> {
		let sql = self.sql(
			"UPDATE bot_outbox SET attempts = attempts + 1, last_error = ?, \
			status = CASE WHEN attempts + 1 >= ? THEN 'failed' ELSE 'pending' END, \
			failed_at = CASE WHEN attempts + 1 >= ? THEN ? ELSE NULL END, \
			processing_at = NULL \
			WHERE id = ? AND status = 'processing' RETURNING status",
		);
		let status: Option<String> = on_pool!(self, |pool| {
			sqlx::query_scalar(&sql)
				.bind(error)
				.bind(max_attempts)
				.bind(max_attempts)
				.bind(now_ms)
				.bind(id.to_string())
				.fetch_optional(pool)
				.await
				.context("record outbox failure")?
		});
		status.map(|s| s.parse()).transpose()
	}

	/// Back to pending without consuming an attempt.
	pub async fn release_outbox(&self, id: OutboxId) -> anyhow::Result<bool> {
		let sql = self.sql(
			"UPDATE bot_outbox SET status = 'pending', processing_at = NULL WHERE id = ? AND status = 'processing'",
		);
		let affected = on_pool!(self, |pool| {
			sqlx::query(&sql)
				.bind(id.to_string())
				.execute(pool)
				.await
				.context("release outbox row")?
				.rows_affected()
		});
		Ok(affected == 1)
	}

	pub async fn count_outbox(&self, platform: Platform, status: OutboxStatus) -> anyhow::Result<i64> {
		let sql = self.sql("SELECT COUNT(*) FROM bot_outbox WHERE platform = ? AND status = ?");
		on_pool!(self, |pool| {
			sqlx::query_scalar(&sql)
				.bind(platform.as_str())
				.bind(status.as_str())
				.fetch_one(pool)
				.await
				.context("count outbox rows")
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn seeded(text: &str, created_at_ms: i64) -> (Store, OutboxId) {
		let store = Store::connect_in_memory().await.expect("store");
		let id = insert(&store, text, created_at_ms).await;
		(store, id)
	}

	async fn insert(store: &Store, text: &str, created_at_ms: i64) -> OutboxId {
		let channel_id = ChannelId::new("c1").expect("channel id");
		let id = OutboxId::generate();
		store
			.insert_outbox(&NewOutboxMessage {
				id,
				platform: Platform::Twitch,
				channel_id: &channel_id,
				platform_channel_id: "111",
				text,
				created_at_ms,
			})
			.await
			.expect("insert");
		id
	}

	#[tokio::test]
	async fn only_one_claim_wins() {
		let (store, id) = seeded("hello", 1).await;
		let row = store.get_outbox(id).await.expect("get").expect("row");

		assert!(store.claim_outbox(&row, 10).await.expect("claim"));
		assert!(!store.claim_outbox(&row, 11).await.expect("claim"));

		let row = store.get_outbox(id).await.expect("get").expect("row");
		assert_eq!(row.status, OutboxStatus::Processing);
		assert_eq!(row.processing_at_ms, Some(10));
	}

	#[tokio::test]
	async fn stale_processing_rows_are_candidates_again() {
		let (store, id) = seeded("hello", 1).await;
		let row = store.get_outbox(id).await.expect("get").expect("row");
		assert!(store.claim_outbox(&row, 100).await.expect("claim"));

		let fresh = store.outbox_candidates(Platform::Twitch, 50, 10).await.expect("candidates");
		assert!(fresh.is_empty());

		let stale = store.outbox_candidates(Platform::Twitch, 200, 10).await.expect("candidates");
		assert_eq!(stale.len(), 1);
		assert!(store.claim_outbox(&stale[0], 300).await.expect("reclaim"));
		assert!(!store.claim_outbox(&stale[0], 301).await.expect("second reclaim"));
	}

	#[tokio::test]
	async fn candidates_are_fifo_and_platform_scoped() {
		let store = Store::connect_in_memory().await.expect("store");
		let second = insert(&store, "b", 20).await;
		let first = insert(&store, "a", 10).await;

		let rows = store.outbox_candidates(Platform::Twitch, 0, 10).await.expect("candidates");
		assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), vec![first, second]);
		assert!(store.outbox_candidates(Platform::Kick, 0, 10).await.expect("candidates").is_empty());
	}

	#[tokio::test]
	async fn same_millisecond_rows_keep_insertion_order() {
		let store = Store::connect_in_memory().await.expect("store");
		let mut ids = Vec::new();
		for text in ["a", "b", "c", "d", "e"] {
			ids.push(insert(&store, text, 42).await);
		}

		let rows = store.outbox_candidates(Platform::Twitch, 0, 10).await.expect("candidates");
		assert_eq!(rows.iter().map(|r| r.id).collect::<Vec<_>>(), ids);
	}

	#[tokio::test]
	async fn failures_retry_until_the_cap() {
		let (store, id) = seeded("hello", 1).await;
		for attempt in 1..=3 {
			let row = store.get_outbox(id).await.expect("get").expect("row");
			assert!(store.claim_outbox(&row, attempt).await.expect("claim"));
			let status = store
				.record_outbox_failure(id, &format!("boom {attempt}"), 3, attempt)
				.await
				.expect("record")
				.expect("status");
			let row = store.get_outbox(id).await.expect("get").expect("row");
			assert_eq!(row.attempts, attempt);
			assert_eq!(row.last_error.as_deref(), Some(format!("boom {attempt}").as_str()));
			if attempt < 3 {
				assert_eq!(status, OutboxStatus::Pending);
				assert_eq!(row.failed_at_ms, None);
			} else {
				assert_eq!(status, OutboxStatus::Failed);
				assert_eq!(row.failed_at_ms, Some(3));
			}
		}
	}

	#[tokio::test]
	async fn release_keeps_attempts() {
		let (store, id) = seeded("hello", 1).await;
		let row = store.get_outbox(id).await.expect("get").expect("row");
		assert!(store.claim_outbox(&row, 5).await.expect("claim"));
		assert!(store.release_outbox(id).await.expect("release"));

		let row = store.get_outbox(id).await.expect("get").expect("row");
		assert_eq!(row.status, OutboxStatus::Pending);
		assert_eq!(row.attempts, 0);
		assert!(!store.mark_outbox_sent(id, 6).await.expect("mark"));
	}
}
