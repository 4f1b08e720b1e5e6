#![forbid(unsafe_code)]

//! Idempotent reward log. Grants reach a wallet once, when the account is linked to a user.

use std::sync::Arc;

use memebot_domain::{ChannelId, Platform, SessionId};
use tracing::{debug, info, warn};

use super::notify::{WalletSink, WalletUpdate};
use crate::store::Store;
use crate::store::rewards::{ClaimedReward, NewRewardEvent, RewardStatus};
use crate::util::time::unix_ms_now;

/// Outcome of evaluating one reward source against the rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewardDecision {
	pub amount: i64,
	pub coins: i64,
	pub status: RewardStatus,
	pub reason: Option<&'static str>,
}

impl RewardDecision {
	pub fn eligible(amount: i64, coins: i64) -> Self {
		Self {
			amount,
			coins,
			status: RewardStatus::Eligible,
			reason: None,
		}
	}

	pub fn ignored(amount: i64, reason: &'static str) -> Self {
		Self {
			amount,
			coins: 0,
			status: RewardStatus::Ignored,
			reason: Some(reason),
		}
	}
}

/// A reward event ready for the ledger.
#[derive(Debug, Clone)]
pub struct RewardCandidate {
	pub provider: Platform,
	/// Idempotency key, unique per provider.
	pub provider_event_id: String,
	pub channel_id: ChannelId,
	pub provider_account_id: String,
	pub event_type: String,
	pub decision: RewardDecision,
	pub event_at_ms: i64,
	pub raw_payload: String,
	pub session_id: Option<SessionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
	/// Already recorded; nothing changed.
	Duplicate,
	Recorded { eligible: bool, claimed: Vec<ClaimedReward> },
}

pub struct RewardLedger {
	store: Store,
	sink: Arc<dyn WalletSink>,
}

impl RewardLedger {
	pub fn new(store: Store, sink: Arc<dyn WalletSink>) -> Self {
		Self { store, sink }
	}

	pub async fn record(&self, candidate: &RewardCandidate) -> anyhow::Result<RecordOutcome> {
		let now = unix_ms_now();
		let inserted = self
			.store
			.insert_reward_event(&NewRewardEvent {
				id: uuid::Uuid::new_v4(),
				provider: candidate.provider,
				provider_event_id: &candidate.provider_event_id,
				channel_id: &candidate.channel_id,
				provider_account_id: &candidate.provider_account_id,
				event_type: &candidate.event_type,
				amount: candidate.decision.amount,
				coins_to_grant: candidate.decision.coins,
				status: candidate.decision.status,
				reason: candidate.decision.reason,
				event_at_ms: candidate.event_at_ms,
				raw_payload: &candidate.raw_payload,
				session_id: candidate.session_id,
				created_at_ms: now,
			})
			.await?;

		if !inserted {
			debug!(
				provider = %candidate.provider,
				provider_event_id = %candidate.provider_event_id,
				"duplicate reward event"
			);
			metrics::counter!("memebot_reward_duplicates_total", "platform" => candidate.provider.as_str()).increment(1);
			return Ok(RecordOutcome::Duplicate);
		}

		metrics::counter!(
			"memebot_reward_events_total",
			"platform" => candidate.provider.as_str(),
			"status" => candidate.decision.status.as_str()
		)
		.increment(1);

		let eligible = candidate.decision.status == RewardStatus::Eligible;
		if !eligible {
			debug!(
				channel_id = %candidate.channel_id,
				event_type = %candidate.event_type,
				reason = candidate.decision.reason.unwrap_or_default(),
				"reward event ignored"
			);
			return Ok(RecordOutcome::Recorded {
				eligible,
				claimed: Vec::new(),
			});
		}

		let claimed = self
			.claim_pending_for_account(candidate.provider, &candidate.provider_account_id)
			.await?;
		Ok(RecordOutcome::Recorded { eligible, claimed })
	}

	/// Credit every unclaimed eligible grant of a linked account. Also called after account linking.
	pub async fn claim_pending_for_account(
		&self,
		provider: Platform,
		provider_account_id: &str,
	) -> anyhow::Result<Vec<ClaimedReward>> {
		let Some(user_id) = self.store.user_for_account(provider, provider_account_id).await? else {
			debug!(%provider, provider_account_id, "account not linked; grant stays pending");
			return Ok(Vec::new());
		};

		let claimed = self
			.store
			.claim_pending_rewards(provider, provider_account_id, &user_id, unix_ms_now())
			.await?;
		if claimed.is_empty() {
			return Ok(claimed);
		}
		info!(%provider, user_id = %user_id, grants = claimed.len(), "credited reward grants");
		metrics::counter!("memebot_reward_grants_claimed_total", "platform" => provider.as_str())
			.increment(claimed.len() as u64);

		for grant in &claimed {
			let update = WalletUpdate {
				user_id: user_id.clone(),
				channel_id: grant.channel_id.clone(),
				balance: grant.balance,
				delta: grant.coins,
				reason: grant.event_type.clone(),
				reward_event_id: grant.reward_event_id.clone(),
			};
			if let Err(e) = self.sink.wallet_updated(&update).await {
				warn!(user_id = %user_id, channel_id = %grant.channel_id, error = %e, "wallet notification failed");
			}
		}
		Ok(claimed)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::bot::notify::RecordingWalletSink;
	use crate::store::fixtures;

	fn candidate(event_id: &str, account: &str, coins: i64) -> RewardCandidate {
		RewardCandidate {
			provider: Platform::Twitch,
			provider_event_id: event_id.to_string(),
			channel_id: ChannelId::new("c1").expect("channel id"),
			provider_account_id: account.to_string(),
			event_type: "follow".to_string(),
			decision: RewardDecision::eligible(1, coins),
			event_at_ms: 1_000,
			raw_payload: "{}".to_string(),
			session_id: None,
		}
	}

	async fn ledger() -> (Store, Arc<RecordingWalletSink>, RewardLedger) {
		let store = Store::connect_in_memory().await.expect("store");
		let sink = Arc::new(RecordingWalletSink::default());
		let ledger = RewardLedger::new(store.clone(), sink.clone());
		(store, sink, ledger)
	}

	#[tokio::test]
	async fn same_event_is_credited_once() {
		let (store, sink, ledger) = ledger().await;
		fixtures::account(&store, "ext-1", Some("user-1"), "twitch", "tw-1", "viewer").await;

		let first = ledger.record(&candidate("twitch:follow:e1", "tw-1", 50)).await.expect("record");
		let RecordOutcome::Recorded { eligible, claimed } = first else {
			panic!("expected recorded outcome");
		};
		assert!(eligible);
		assert_eq!(claimed.len(), 1);

		let second = ledger.record(&candidate("twitch:follow:e1", "tw-1", 50)).await.expect("record");
		assert_eq!(second, RecordOutcome::Duplicate);

		assert_eq!(fixtures::count_reward_events(&store).await, 1);
		assert_eq!(store.wallet_balance("user-1", "c1").await.expect("balance"), Some(50));
		let updates = sink.updates();
		assert_eq!(updates.len(), 1);
		assert_eq!(updates[0].delta, 50);
		assert_eq!(updates[0].balance, 50);
	}

	#[tokio::test]
	async fn unlinked_grants_are_claimed_after_linking() {
		let (store, sink, ledger) = ledger().await;
		fixtures::account(&store, "ext-1", None, "twitch", "tw-1", "viewer").await;

		ledger.record(&candidate("twitch:follow:e1", "tw-1", 10)).await.expect("record");
		ledger.record(&candidate("twitch:cheer:e2", "tw-1", 15)).await.expect("record");
		assert!(sink.updates().is_empty());

		fixtures::link_account(&store, "ext-1", "user-1").await;
		let claimed = ledger
			.claim_pending_for_account(Platform::Twitch, "tw-1")
			.await
			.expect("claim");
		assert_eq!(claimed.len(), 2);
		assert_eq!(store.wallet_balance("user-1", "c1").await.expect("balance"), Some(25));

		let again = ledger
			.claim_pending_for_account(Platform::Twitch, "tw-1")
			.await
			.expect("claim");
		assert!(again.is_empty());
		assert_eq!(sink.updates().len(), 2);
	}

	#[tokio::test]
	async fn ignored_events_never_reach_a_wallet() {
		let (store, sink, ledger) = ledger().await;
		fixtures::account(&store, "ext-1", Some("user-1"), "twitch", "tw-1", "viewer").await;

		let mut ignored = candidate("twitch:raid:e1", "tw-1", 0);
		ignored.decision = RewardDecision::ignored(3, "below_minimum");
		let outcome = ledger.record(&ignored).await.expect("record");
		assert_eq!(
			outcome,
			RecordOutcome::Recorded {
				eligible: false,
				claimed: Vec::new()
			}
		);
		let row = store
			.reward_event(Platform::Twitch, "twitch:raid:e1")
			.await
			.expect("load")
			.expect("row");
		assert_eq!(row.status, "ignored");
		assert_eq!(row.reason.as_deref(), Some("below_minimum"));
		assert!(store.wallet_balance("user-1", "c1").await.expect("balance").is_none());
		assert!(sink.updates().is_empty());
	}
}
