#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use memebot_domain::{ChannelId, Platform, PlatformChannelId};
use memebot_platform::{BotIdentity, ChannelTarget, ChatMessage, ChatPlatform, IngestMode, UserRef};

use super::channel_state::ChannelMap;
use super::credits::CreditsReporter;
use super::ingest::Ingestor;
use super::ledger::RewardLedger;
use super::notify::RecordingWalletSink;
use super::outbox::Outbox;
use super::rewards::RewardProcessor;
use super::sessions::StreamSessions;
use crate::adapters::DemoAdapter;
use crate::config::{OutboxSettings, RewardSettings, RunnerSettings};
use crate::kv::{KeySpace, KvStore, MemoryKv};
use crate::store::Store;

pub fn target(channel: &str, platform_channel: &str) -> ChannelTarget {
	ChannelTarget {
		channel_id: ChannelId::new(channel).expect("channel id"),
		platform: Platform::Twitch,
		platform_channel_id: PlatformChannelId::new(platform_channel).expect("platform channel id"),
		slug: format!("{channel}-slug"),
		bot: BotIdentity {
			external_account_id: "bot".to_string(),
			platform_user_id: Some("900".to_string()),
			login: Some("memebot".to_string()),
		},
		owner: None,
	}
}

pub fn chat(id: &str, user_id: &str, login: &str, text: &str) -> ChatMessage {
	ChatMessage::new(id, UserRef::new(user_id, login), text)
}

/// Every engine component wired against in-process backends.
pub struct Harness {
	pub store: Store,
	pub kv: Arc<MemoryKv>,
	pub adapter: Arc<DemoAdapter>,
	pub channels: ChannelMap,
	pub sink: Arc<RecordingWalletSink>,
	pub ledger: Arc<RewardLedger>,
	pub outbox: Arc<Outbox>,
	pub rewards: Arc<RewardProcessor>,
	pub sessions: StreamSessions,
	pub ingestor: Arc<Ingestor>,
}

impl Harness {
	pub async fn new(mode: IngestMode) -> Self {
		Self::with_outbox(mode, OutboxSettings::default()).await
	}

	pub async fn with_outbox(mode: IngestMode, outbox_settings: OutboxSettings) -> Self {
		let platform = Platform::Twitch;
		let store = Store::connect_in_memory().await.expect("in-memory store");
		let kv = Arc::new(MemoryKv::new());
		let kv_dyn: Arc<dyn KvStore> = kv.clone();
		let keys = KeySpace::default();
		let adapter = Arc::new(DemoAdapter::new(platform, mode));
		let adapter_dyn: Arc<dyn ChatPlatform> = adapter.clone();
		let channels = ChannelMap::new();
		let sink = Arc::new(RecordingWalletSink::default());

		let ledger = Arc::new(RewardLedger::new(store.clone(), sink.clone()));
		let outbox = Arc::new(Outbox::new(
			store.clone(),
			kv_dyn.clone(),
			keys.clone(),
			platform,
			outbox_settings,
		));
		let rewards = Arc::new(RewardProcessor::new(
			ledger.clone(),
			kv_dyn.clone(),
			keys.clone(),
			platform,
			RewardSettings::default(),
		));
		let sessions = StreamSessions::new(kv_dyn, keys, platform, Duration::from_secs(600));
		let settings = RunnerSettings {
			live_check_interval: Duration::ZERO,
			..RunnerSettings::default()
		};
		let ingestor = Arc::new(Ingestor::new(
			adapter_dyn,
			store.clone(),
			outbox.clone(),
			rewards.clone(),
			sessions.clone(),
			CreditsReporter::disabled(),
			settings,
		));

		Self {
			store,
			kv,
			adapter,
			channels,
			sink,
			ledger,
			outbox,
			rewards,
			sessions,
			ingestor,
		}
	}
}
