#![forbid(unsafe_code)]

//! Wires the engine for one platform and owns its background tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use memebot_domain::Platform;
use memebot_platform::webhook::{WebhookReceiver, run_webhook_server};
use memebot_platform::{ChatPlatform, PushEvent};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::channel_state::ChannelMap;
use super::credits::CreditsReporter;
use super::ingest::Ingestor;
use super::ledger::RewardLedger;
use super::notify::WalletSink;
use super::outbox::{DeliveryReport, Outbox};
use super::registry::{SubscriptionRegistry, SyncReport};
use super::rewards::RewardProcessor;
use super::sessions::StreamSessions;
use crate::config::{OutboxSettings, RewardSettings, RunnerConfig, RunnerSettings};
use crate::health::HealthState;
use crate::kv::{KeySpace, KvStore};
use crate::store::Store;

/// Everything the runner needs from `main`.
pub struct RunnerParts {
	pub config: RunnerConfig,
	pub store: Store,
	pub kv: Arc<dyn KvStore>,
	pub adapter: Arc<dyn ChatPlatform>,
	pub wallet_sink: Arc<dyn WalletSink>,
	pub credits: CreditsReporter,
	pub health: HealthState,
}

pub struct Runner {
	platform: Platform,
	settings: RunnerSettings,
	outbox_settings: OutboxSettings,
	adapter: Arc<dyn ChatPlatform>,
	channels: ChannelMap,
	registry: Arc<SubscriptionRegistry>,
	ingestor: Arc<Ingestor>,
	outbox: Arc<Outbox>,
	health: HealthState,
	push: Option<mpsc::Receiver<PushEvent>>,
	webhook: Option<WebhookReceiver>,
}

impl Runner {
	pub fn new(parts: RunnerParts) -> Self {
		let RunnerParts {
			config,
			store,
			kv,
			adapter,
			wallet_sink,
			credits,
			health,
		} = parts;
		let platform = adapter.platform();
		let keys = KeySpace::new(config.kv.key_prefix.clone());
		let caps = store.capabilities();
		if config.rewards.enabled && !caps.rewards {
			warn!("reward tables missing; rewards disabled");
		}

		let channels = ChannelMap::new();
		let registry = Arc::new(SubscriptionRegistry::new(
			store.clone(),
			adapter.clone(),
			channels.clone(),
			config.runner.shard_index,
			config.runner.shard_count,
		));
		let outbox = Arc::new(Outbox::new(
			store.clone(),
			kv.clone(),
			keys.clone(),
			platform,
			config.outbox.clone(),
		));
		let ledger = Arc::new(RewardLedger::new(store.clone(), wallet_sink));
		let rewards = Arc::new(RewardProcessor::new(
			ledger,
			kv.clone(),
			keys.clone(),
			platform,
			RewardSettings {
				enabled: config.rewards.enabled && caps.rewards,
				..config.rewards.clone()
			},
		));
		let sessions = StreamSessions::new(kv, keys, platform, config.runner.break_credit);
		let ingestor = Arc::new(Ingestor::new(
			adapter.clone(),
			store,
			outbox.clone(),
			rewards,
			sessions,
			credits,
			config.runner.clone(),
		));

		Self {
			platform,
			settings: config.runner,
			outbox_settings: config.outbox,
			adapter,
			channels,
			registry,
			ingestor,
			outbox,
			health,
			push: None,
			webhook: None,
		}
	}

	/// Consume pushed events; serve webhooks when a receiver is given.
	pub fn with_push(mut self, events: mpsc::Receiver<PushEvent>, webhook: Option<WebhookReceiver>) -> Self {
		self.push = Some(events);
		self.webhook = webhook;
		self
	}

	pub fn channels(&self) -> ChannelMap {
		self.channels.clone()
	}

	/// Run until `shutdown` resolves, then stop every loop and drain within the grace period.
	pub async fn run(self, shutdown: impl Future<Output = ()>) -> anyhow::Result<()> {
		let (stop_tx, stop_rx) = watch::channel(false);

		match self.registry.sync().await {
			Ok(report) => info!(platform = %self.platform, channels = self.channels.len(), ?report, "initial subscription sync"),
			Err(e) => warn!(platform = %self.platform, error = %e, "initial subscription sync failed"),
		}

		let mut tasks = JoinSet::new();
		tasks.spawn(sync_loop(self.registry.clone(), self.settings.sync_interval, stop_rx.clone()));
		tasks.spawn(refresh_loop(
			self.channels.clone(),
			self.ingestor.clone(),
			self.settings.commands_refresh_interval,
			stop_rx.clone(),
		));
		tasks.spawn(scheduler_loop(
			self.channels.clone(),
			self.ingestor.clone(),
			self.settings.tick,
			self.settings.max_concurrent_ticks,
			stop_rx.clone(),
		));
		tasks.spawn(delivery_loop(
			self.outbox.clone(),
			self.channels.clone(),
			self.adapter.clone(),
			self.outbox_settings.delivery_interval,
			stop_rx.clone(),
		));
		if let Some(events) = self.push {
			tasks.spawn(push_loop(self.channels.clone(), self.ingestor.clone(), events, stop_rx.clone()));
		}
		if let Some(receiver) = self.webhook {
			let mut stop = stop_rx.clone();
			tasks.spawn(async move {
				tokio::select! {
					res = run_webhook_server(receiver) => {
						if let Err(e) = res {
							warn!(error = %e, "webhook receiver stopped");
						}
					}
					_ = stop.changed() => {}
				}
			});
		}

		self.health.mark_ready();
		info!(platform = %self.platform, "runner started");

		shutdown.await;
		info!(platform = %self.platform, "shutdown requested; draining");
		self.health.mark_not_ready();
		let _ = stop_tx.send(true);

		let drain = async {
			while let Some(res) = tasks.join_next().await {
				if let Err(e) = res
					&& e.is_panic()
				{
					warn!(error = %e, "runner task panicked");
				}
			}
		};
		if tokio::time::timeout(self.settings.shutdown_grace, drain).await.is_err() {
			warn!(grace = ?self.settings.shutdown_grace, "drain timed out; aborting remaining tasks");
			tasks.abort_all();
			while tasks.join_next().await.is_some() {}
		}
		info!(platform = %self.platform, "runner stopped");
		Ok(())
	}
}

fn ticker(period: Duration) -> tokio::time::Interval {
	let mut ticker = tokio::time::interval(period);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
	ticker
}

async fn sync_loop(registry: Arc<SubscriptionRegistry>, period: Duration, mut stop: watch::Receiver<bool>) {
	let mut ticker = ticker(period);
	// The first tick fires immediately; the runner already synced.
	ticker.tick().await;
	loop {
		tokio::select! {
			_ = ticker.tick() => {}
			_ = stop.changed() => break,
		}
		match registry.sync().await {
			Ok(report) if report != SyncReport::default() => debug!(?report, "subscriptions synced"),
			Ok(_) => {}
			Err(e) => {
				warn!(error = %e, "subscription sync failed; keeping current channels");
				metrics::counter!("memebot_sync_failures_total").increment(1);
			}
		}
	}
}

async fn refresh_loop(channels: ChannelMap, ingestor: Arc<Ingestor>, period: Duration, mut stop: watch::Receiver<bool>) {
	let mut ticker = ticker(period);
	ticker.tick().await;
	loop {
		tokio::select! {
			_ = ticker.tick() => {}
			_ = stop.changed() => break,
		}
		for (_, slot) in channels.snapshot() {
			// Busy channels refresh on their own tick once stale.
			if let Ok(mut state) = slot.try_lock() {
				ingestor.refresh_config(&mut state).await;
			}
		}
		ingestor.prune_caches(&channels);
	}
}

async fn scheduler_loop(
	channels: ChannelMap,
	ingestor: Arc<Ingestor>,
	period: Duration,
	max_concurrent: usize,
	mut stop: watch::Receiver<bool>,
) {
	let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
	let mut in_flight = JoinSet::new();
	let mut ticker = ticker(period);
	let mut offset = 0usize;

	loop {
		tokio::select! {
			_ = ticker.tick() => {}
			_ = stop.changed() => break,
		}
		while let Some(res) = in_flight.try_join_next() {
			if let Err(e) = res
				&& e.is_panic()
			{
				warn!(error = %e, "channel tick panicked");
			}
		}

		let mut slots = channels.snapshot();
		if slots.is_empty() {
			continue;
		}
		// Rotate so saturation does not starve the same channels every tick.
		offset = (offset + 1) % slots.len();
		slots.rotate_left(offset);

		for (_, slot) in slots {
			let Ok(permit) = permits.clone().try_acquire_owned() else {
				metrics::counter!("memebot_scheduler_saturated_total").increment(1);
				break;
			};
			let ingestor = ingestor.clone();
			in_flight.spawn(async move {
				ingestor.tick(&slot).await;
				drop(permit);
			});
		}
	}

	while in_flight.join_next().await.is_some() {}
}

async fn delivery_loop(
	outbox: Arc<Outbox>,
	channels: ChannelMap,
	adapter: Arc<dyn ChatPlatform>,
	period: Duration,
	mut stop: watch::Receiver<bool>,
) {
	let mut ticker = ticker(period);
	loop {
		tokio::select! {
			_ = ticker.tick() => {}
			_ = stop.changed() => break,
		}
		match outbox.deliver_pass(&channels, adapter.as_ref()).await {
			Ok(report) if report != DeliveryReport::default() => debug!(?report, "outbox delivery pass"),
			Ok(_) => {}
			Err(e) => warn!(error = %e, "outbox delivery pass failed"),
		}
	}
}

async fn push_loop(
	channels: ChannelMap,
	ingestor: Arc<Ingestor>,
	mut events: mpsc::Receiver<PushEvent>,
	mut stop: watch::Receiver<bool>,
) {
	loop {
		let event = tokio::select! {
			ev = events.recv() => ev,
			_ = stop.changed() => break,
		};
		let Some(event) = event else {
			debug!("push event channel closed");
			break;
		};
		ingestor.handle_push(&channels, event).await;
	}
}

#[cfg(test)]
mod tests {
	use std::time::Instant;

	use memebot_platform::{IngestMode, LiveHandle, MessagePage, PushEventKind};

	use super::*;
	use crate::adapters::DemoAdapter;
	use crate::bot::notify::RecordingWalletSink;
	use crate::bot::test_support::chat;
	use crate::kv::MemoryKv;
	use crate::store::fixtures;

	async fn seeded_store() -> Store {
		let store = Store::connect_in_memory().await.expect("store");
		fixtures::account(&store, "acct-bot", None, "twitch", "9000", "memebot").await;
		fixtures::global_bot(&store, "twitch", "acct-bot").await;
		fixtures::channel(&store, "c1", "alpha", false).await;
		fixtures::subscription(&store, "c1", "twitch", "111", None).await;
		fixtures::command(&store, "cmd-1", "c1", "!discord", "discord.gg/memes", false).await;
		store
	}

	fn config() -> RunnerConfig {
		let mut config = RunnerConfig::default();
		config.runner.tick = Duration::from_millis(50);
		config.runner.shutdown_grace = Duration::from_secs(2);
		config.outbox.delivery_interval = Duration::from_millis(50);
		config
	}

	fn runner(store: Store, adapter: Arc<DemoAdapter>, health: HealthState) -> Runner {
		Runner::new(RunnerParts {
			config: config(),
			store,
			kv: Arc::new(MemoryKv::new()),
			adapter,
			wallet_sink: Arc::new(RecordingWalletSink::default()),
			credits: CreditsReporter::disabled(),
			health,
		})
	}

	async fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
		let start = Instant::now();
		while start.elapsed() < deadline {
			if done() {
				return true;
			}
			tokio::time::sleep(Duration::from_millis(25)).await;
		}
		done()
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn polled_command_is_answered_end_to_end() {
		let store = seeded_store().await;
		let adapter = Arc::new(DemoAdapter::new(Platform::Twitch, IngestMode::Poll));
		adapter.set_live("111", Some(LiveHandle::new("stream-1")));
		adapter.push_page("111", MessagePage::default());
		adapter.push_page(
			"111",
			MessagePage {
				messages: vec![chat("m1", "u1", "viewer", "!discord")],
				..MessagePage::default()
			},
		);

		let health = HealthState::new();
		let runner = runner(store, adapter.clone(), health.clone());
		let channels = runner.channels();
		let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
		let handle = tokio::spawn(runner.run(async {
			let _ = stop_rx.await;
		}));

		assert!(wait_for(Duration::from_secs(5), || !adapter.sent().is_empty()).await);
		assert_eq!(adapter.sent()[0].text, "discord.gg/memes");
		assert_eq!(channels.len(), 1);
		assert!(health.is_ready());

		let _ = stop_tx.send(());
		handle.await.expect("join").expect("run");
		assert!(!health.is_ready());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
	async fn pushed_chat_is_routed_to_its_channel() {
		let store = seeded_store().await;
		let adapter = Arc::new(DemoAdapter::new(Platform::Twitch, IngestMode::Push));
		let (tx, rx) = mpsc::channel(16);
		let runner = runner(store, adapter.clone(), HealthState::new()).with_push(rx, None);
		let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
		let handle = tokio::spawn(runner.run(async {
			let _ = stop_rx.await;
		}));

		tx.send(PushEvent {
			platform: Platform::Twitch,
			platform_channel_id: "111".parse().expect("platform channel id"),
			kind: PushEventKind::Chat(chat("m1", "u1", "viewer", "!discord")),
		})
		.await
		.expect("send");

		assert!(wait_for(Duration::from_secs(5), || !adapter.sent().is_empty()).await);
		let _ = stop_tx.send(());
		handle.await.expect("join").expect("run");
	}
}
