#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use memebot_domain::Platform;
use memebot_platform::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.memebot/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".memebot").join("config.toml"))
}

/// Load the runner config from TOML and env overrides.
pub fn load_runner_config_from_path(path: &Path) -> anyhow::Result<RunnerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = RunnerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
	pub runner: RunnerSettings,
	pub database: DatabaseSettings,
	pub kv: KvSettings,
	pub outbox: OutboxSettings,
	pub rewards: RewardSettings,
	pub notify: NotifySettings,
	pub credits: CreditsSettings,
	pub webhook: WebhookSettings,
	pub platforms: BTreeMap<Platform, PlatformSettings>,
}

impl Default for RunnerConfig {
	fn default() -> Self {
		Self::from_file(FileConfig::default())
	}
}

impl RunnerConfig {
	pub fn platform(&self, platform: Platform) -> PlatformSettings {
		self.platforms.get(&platform).cloned().unwrap_or_default()
	}
}

impl Default for RunnerSettings {
	fn default() -> Self {
		RunnerConfig::default().runner
	}
}

impl Default for OutboxSettings {
	fn default() -> Self {
		RunnerConfig::default().outbox
	}
}

impl Default for RewardSettings {
	fn default() -> Self {
		RunnerConfig::default().rewards
	}
}

/// Scheduling knobs of one runner process.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
	pub tick: Duration,
	pub max_concurrent_ticks: usize,
	pub sync_interval: Duration,
	pub live_check_interval: Duration,
	pub commands_refresh_interval: Duration,
	/// Offline gap after which a new stream session starts.
	pub break_credit: Duration,
	pub shutdown_grace: Duration,
	pub request_timeout: Duration,
	pub shard_index: u32,
	pub shard_count: u32,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
	/// Database URL (sqlite: or postgres:). Required.
	pub url: Option<String>,
	pub max_connections: u32,
	pub run_migrations: bool,
}

#[derive(Debug, Clone)]
pub struct KvSettings {
	/// Shared store for multiple runners; in-process when unset.
	pub redis_url: Option<String>,
	pub key_prefix: String,
}

#[derive(Debug, Clone)]
pub struct OutboxSettings {
	pub delivery_interval: Duration,
	pub batch_size: i64,
	pub max_attempts: i64,
	pub stale_processing: Duration,
	pub dedup_ttl: Duration,
	pub lock_ttl: Duration,
	pub channel_limit: i64,
	pub channel_window: Duration,
	pub global_limit: i64,
	pub global_window: Duration,
}

#[derive(Debug, Clone)]
pub struct RewardSettings {
	pub enabled: bool,
	/// TTL of per-session chat counters.
	pub counter_ttl: Duration,
	/// TTL of daily streak state.
	pub streak_ttl: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct NotifySettings {
	/// Wallet updates are POSTed here; log-only when unset.
	pub wallet_url: Option<String>,
	pub wallet_secret: Option<SecretString>,
}

#[derive(Debug, Clone, Default)]
pub struct CreditsSettings {
	pub base_url: Option<String>,
	pub token: Option<SecretString>,
}

#[derive(Debug, Clone, Default)]
pub struct WebhookSettings {
	/// Receiver bind address (host:port); push platforms only.
	pub bind: Option<String>,
	pub twitch_secret: Option<SecretString>,
	pub kick_public_key_path: Option<PathBuf>,
	pub kick_verify: bool,
}

/// OAuth client and endpoint overrides for one platform.
#[derive(Debug, Clone, Default)]
pub struct PlatformSettings {
	pub client_id: Option<String>,
	pub client_secret: Option<SecretString>,
	pub required_scopes: Vec<String>,
	pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	runner: FileRunnerSettings,

	#[serde(default)]
	database: FileDatabaseSettings,

	#[serde(default)]
	kv: FileKvSettings,

	#[serde(default)]
	outbox: FileOutboxSettings,

	#[serde(default)]
	rewards: FileRewardSettings,

	#[serde(default)]
	notify: FileNotifySettings,

	#[serde(default)]
	credits: FileCreditsSettings,

	#[serde(default)]
	webhook: FileWebhookSettings,

	#[serde(default)]
	twitch: FilePlatformSettings,
	#[serde(default)]
	youtube: FilePlatformSettings,
	#[serde(default)]
	kick: FilePlatformSettings,
	#[serde(default)]
	vkvideo: FilePlatformSettings,
	#[serde(default)]
	trovo: FilePlatformSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRunnerSettings {
	tick_millis: Option<u64>,
	max_concurrent_ticks: Option<usize>,
	sync_seconds: Option<u64>,
	live_check_seconds: Option<u64>,
	commands_refresh_seconds: Option<u64>,
	break_credit_seconds: Option<u64>,
	shutdown_grace_seconds: Option<u64>,
	request_timeout_ms: Option<u64>,
	shard_index: Option<u32>,
	shard_count: Option<u32>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileDatabaseSettings {
	url: Option<String>,
	max_connections: Option<u32>,
	run_migrations: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileKvSettings {
	redis_url: Option<String>,
	key_prefix: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileOutboxSettings {
	delivery_interval_millis: Option<u64>,
	batch_size: Option<i64>,
	max_attempts: Option<i64>,
	stale_processing_seconds: Option<u64>,
	dedup_ttl_seconds: Option<u64>,
	lock_ttl_millis: Option<u64>,
	channel_limit: Option<i64>,
	channel_window_seconds: Option<u64>,
	global_limit: Option<i64>,
	global_window_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileRewardSettings {
	enabled: Option<bool>,
	counter_ttl_hours: Option<u64>,
	streak_ttl_days: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileNotifySettings {
	wallet_url: Option<String>,
	wallet_secret: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileCreditsSettings {
	base_url: Option<String>,
	token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileWebhookSettings {
	bind: Option<String>,
	twitch_secret: Option<String>,
	kick_public_key_path: Option<String>,
	kick_verify: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePlatformSettings {
	client_id: Option<String>,
	client_secret: Option<String>,
	#[serde(default)]
	required_scopes: Vec<String>,
	base_url: Option<String>,
}

fn non_empty(v: Option<String>) -> Option<String> {
	v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn secret(v: Option<String>) -> Option<SecretString> {
	non_empty(v).map(SecretString::new)
}

impl PlatformSettings {
	fn from_file(file: FilePlatformSettings) -> Self {
		Self {
			client_id: non_empty(file.client_id),
			client_secret: secret(file.client_secret),
			required_scopes: file
				.required_scopes
				.into_iter()
				.map(|s| s.trim().to_string())
				.filter(|s| !s.is_empty())
				.collect(),
			base_url: non_empty(file.base_url),
		}
	}
}

impl RunnerConfig {
	fn from_file(file: FileConfig) -> Self {
		let shard_count = file.runner.shard_count.unwrap_or(1).max(1);
		let runner = RunnerSettings {
			tick: Duration::from_millis(file.runner.tick_millis.unwrap_or(1000).max(50)),
			max_concurrent_ticks: file.runner.max_concurrent_ticks.unwrap_or(16).max(1),
			sync_interval: Duration::from_secs(file.runner.sync_seconds.unwrap_or(30).max(1)),
			live_check_interval: Duration::from_secs(file.runner.live_check_seconds.unwrap_or(30).max(1)),
			commands_refresh_interval: Duration::from_secs(file.runner.commands_refresh_seconds.unwrap_or(60).max(1)),
			break_credit: Duration::from_secs(file.runner.break_credit_seconds.unwrap_or(600)),
			shutdown_grace: Duration::from_secs(file.runner.shutdown_grace_seconds.unwrap_or(10)),
			request_timeout: Duration::from_millis(file.runner.request_timeout_ms.unwrap_or(10_000).max(100)),
			shard_index: file.runner.shard_index.unwrap_or(0) % shard_count,
			shard_count,
			metrics_bind: non_empty(file.runner.metrics_bind),
			health_bind: non_empty(file.runner.health_bind),
		};

		let outbox = OutboxSettings {
			delivery_interval: Duration::from_millis(file.outbox.delivery_interval_millis.unwrap_or(1000).max(50)),
			batch_size: file.outbox.batch_size.unwrap_or(50).max(1),
			max_attempts: file.outbox.max_attempts.unwrap_or(3).max(1),
			stale_processing: Duration::from_secs(file.outbox.stale_processing_seconds.unwrap_or(60).max(1)),
			dedup_ttl: Duration::from_secs(file.outbox.dedup_ttl_seconds.unwrap_or(30).max(1)),
			lock_ttl: Duration::from_millis(file.outbox.lock_ttl_millis.unwrap_or(15_000).max(100)),
			channel_limit: file.outbox.channel_limit.unwrap_or(20).max(1),
			channel_window: Duration::from_secs(file.outbox.channel_window_seconds.unwrap_or(30).max(1)),
			global_limit: file.outbox.global_limit.unwrap_or(100).max(1),
			global_window: Duration::from_secs(file.outbox.global_window_seconds.unwrap_or(30).max(1)),
		};

		let mut platforms = BTreeMap::new();
		platforms.insert(Platform::Twitch, PlatformSettings::from_file(file.twitch));
		platforms.insert(Platform::YouTube, PlatformSettings::from_file(file.youtube));
		platforms.insert(Platform::Kick, PlatformSettings::from_file(file.kick));
		platforms.insert(Platform::VkVideo, PlatformSettings::from_file(file.vkvideo));
		platforms.insert(Platform::Trovo, PlatformSettings::from_file(file.trovo));

		Self {
			runner,
			database: DatabaseSettings {
				url: non_empty(file.database.url),
				max_connections: file.database.max_connections.unwrap_or(10).max(1),
				run_migrations: file.database.run_migrations.unwrap_or(true),
			},
			kv: KvSettings {
				redis_url: non_empty(file.kv.redis_url),
				key_prefix: non_empty(file.kv.key_prefix).unwrap_or_else(|| "memebot".to_string()),
			},
			outbox,
			rewards: RewardSettings {
				enabled: file.rewards.enabled.unwrap_or(true),
				counter_ttl: Duration::from_secs(file.rewards.counter_ttl_hours.unwrap_or(24).max(1) * 3600),
				streak_ttl: Duration::from_secs(file.rewards.streak_ttl_days.unwrap_or(3).max(2) * 86_400),
			},
			notify: NotifySettings {
				wallet_url: non_empty(file.notify.wallet_url),
				wallet_secret: secret(file.notify.wallet_secret),
			},
			credits: CreditsSettings {
				base_url: non_empty(file.credits.base_url),
				token: secret(file.credits.token),
			},
			webhook: WebhookSettings {
				bind: non_empty(file.webhook.bind),
				twitch_secret: secret(file.webhook.twitch_secret),
				kick_public_key_path: non_empty(file.webhook.kick_public_key_path).map(PathBuf::from),
				kick_verify: file.webhook.kick_verify.unwrap_or(true),
			},
			platforms,
		}
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => Ok(Some(parse_toml(&s)?)),
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn parse_toml(s: &str) -> anyhow::Result<FileConfig> {
	toml::from_str(s).context("parse TOML")
}

fn apply_env_overrides(cfg: &mut RunnerConfig) {
	apply_overrides(cfg, |name| std::env::var(name).ok());
}

fn env_prefix(platform: Platform) -> &'static str {
	match platform {
		Platform::Twitch => "MEMEBOT_TWITCH",
		Platform::YouTube => "MEMEBOT_YOUTUBE",
		Platform::Kick => "MEMEBOT_KICK",
		Platform::VkVideo => "MEMEBOT_VKVIDEO",
		Platform::Trovo => "MEMEBOT_TROVO",
	}
}

/// Apply `MEMEBOT_*` overrides read through `lookup`.
fn apply_overrides(cfg: &mut RunnerConfig, lookup: impl Fn(&str) -> Option<String>) {
	let string = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = string("MEMEBOT_DATABASE_URL") {
		cfg.database.url = Some(v);
		info!("database config: url overridden by env");
	}

	if let Some(v) = string("MEMEBOT_RUN_MIGRATIONS")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.database.run_migrations = enabled;
		info!(enabled, "database config: run_migrations overridden by env");
	}

	if let Some(v) = string("MEMEBOT_REDIS_URL") {
		cfg.kv.redis_url = Some(v);
		info!("kv config: redis_url overridden by env");
	}

	if let Some(v) = string("MEMEBOT_METRICS_BIND") {
		cfg.runner.metrics_bind = Some(v);
		info!("runner config: metrics_bind overridden by env");
	}

	if let Some(v) = string("MEMEBOT_HEALTH_BIND") {
		cfg.runner.health_bind = Some(v);
		info!("runner config: health_bind overridden by env");
	}

	if let Some(v) = string("MEMEBOT_TICK_MILLIS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.runner.tick = Duration::from_millis(ms.max(50));
		info!(ms, "runner config: tick_millis overridden by env");
	}

	if let Some(v) = string("MEMEBOT_SHARD_COUNT")
		&& let Ok(count) = v.parse::<u32>()
	{
		cfg.runner.shard_count = count.max(1);
		info!(count, "runner config: shard_count overridden by env");
	}

	if let Some(v) = string("MEMEBOT_SHARD_INDEX")
		&& let Ok(index) = v.parse::<u32>()
	{
		cfg.runner.shard_index = index;
		info!(index, "runner config: shard_index overridden by env");
	}

	if let Some(v) = string("MEMEBOT_OUTBOX_MAX_ATTEMPTS")
		&& let Ok(attempts) = v.parse::<i64>()
	{
		cfg.outbox.max_attempts = attempts.max(1);
		info!(attempts, "outbox config: max_attempts overridden by env");
	}

	if let Some(v) = string("MEMEBOT_REWARDS_ENABLED")
		&& let Some(enabled) = parse_env_bool(&v)
	{
		cfg.rewards.enabled = enabled;
		info!(enabled, "rewards config: enabled overridden by env");
	}

	if let Some(v) = string("MEMEBOT_WALLET_NOTIFY_URL") {
		cfg.notify.wallet_url = Some(v);
		info!("notify config: wallet_url overridden by env");
	}

	if let Some(v) = string("MEMEBOT_WALLET_NOTIFY_SECRET") {
		cfg.notify.wallet_secret = Some(SecretString::new(v));
		info!("notify config: wallet_secret overridden by env");
	}

	if let Some(v) = string("MEMEBOT_CREDITS_BASE_URL") {
		cfg.credits.base_url = Some(v);
		info!("credits config: base_url overridden by env");
	}

	if let Some(v) = string("MEMEBOT_CREDITS_TOKEN") {
		cfg.credits.token = Some(SecretString::new(v));
		info!("credits config: token overridden by env");
	}

	if let Some(v) = string("MEMEBOT_WEBHOOK_BIND") {
		cfg.webhook.bind = Some(v);
		info!("webhook config: bind overridden by env");
	}

	if let Some(v) = string("MEMEBOT_TWITCH_EVENTSUB_SECRET") {
		cfg.webhook.twitch_secret = Some(SecretString::new(v));
		info!("webhook config: twitch_secret overridden by env");
	}

	if let Some(v) = string("MEMEBOT_KICK_PUBLIC_KEY_PATH") {
		cfg.webhook.kick_public_key_path = Some(PathBuf::from(v));
		info!("webhook config: kick_public_key_path overridden by env");
	}

	if let Some(v) = string("MEMEBOT_KICK_VERIFY_SIGNATURES")
		&& let Some(verify) = parse_env_bool(&v)
	{
		cfg.webhook.kick_verify = verify;
		info!(verify, "webhook config: kick_verify overridden by env");
	}

	for platform in Platform::ALL {
		let prefix = env_prefix(platform);
		let settings = cfg.platforms.entry(platform).or_default();

		if let Some(v) = string(&format!("{prefix}_CLIENT_ID")) {
			settings.client_id = Some(v);
			info!(%platform, "platform config: client_id overridden by env");
		}

		if let Some(v) = string(&format!("{prefix}_CLIENT_SECRET")) {
			settings.client_secret = Some(SecretString::new(v));
			info!(%platform, "platform config: client_secret overridden by env");
		}

		if let Some(v) = string(&format!("{prefix}_BASE_URL")) {
			settings.base_url = Some(v);
			info!(%platform, "platform config: base_url overridden by env");
		}
	}

	if cfg.runner.shard_index >= cfg.runner.shard_count {
		warn!(
			shard_index = cfg.runner.shard_index,
			shard_count = cfg.runner.shard_count,
			"runner config: shard_index out of range; wrapping"
		);
		cfg.runner.shard_index %= cfg.runner.shard_count;
	}
}

#[cfg(test)]
mod tests {
	use std::collections::HashMap;

	use super::*;

	#[test]
	fn defaults_without_a_file() {
		let cfg = RunnerConfig::default();
		assert_eq!(cfg.runner.tick, Duration::from_millis(1000));
		assert_eq!(cfg.runner.max_concurrent_ticks, 16);
		assert_eq!(cfg.runner.request_timeout, Duration::from_secs(10));
		assert_eq!(cfg.outbox.max_attempts, 3);
		assert_eq!(cfg.runner.shard_count, 1);
		assert!(cfg.database.url.is_none());
		assert!(cfg.database.run_migrations);
		assert!(cfg.webhook.kick_verify);
		assert_eq!(cfg.kv.key_prefix, "memebot");
	}

	#[test]
	fn toml_sections_are_read() {
		let file = parse_toml(
			r#"
			[runner]
			tick_millis = 250
			shard_index = 5
			shard_count = 4

			[database]
			url = "sqlite://memebot.db"

			[outbox]
			channel_limit = 10
			max_attempts = 5

			[twitch]
			client_id = "abc"
			client_secret = "shh"
			required_scopes = ["user:write:chat", " "]
			"#,
		)
		.expect("parse");
		let cfg = RunnerConfig::from_file(file);
		assert_eq!(cfg.runner.tick, Duration::from_millis(250));
		assert_eq!(cfg.runner.shard_index, 1);
		assert_eq!(cfg.database.url.as_deref(), Some("sqlite://memebot.db"));
		assert_eq!(cfg.outbox.channel_limit, 10);
		assert_eq!(cfg.outbox.max_attempts, 5);

		let twitch = cfg.platform(Platform::Twitch);
		assert_eq!(twitch.client_id.as_deref(), Some("abc"));
		assert_eq!(twitch.client_secret.as_ref().map(|s| s.expose()), Some("shh"));
		assert_eq!(twitch.required_scopes, vec!["user:write:chat".to_string()]);
		assert!(cfg.platform(Platform::Trovo).client_id.is_none());
	}

	#[test]
	fn bad_value_types_are_rejected() {
		assert!(parse_toml("[runner]\ntick_millis = \"fast\"").is_err());
		assert!(parse_toml("[extra]\nkey = 1").is_ok());
	}

	#[test]
	fn env_overrides_win() {
		let env: HashMap<&str, &str> = HashMap::from([
			("MEMEBOT_DATABASE_URL", " postgres://db/memebot "),
			("MEMEBOT_KICK_CLIENT_ID", "kick-client"),
			("MEMEBOT_OUTBOX_MAX_ATTEMPTS", "7"),
			("MEMEBOT_REWARDS_ENABLED", "off"),
			("MEMEBOT_SHARD_COUNT", "2"),
			("MEMEBOT_SHARD_INDEX", "3"),
			("MEMEBOT_WEBHOOK_BIND", ""),
		]);
		let mut cfg = RunnerConfig::default();
		apply_overrides(&mut cfg, |name| env.get(name).map(|v| v.to_string()));

		assert_eq!(cfg.database.url.as_deref(), Some("postgres://db/memebot"));
		assert_eq!(cfg.platform(Platform::Kick).client_id.as_deref(), Some("kick-client"));
		assert_eq!(cfg.outbox.max_attempts, 7);
		assert!(!cfg.rewards.enabled);
		assert_eq!(cfg.runner.shard_count, 2);
		assert_eq!(cfg.runner.shard_index, 1);
		assert!(cfg.webhook.bind.is_none());
	}

	#[test]
	fn env_bools() {
		assert_eq!(parse_env_bool("YES"), Some(true));
		assert_eq!(parse_env_bool("0"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}
}
