#![forbid(unsafe_code)]

mod adapters;
mod bot;
mod config;
mod health;
mod kv;
mod store;
mod util;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, anyhow};
use memebot_domain::Platform;
use memebot_platform::kick::{KickAdapter, KickConfig};
use memebot_platform::token::OAuthClient;
use memebot_platform::trovo::{TrovoAdapter, TrovoConfig};
use memebot_platform::twitch::{TwitchAdapter, TwitchConfig};
use memebot_platform::vkvideo::{VkVideoAdapter, VkVideoConfig};
use memebot_platform::webhook::{WebhookConfig, WebhookReceiver};
use memebot_platform::youtube::{YouTubeAdapter, YouTubeConfig};
use memebot_platform::{ChatPlatform, IngestMode, PushEvent, TokenProvider};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::bot::credits::CreditsReporter;
use crate::bot::notify::{HttpWalletSink, LogWalletSink, WalletSink};
use crate::bot::runner::{Runner, RunnerParts};
use crate::config::RunnerConfig;
use crate::health::{HealthState, spawn_health_server};
use crate::kv::{KvStore, MemoryKv, RedisKv};
use crate::store::Store;

/// Dev-only demo adapter enable flag.
const MEMEBOT_ENABLE_DEMO_ADAPTER_ENV: &str = "MEMEBOT_ENABLE_DEMO_ADAPTER";

const PUSH_QUEUE_CAPACITY: usize = 1024;

struct Args {
	platform: Platform,
	config_path: Option<PathBuf>,
}

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: memebot_runner --platform <twitch|youtube|kick|vkvideo|trovo> [--config path]\n\
\n\
Options:\n\
\t--platform  Platform served by this process\n\
\t--config    Config file (default: ~/.memebot/config.toml)\n\
\t--help      Show this help\n\
"
	);
	std::process::exit(2)
}

fn parse_args() -> Args {
	let mut platform = None;
	let mut config_path = None;

	let mut it = std::env::args().skip(1);
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => usage_and_exit(),
			"--platform" | "-p" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				match v.parse::<Platform>() {
					Ok(p) => platform = Some(p),
					Err(e) => {
						eprintln!("{e}");
						usage_and_exit();
					}
				}
			}
			"--config" | "-c" => {
				let v = it.next().unwrap_or_else(|| usage_and_exit());
				if v.trim().is_empty() {
					eprintln!("--config must be non-empty");
					usage_and_exit();
				}
				config_path = Some(PathBuf::from(v));
			}
			other => {
				eprintln!("Unknown argument: {other}");
				usage_and_exit();
			}
		}
	}

	let Some(platform) = platform else {
		eprintln!("--platform is required");
		usage_and_exit();
	};
	Args { platform, config_path }
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,memebot_runner=debug".to_string());

	let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
		.ok()
		.map(|v| v.trim().to_string())
		.filter(|v| !v.is_empty());
	let base = tracing_subscriber::registry()
		.with(tracing_subscriber::EnvFilter::new(filter))
		.with(tracing_subscriber::fmt::layer().with_target(false));

	if let Some(endpoint) = otlp_endpoint {
		use opentelemetry::global;
		use opentelemetry::trace::TracerProvider as _;
		use opentelemetry_otlp::WithExportConfig;

		match opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(endpoint.clone())
			.build()
		{
			Ok(exporter) => {
				let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
					.with_batch_exporter(exporter)
					.build();
				let tracer = tracer_provider.tracer("memebot_runner");
				global::set_tracer_provider(tracer_provider);

				let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
				base.with(otel_layer).init();
				info!(endpoint = %endpoint, "otlp tracing enabled");
			}
			Err(e) => {
				base.init();
				warn!(error = %e, "failed to initialize otlp tracing");
			}
		}
	} else {
		base.init();
	}
}

fn init_metrics(bind: Option<&str>) {
	let Some(bind) = bind else {
		return;
	};

	match bind.parse::<SocketAddr>() {
		Ok(addr) => {
			if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new()
				.with_http_listener(addr)
				.install()
			{
				warn!(error = %e, "failed to start metrics exporter");
			} else {
				info!(%addr, "metrics exporter listening");
			}
		}
		Err(e) => {
			warn!(error = %e, %bind, "invalid metrics bind address (expected host:port)");
		}
	}
}

fn demo_adapter_enabled() -> bool {
	cfg!(debug_assertions)
		&& std::env::var(MEMEBOT_ENABLE_DEMO_ADAPTER_ENV)
			.map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
			.unwrap_or(false)
}

fn oauth_clients(cfg: &RunnerConfig) -> HashMap<Platform, OAuthClient> {
	let mut clients = HashMap::new();
	for platform in Platform::ALL {
		let settings = cfg.platform(platform);
		let (Some(client_id), Some(client_secret)) = (settings.client_id, settings.client_secret) else {
			continue;
		};
		clients.insert(
			platform,
			OAuthClient {
				client_id,
				client_secret,
				required_scopes: settings.required_scopes,
			},
		);
	}
	clients
}

fn build_adapter(platform: Platform, cfg: &RunnerConfig, tokens: Arc<TokenProvider>) -> anyhow::Result<Arc<dyn ChatPlatform>> {
	if demo_adapter_enabled() {
		info!(env = MEMEBOT_ENABLE_DEMO_ADAPTER_ENV, %platform, "starting dev-only demo adapter (enabled by env)");
		return Ok(Arc::new(adapters::DemoAdapter::generating(platform)));
	}

	let request_timeout = cfg.runner.request_timeout;
	let base_url = cfg.platform(platform).base_url;
	let adapter: Arc<dyn ChatPlatform> = match platform {
		Platform::Twitch => {
			let mut c = TwitchConfig {
				request_timeout,
				..TwitchConfig::default()
			};
			if let Some(url) = base_url {
				c.helix_base_url = url;
			}
			Arc::new(TwitchAdapter::new(c, tokens)?)
		}
		Platform::YouTube => {
			let mut c = YouTubeConfig {
				request_timeout,
				..YouTubeConfig::default()
			};
			if let Some(url) = base_url {
				c.base_url = url;
			}
			Arc::new(YouTubeAdapter::new(c, tokens)?)
		}
		Platform::Kick => {
			let mut c = KickConfig {
				request_timeout,
				..KickConfig::default()
			};
			if let Some(url) = base_url {
				c.base_url = url;
			}
			Arc::new(KickAdapter::new(c, tokens)?)
		}
		Platform::VkVideo => {
			let mut c = VkVideoConfig {
				request_timeout,
				..VkVideoConfig::default()
			};
			if let Some(url) = base_url {
				c.base_url = url;
			}
			Arc::new(VkVideoAdapter::new(c, tokens)?)
		}
		Platform::Trovo => {
			let mut c = TrovoConfig {
				request_timeout,
				..TrovoConfig::default()
			};
			if let Some(url) = base_url {
				c.base_url = url;
			}
			Arc::new(TrovoAdapter::new(c, tokens)?)
		}
	};
	Ok(adapter)
}

fn build_wallet_sink(cfg: &RunnerConfig) -> anyhow::Result<Arc<dyn WalletSink>> {
	match cfg.notify.wallet_url.as_deref() {
		Some(url) => Ok(Arc::new(HttpWalletSink::new(
			url,
			cfg.notify.wallet_secret.clone(),
			cfg.runner.request_timeout,
		)?)),
		None => {
			info!("no wallet url configured; wallet updates are logged only");
			Ok(Arc::new(LogWalletSink))
		}
	}
}

fn build_credits(cfg: &RunnerConfig) -> anyhow::Result<CreditsReporter> {
	match cfg.credits.base_url.as_deref() {
		Some(url) => CreditsReporter::new(url, cfg.credits.token.clone(), cfg.runner.request_timeout),
		None => Ok(CreditsReporter::disabled()),
	}
}

fn build_webhook(cfg: &RunnerConfig, events_tx: mpsc::Sender<PushEvent>) -> anyhow::Result<Option<WebhookReceiver>> {
	let Some(bind) = cfg.webhook.bind.as_deref() else {
		return Ok(None);
	};
	let bind: SocketAddr = bind
		.parse()
		.with_context(|| format!("invalid webhook bind address {bind} (expected host:port)"))?;

	let kick_public_key = match cfg.webhook.kick_public_key_path.as_deref() {
		Some(path) => Some(
			std::fs::read_to_string(path).with_context(|| format!("read kick public key {}", path.display()))?,
		),
		None => None,
	};

	let receiver = WebhookReceiver::new(
		WebhookConfig {
			bind,
			twitch_secret: cfg.webhook.twitch_secret.clone(),
			kick_public_key,
			kick_verify: cfg.webhook.kick_verify,
			..WebhookConfig::default()
		},
		events_tx,
	)?;
	info!(%bind, "webhook receiver configured");
	Ok(Some(receiver))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();

	let args = parse_args();

	let config_path = match args.config_path {
		Some(path) => path,
		None => crate::config::default_config_path()?,
	};
	let cfg = crate::config::load_runner_config_from_path(&config_path)?;
	info!(path = %config_path.display(), platform = %args.platform, "loaded runner config (toml + env overrides)");

	init_metrics(cfg.runner.metrics_bind.as_deref());

	let health_state = HealthState::new();
	if let Some(bind) = cfg.runner.health_bind.as_deref() {
		match bind.parse::<SocketAddr>() {
			Ok(addr) => {
				spawn_health_server(addr, health_state.clone());
				info!(%addr, "health server listening");
			}
			Err(e) => warn!(error = %e, %bind, "invalid health bind address (expected host:port)"),
		}
	}

	let database_url = cfg
		.database
		.url
		.as_deref()
		.ok_or_else(|| anyhow!("no database url configured (database.url or MEMEBOT_DATABASE_URL)"))?;
	let store = Store::connect(database_url, cfg.database.run_migrations, cfg.database.max_connections).await?;

	let kv: Arc<dyn KvStore> = match cfg.kv.redis_url.as_deref() {
		Some(url) => Arc::new(RedisKv::connect(url).await?),
		None => {
			warn!("no redis url configured; rate limits and dedup are local to this process");
			Arc::new(MemoryKv::new())
		}
	};

	let tokens = Arc::new(TokenProvider::with_http(Arc::new(store.clone()), oauth_clients(&cfg))?);
	let adapter = build_adapter(args.platform, &cfg, tokens)?;

	let parts = RunnerParts {
		wallet_sink: build_wallet_sink(&cfg)?,
		credits: build_credits(&cfg)?,
		store,
		kv,
		adapter: adapter.clone(),
		health: health_state,
		config: cfg.clone(),
	};
	let mut runner = Runner::new(parts);

	if adapter.ingest_mode() == IngestMode::Push {
		let (events_tx, events_rx) = mpsc::channel(PUSH_QUEUE_CAPACITY);
		let webhook = build_webhook(&cfg, events_tx)?;
		if webhook.is_none() {
			warn!(platform = %args.platform, "push platform without webhook bind; only live checks will run");
		}
		runner = runner.with_push(events_rx, webhook);
	}

	runner
		.run(async {
			if let Err(e) = tokio::signal::ctrl_c().await {
				warn!(error = %e, "failed to listen for ctrl-c");
				std::future::pending::<()>().await;
			}
		})
		.await
}
