#![forbid(unsafe_code)]

//! Reports chatters to the end-credits service. Fire and forget; failures only log.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use memebot_domain::{ChannelId, Platform};
use memebot_platform::http::build_http_client;
use memebot_platform::{SecretString, UserRef};
use serde::Serialize;
use tracing::debug;

const CHATTER_PATH: &str = "/internal/credits/chatter";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatterSeen {
	pub platform: Platform,
	pub channel_id: String,
	pub user_id: String,
	pub login: String,
	pub display_name: Option<String>,
	pub seen_at: i64,
}

struct Endpoint {
	http: reqwest::Client,
	url: String,
	token: Option<SecretString>,
}

#[derive(Clone)]
pub struct CreditsReporter {
	endpoint: Option<Arc<Endpoint>>,
}

impl CreditsReporter {
	pub fn disabled() -> Self {
		Self { endpoint: None }
	}

	pub fn new(base_url: &str, token: Option<SecretString>, timeout: Duration) -> anyhow::Result<Self> {
		let base = base_url.trim().trim_end_matches('/');
		if base.is_empty() {
			return Err(anyhow!("credits base url is empty"));
		}
		Ok(Self {
			endpoint: Some(Arc::new(Endpoint {
				http: build_http_client("memebot/0.x (credits)", timeout)?,
				url: format!("{base}{CHATTER_PATH}"),
				token,
			})),
		})
	}

	pub fn is_enabled(&self) -> bool {
		self.endpoint.is_some()
	}

	/// Spawn the report; never blocks the caller.
	pub fn chatter_seen(&self, platform: Platform, channel_id: &ChannelId, author: &UserRef, seen_at_ms: i64) {
		let Some(endpoint) = self.endpoint.clone() else {
			return;
		};
		let payload = ChatterSeen {
			platform,
			channel_id: channel_id.to_string(),
			user_id: author.id.clone(),
			login: author.login.clone(),
			display_name: author.display.clone(),
			seen_at: seen_at_ms,
		};
		tokio::spawn(async move {
			if let Err(e) = endpoint.post(&payload).await {
				debug!(channel_id = %payload.channel_id, user_id = %payload.user_id, error = %e, "credits report failed");
				metrics::counter!("memebot_credits_failures_total", "platform" => payload.platform.as_str()).increment(1);
			}
		});
	}
}

impl Endpoint {
	async fn post(&self, payload: &ChatterSeen) -> anyhow::Result<()> {
		let mut req = self.http.post(&self.url).json(payload);
		if let Some(token) = self.token.as_ref() {
			req = req.bearer_auth(token.expose());
		}
		let resp = req.send().await.context("post chatter")?;
		let status = resp.status();
		if !status.is_success() {
			return Err(anyhow!("credits service rejected chatter: status={status}"));
		}
		Ok(())
	}
}
