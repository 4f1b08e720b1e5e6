#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use memebot_platform::SecretString;
use memebot_platform::http::build_http_client;
use serde::Serialize;
use tracing::info;

const SECRET_HEADER: &str = "X-Internal-Secret";

/// "A wallet changed", emitted once per claimed grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletUpdate {
	pub user_id: String,
	pub channel_id: String,
	pub balance: i64,
	pub delta: i64,
	pub reason: String,
	pub reward_event_id: String,
}

#[async_trait]
pub trait WalletSink: Send + Sync + 'static {
	async fn wallet_updated(&self, update: &WalletUpdate) -> anyhow::Result<()>;
}

/// Posts updates to the backend's internal endpoint.
pub struct HttpWalletSink {
	http: reqwest::Client,
	url: String,
	secret: Option<SecretString>,
}

impl HttpWalletSink {
	pub fn new(url: impl Into<String>, secret: Option<SecretString>, timeout: Duration) -> anyhow::Result<Self> {
		Ok(Self {
			http: build_http_client("memebot/0.x (wallet-notify)", timeout)?,
			url: url.into(),
			secret,
		})
	}
}

#[async_trait]
impl WalletSink for HttpWalletSink {
	async fn wallet_updated(&self, update: &WalletUpdate) -> anyhow::Result<()> {
		let mut req = self.http.post(&self.url).json(update);
		if let Some(secret) = self.secret.as_ref() {
			req = req.header(SECRET_HEADER, secret.expose());
		}
		let resp = req.send().await.context("post wallet update")?;
		let status = resp.status();
		if !status.is_success() {
			return Err(anyhow!("wallet update rejected: status={status}"));
		}
		Ok(())
	}
}

/// Used when no notification endpoint is configured.
pub struct LogWalletSink;

#[async_trait]
impl WalletSink for LogWalletSink {
	async fn wallet_updated(&self, update: &WalletUpdate) -> anyhow::Result<()> {
		info!(
			user_id = %update.user_id,
			channel_id = %update.channel_id,
			balance = update.balance,
			delta = update.delta,
			reason = %update.reason,
			reward_event_id = %update.reward_event_id,
			"wallet updated"
		);
		Ok(())
	}
}

#[cfg(test)]
#[derive(Default)]
pub struct RecordingWalletSink {
	updates: parking_lot::Mutex<Vec<WalletUpdate>>,
}

#[cfg(test)]
impl RecordingWalletSink {
	pub fn updates(&self) -> Vec<WalletUpdate> {
		self.updates.lock().clone()
	}
}

#[cfg(test)]
#[async_trait]
impl WalletSink for RecordingWalletSink {
	async fn wallet_updated(&self, update: &WalletUpdate) -> anyhow::Result<()> {
		self.updates.lock().push(update.clone());
		Ok(())
	}
}
