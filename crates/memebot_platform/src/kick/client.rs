#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::PlatformError;
use crate::http::{build_http_client, error_for_status, send_for_json, send_with_retry};

#[derive(Debug, Clone)]
pub struct KickClient {
	base_url: String,
	client: reqwest::Client,
}

impl KickClient {
	pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
		Ok(Self {
			base_url: base_url.into(),
			client: build_http_client("memebot/0.x (kick)", timeout)?,
		})
	}

	fn url(&self, path: &str) -> String {
		format!("{}{}", self.base_url.trim_end_matches('/'), path)
	}

	fn auth_header(access_token: &str) -> Result<String, PlatformError> {
		if access_token.trim().is_empty() {
			return Err(PlatformError::Auth("missing kick access token".to_string()));
		}
		Ok(format!("Bearer {}", access_token.trim()))
	}

	pub async fn send_chat_message(
		&self,
		access_token: &str,
		broadcaster_user_id: u64,
		content: &str,
	) -> Result<(), PlatformError> {
		let body = KickPostChatRequest {
			broadcaster_user_id,
			content: content.to_string(),
			type_field: "user".to_string(),
		};

		let resp = send_with_retry(
			self.client
				.post(self.url("/public/v1/chat"))
				.header("Authorization", Self::auth_header(access_token)?)
				.json(&body),
			"kick send chat",
		)
		.await?;

		match resp.status() {
			StatusCode::OK | StatusCode::CREATED => Ok(()),
			status => {
				let headers = resp.headers().clone();
				let body = resp.text().await.unwrap_or_default();
				Err(error_for_status("kick send chat", status, &headers, &body))
			}
		}
	}

	/// Current livestream of the broadcaster, `None` when offline.
	pub async fn get_livestream(
		&self,
		access_token: &str,
		broadcaster_user_id: u64,
	) -> Result<Option<KickLivestream>, PlatformError> {
		let req = self
			.client
			.get(self.url(&format!("/public/v1/livestreams?broadcaster_user_id={broadcaster_user_id}")))
			.header("Authorization", Self::auth_header(access_token)?);
		let body: KickDataResponse<KickLivestream> = send_for_json(req, "kick get livestreams").await?;
		Ok(body.data.into_iter().next())
	}

	pub async fn resolve_broadcaster_id(&self, access_token: &str, slug: &str) -> Result<Option<u64>, PlatformError> {
		let req = self
			.client
			.get(self.url(&format!("/public/v1/channels?slug={}", urlencoding::encode(slug))))
			.header("Authorization", Self::auth_header(access_token)?);
		let resp = send_with_retry(req, "kick get channels").await?;

		if resp.status() == StatusCode::NOT_FOUND {
			return Ok(None);
		}
		if !resp.status().is_success() {
			let status = resp.status();
			let headers = resp.headers().clone();
			let body = resp.text().await.unwrap_or_default();
			return Err(error_for_status("kick get channels", status, &headers, &body));
		}

		let body: KickDataResponse<KickChannelData> = resp.json().await.context("parse kick channels response")?;
		Ok(body
			.data
			.into_iter()
			.find(|c| c.slug.eq_ignore_ascii_case(slug))
			.map(|c| c.broadcaster_user_id))
	}
}

#[derive(Debug, serde::Serialize)]
struct KickPostChatRequest {
	broadcaster_user_id: u64,
	content: String,
	#[serde(rename = "type")]
	type_field: String,
}

#[derive(Debug, Deserialize)]
struct KickDataResponse<T> {
	#[serde(default = "Vec::new")]
	data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct KickChannelData {
	broadcaster_user_id: u64,
	slug: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KickLivestream {
	#[serde(default)]
	pub broadcaster_user_id: Option<u64>,
	#[serde(default)]
	pub started_at: Option<String>,
	#[serde(default)]
	pub viewer_count: Option<u64>,
}
