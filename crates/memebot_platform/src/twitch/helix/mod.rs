#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::PlatformError;
use crate::http::{build_http_client, send_for_json};

const STREAMS_PATH: &str = "/helix/streams";
const CHAT_MESSAGES_PATH: &str = "/helix/chat/messages";
const USERS_PATH: &str = "/helix/users";

#[derive(Clone, Debug)]
pub(crate) struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
}

#[derive(Debug, Serialize)]
struct HelixSendChatMessage<'a> {
	broadcaster_id: &'a str,
	sender_id: &'a str,
	message: &'a str,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixData<T> {
	pub(crate) data: Vec<T>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HelixStream {
	pub(crate) id: String,
	#[serde(default)]
	pub(crate) started_at: Option<String>,
	#[serde(default)]
	pub(crate) viewer_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixSendChatResult {
	#[serde(default)]
	pub(crate) is_sent: bool,
	#[serde(default)]
	pub(crate) drop_reason: Option<HelixDropReason>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HelixDropReason {
	pub(crate) code: String,
	#[serde(default)]
	pub(crate) message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct HelixUser {
	pub(crate) id: String,
	pub(crate) login: String,
}

impl HelixClient {
	pub(crate) fn new(base_url: Url, client_id: String, timeout: Duration) -> anyhow::Result<Self> {
		Ok(Self {
			http: build_http_client("memebot/0.x (helix)", timeout)?,
			base_url,
			client_id,
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder, bearer: &str) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {bearer}"))
	}

	fn url(&self, path_and_query: &str) -> anyhow::Result<Url> {
		self.base_url.join(path_and_query).context("join helix url")
	}

	pub(crate) async fn get_stream(&self, bearer: &str, broadcaster_id: &str) -> Result<Option<HelixStream>, PlatformError> {
		let url = self.url(&format!(
			"{STREAMS_PATH}?user_id={}&type=live",
			urlencoding::encode(broadcaster_id)
		))?;
		let resp: HelixData<HelixStream> =
			send_for_json(self.authed(self.http.get(url), bearer), "helix GET /helix/streams").await?;
		Ok(resp.data.into_iter().next())
	}

	pub(crate) async fn get_user_by_login(&self, bearer: &str, login: &str) -> Result<Option<HelixUser>, PlatformError> {
		let url = self.url(&format!("{USERS_PATH}?login={}", urlencoding::encode(login)))?;
		let resp: HelixData<HelixUser> =
			send_for_json(self.authed(self.http.get(url), bearer), "helix GET /helix/users").await?;
		Ok(resp.data.into_iter().next())
	}

	pub(crate) async fn send_chat_message(
		&self,
		bearer: &str,
		broadcaster_id: &str,
		sender_id: &str,
		message: &str,
	) -> Result<(), PlatformError> {
		let url = self.url(CHAT_MESSAGES_PATH)?;
		let req = HelixSendChatMessage {
			broadcaster_id,
			sender_id,
			message,
		};
		let resp: HelixData<HelixSendChatResult> = send_for_json(
			self.authed(self.http.post(url), bearer).json(&req),
			"helix POST /helix/chat/messages",
		)
		.await?;

		match resp.data.into_iter().next() {
			Some(result) if result.is_sent => Ok(()),
			Some(HelixSendChatResult {
				drop_reason: Some(reason),
				..
			}) if reason.code.contains("rate_limit") => Err(PlatformError::RateLimited { retry_after: None }),
			Some(HelixSendChatResult {
				drop_reason: Some(reason),
				..
			}) => Err(PlatformError::other(format!(
				"helix chat message dropped: code={} message={}",
				reason.code, reason.message
			))),
			_ => Err(PlatformError::other("helix chat message not sent")),
		}
	}
}
