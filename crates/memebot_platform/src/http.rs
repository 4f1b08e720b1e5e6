#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;

use crate::PlatformError;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared client builder: every outbound platform call carries a fixed deadline.
pub fn build_http_client(user_agent: &str, timeout: Duration) -> anyhow::Result<reqwest::Client> {
	reqwest::Client::builder()
		.user_agent(user_agent)
		.timeout(timeout)
		.connect_timeout(timeout.min(Duration::from_secs(5)))
		.build()
		.context("build reqwest client")
}

pub fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

/// Map a non-success response to an error class.
pub fn error_for_status(label: &str, status: StatusCode, headers: &HeaderMap, body: &str) -> PlatformError {
	match status {
		StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
			PlatformError::Auth(format!("{label} failed: status={status} body={}", clip(body)))
		}
		StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited {
			retry_after: retry_delay_from_headers(headers),
		},
		_ => PlatformError::Other(anyhow!("{label} failed: status={status} body={}", clip(body))),
	}
}

/// Send once, retrying a single time on a server error.
pub async fn send_with_retry(req: reqwest::RequestBuilder, label: &str) -> Result<reqwest::Response, PlatformError> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("{label} send"))?;

	if resp.status().is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		let retry_resp = retry.send().await.with_context(|| format!("{label} retry send"))?;
		return Ok(retry_resp);
	}

	Ok(resp)
}

/// Send and read the body, classifying failures.
pub async fn send_for_text(req: reqwest::RequestBuilder, label: &str) -> Result<String, PlatformError> {
	let resp = send_with_retry(req, label).await?;
	let status = resp.status();
	let headers = resp.headers().clone();
	let body = resp.text().await.with_context(|| format!("{label} read body"))?;
	if !status.is_success() {
		return Err(error_for_status(label, status, &headers, &body));
	}
	Ok(body)
}

/// Send and decode a JSON body.
pub async fn send_for_json<T: DeserializeOwned>(req: reqwest::RequestBuilder, label: &str) -> Result<T, PlatformError> {
	let body = send_for_text(req, label).await?;
	serde_json::from_str(&body)
		.with_context(|| format!("{label} parse json"))
		.map_err(PlatformError::from)
}

fn clip(body: &str) -> &str {
	crate::truncate_chars(body, 512)
}

#[cfg(test)]
mod tests {
	use reqwest::header::HeaderValue;

	use super::*;

	#[test]
	fn retry_after_seconds_header() {
		let mut headers = HeaderMap::new();
		headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
		assert_eq!(retry_delay_from_headers(&headers), Some(Duration::from_secs(7)));
	}

	#[test]
	fn ratelimit_reset_in_the_past_is_ignored() {
		let mut headers = HeaderMap::new();
		headers.insert("Ratelimit-Reset", HeaderValue::from_static("10"));
		assert_eq!(retry_delay_from_headers(&headers), None);
	}

	#[test]
	fn status_classification() {
		let headers = HeaderMap::new();
		assert!(matches!(
			error_for_status("x", StatusCode::UNAUTHORIZED, &headers, ""),
			PlatformError::Auth(_)
		));
		assert!(matches!(
			error_for_status("x", StatusCode::TOO_MANY_REQUESTS, &headers, ""),
			PlatformError::RateLimited { retry_after: None }
		));
		assert!(matches!(
			error_for_status("x", StatusCode::BAD_GATEWAY, &headers, "oops"),
			PlatformError::Other(_)
		));
	}
}
