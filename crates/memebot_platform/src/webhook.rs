#![forbid(unsafe_code)]

//! Inbound webhook receiver for push platforms (Twitch EventSub, Kick events).

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rsa::RsaPublicKey;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::kick::events as kick_events;
use crate::twitch::eventsub;
use crate::{PushEvent, SecretString};

const RECENT_IDS_CAPACITY: usize = 4096;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
	pub bind: SocketAddr,
	pub twitch_path: String,
	/// EventSub secret; the Twitch route is disabled without it.
	pub twitch_secret: Option<SecretString>,
	pub kick_path: String,
	/// PEM public key used to verify Kick deliveries.
	pub kick_public_key: Option<String>,
	pub kick_verify: bool,
}

impl Default for WebhookConfig {
	fn default() -> Self {
		Self {
			bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
			twitch_path: "/twitch/eventsub".to_string(),
			twitch_secret: None,
			kick_path: "/kick/events".to_string(),
			kick_public_key: None,
			kick_verify: true,
		}
	}
}

/// Bounded set of delivery ids already accepted.
#[derive(Debug, Default)]
struct RecentIds {
	set: HashSet<String>,
	order: VecDeque<String>,
}

impl RecentIds {
	/// False when `id` was seen before.
	fn insert(&mut self, id: &str) -> bool {
		if self.set.contains(id) {
			return false;
		}
		self.set.insert(id.to_string());
		self.order.push_back(id.to_string());
		while self.order.len() > RECENT_IDS_CAPACITY {
			if let Some(old) = self.order.pop_front() {
				self.set.remove(&old);
			}
		}
		true
	}
}

struct WebhookState {
	cfg: WebhookConfig,
	kick_key: Option<RsaPublicKey>,
	events_tx: mpsc::Sender<PushEvent>,
	twitch_seen: Mutex<RecentIds>,
	kick_seen: Mutex<RecentIds>,
}

/// Shared request handler; the server loop only does transport.
#[derive(Clone)]
pub struct WebhookReceiver {
	state: Arc<WebhookState>,
}

fn now_ms() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis() as i64)
		.unwrap_or_default()
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
	headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

fn respond(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
	let mut resp = Response::new(Full::new(body.into()));
	*resp.status_mut() = status;
	resp
}

fn empty(status: StatusCode) -> Response<Full<Bytes>> {
	respond(status, Bytes::new())
}

impl WebhookReceiver {
	pub fn new(cfg: WebhookConfig, events_tx: mpsc::Sender<PushEvent>) -> anyhow::Result<Self> {
		let kick_key = match cfg.kick_public_key.as_deref() {
			Some(pem) if !pem.trim().is_empty() => Some(kick_events::parse_public_key(pem)?),
			_ => None,
		};
		if cfg.kick_verify && kick_key.is_none() {
			warn!("kick webhook verification enabled without a public key; kick deliveries will be rejected");
		}
		Ok(Self {
			state: Arc::new(WebhookState {
				cfg,
				kick_key,
				events_tx,
				twitch_seen: Mutex::new(RecentIds::default()),
				kick_seen: Mutex::new(RecentIds::default()),
			}),
		})
	}

	/// Route one request.
	pub async fn handle(&self, method: &Method, path: &str, headers: &HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
		if *method != Method::POST {
			return empty(StatusCode::METHOD_NOT_ALLOWED);
		}
		let cfg = &self.state.cfg;
		if path == cfg.twitch_path {
			self.handle_twitch(headers, body).await
		} else if path == cfg.kick_path {
			self.handle_kick(headers, body).await
		} else {
			empty(StatusCode::NOT_FOUND)
		}
	}

	async fn forward(&self, events: Vec<PushEvent>) -> Response<Full<Bytes>> {
		for ev in events {
			if self.state.events_tx.send(ev).await.is_err() {
				warn!("push event channel closed");
				return empty(StatusCode::SERVICE_UNAVAILABLE);
			}
		}
		empty(StatusCode::NO_CONTENT)
	}

	async fn handle_twitch(&self, headers: &HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
		let Some(secret) = self.state.cfg.twitch_secret.as_ref() else {
			return empty(StatusCode::NOT_FOUND);
		};
		metrics::counter!("memebot_webhook_requests_total", "platform" => "twitch").increment(1);

		let message_id = header(headers, eventsub::HEADER_MESSAGE_ID);
		let timestamp = header(headers, eventsub::HEADER_MESSAGE_TIMESTAMP);
		let signature = header(headers, eventsub::HEADER_MESSAGE_SIGNATURE);
		let message_type = header(headers, eventsub::HEADER_MESSAGE_TYPE);

		if !eventsub::verify_signature(secret.expose(), message_id, timestamp, &body, signature) {
			metrics::counter!("memebot_webhook_signature_invalid_total", "platform" => "twitch").increment(1);
			return empty(StatusCode::FORBIDDEN);
		}

		match message_type {
			"webhook_callback_verification" => match eventsub::decode_challenge(&body) {
				Ok(challenge) => {
					info!("twitch eventsub callback verified");
					let mut resp = respond(StatusCode::OK, challenge);
					resp.headers_mut()
						.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
					resp
				}
				Err(e) => {
					warn!(error = %e, "twitch eventsub verification without challenge");
					empty(StatusCode::BAD_REQUEST)
				}
			},
			"revocation" => {
				match eventsub::decode_revocation(&body) {
					Ok((kind, status)) => warn!(subscription_type = %kind, %status, "twitch eventsub subscription revoked"),
					Err(e) => warn!(error = %e, "undecodable twitch revocation"),
				}
				metrics::counter!("memebot_webhook_revocations_total", "platform" => "twitch").increment(1);
				empty(StatusCode::NO_CONTENT)
			}
			"notification" => {
				let Ok(sent_at_ms) = eventsub::parse_timestamp_ms(timestamp) else {
					return empty(StatusCode::BAD_REQUEST);
				};
				let age_ms = now_ms().saturating_sub(sent_at_ms);
				if age_ms > eventsub::MAX_MESSAGE_AGE.as_millis() as i64 {
					metrics::counter!("memebot_webhook_stale_total", "platform" => "twitch").increment(1);
					debug!(message_id, age_ms, "dropping stale twitch notification");
					return empty(StatusCode::NO_CONTENT);
				}
				if !self.state.twitch_seen.lock().insert(message_id) {
					metrics::counter!("memebot_webhook_duplicates_total", "platform" => "twitch").increment(1);
					return empty(StatusCode::NO_CONTENT);
				}
				match eventsub::decode_notification(message_id, sent_at_ms, &body) {
					Ok(events) => self.forward(events).await,
					Err(e) => {
						warn!(error = %e, message_id, "undecodable twitch notification");
						empty(StatusCode::BAD_REQUEST)
					}
				}
			}
			other => {
				debug!(message_type = other, "ignoring twitch eventsub message type");
				empty(StatusCode::NO_CONTENT)
			}
		}
	}

	async fn handle_kick(&self, headers: &HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
		metrics::counter!("memebot_webhook_requests_total", "platform" => "kick").increment(1);

		let event_type = header(headers, kick_events::HEADER_EVENT_TYPE);
		let message_id = header(headers, kick_events::HEADER_MESSAGE_ID);
		let timestamp = header(headers, kick_events::HEADER_MESSAGE_TIMESTAMP);
		let signature = header(headers, kick_events::HEADER_SIGNATURE);

		if self.state.cfg.kick_verify {
			let Some(key) = self.state.kick_key.as_ref() else {
				return empty(StatusCode::UNAUTHORIZED);
			};
			if message_id.is_empty()
				|| timestamp.is_empty()
				|| !kick_events::verify_signature(key, message_id, timestamp, &body, signature)
			{
				metrics::counter!("memebot_webhook_signature_invalid_total", "platform" => "kick").increment(1);
				return empty(StatusCode::UNAUTHORIZED);
			}
		}

		if !message_id.is_empty() && !self.state.kick_seen.lock().insert(message_id) {
			metrics::counter!("memebot_webhook_duplicates_total", "platform" => "kick").increment(1);
			return empty(StatusCode::NO_CONTENT);
		}

		match kick_events::decode(event_type, message_id, now_ms(), &body) {
			Ok(events) => self.forward(events).await,
			Err(e) => {
				warn!(error = %e, event_type, "undecodable kick event");
				empty(StatusCode::BAD_REQUEST)
			}
		}
	}
}

/// Serve webhooks until the listener fails.
pub async fn run_webhook_server(receiver: WebhookReceiver) -> anyhow::Result<()> {
	let bind = receiver.state.cfg.bind;
	let listener = TcpListener::bind(bind).await?;
	info!(%bind, "webhook receiver listening");
	loop {
		let (stream, _addr) = listener.accept().await?;
		let io = TokioIo::new(stream);
		let receiver = receiver.clone();
		tokio::spawn(async move {
			let service = service_fn(move |req: Request<Incoming>| {
				let receiver = receiver.clone();
				async move {
					let (parts, body) = req.into_parts();
					let body = match body.collect().await {
						Ok(collected) => collected.to_bytes(),
						Err(err) => {
							warn!(error = %err, "webhook body read failed");
							return Ok::<_, hyper::Error>(empty(StatusCode::BAD_REQUEST));
						}
					};
					Ok(receiver.handle(&parts.method, parts.uri.path(), &parts.headers, body).await)
				}
			});
			if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
				warn!(error = %err, "webhook connection error");
			}
		});
	}
}
