#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, anyhow};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::{ChatMessage, ChatRole, PlatformEvent, PlatformEventKind, UserRef};

pub const CHAT_TYPE_MESSAGE: i64 = 0;
pub const CHAT_TYPE_SUBSCRIBE: i64 = 5001;
pub const CHAT_TYPE_FOLLOW: i64 = 5003;
pub const CHAT_TYPE_GIFT_RANDOM: i64 = 5005;
pub const CHAT_TYPE_GIFT: i64 = 5006;
pub const CHAT_TYPE_RAID: i64 = 5008;

static NONCE: AtomicU64 = AtomicU64::new(1);

fn next_nonce() -> String {
	format!("memebot-{}", NONCE.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, PartialEq)]
pub enum BufferedItem {
	Chat(ChatMessage),
	Event(PlatformEvent),
}

impl BufferedItem {
	fn id(&self) -> Option<&str> {
		match self {
			BufferedItem::Chat(m) => Some(m.id.as_str()),
			BufferedItem::Event(e) => e.event_id.as_deref(),
		}
	}
}

/// Bounded chat backlog addressed by a monotonically increasing sequence.
#[derive(Debug)]
pub struct ChatBuffer {
	capacity: usize,
	next_seq: u64,
	entries: VecDeque<(u64, BufferedItem)>,
}

impl ChatBuffer {
	pub fn new(capacity: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			next_seq: 1,
			entries: VecDeque::new(),
		}
	}

	/// Append unless an entry with the same provider id is still buffered.
	pub fn push(&mut self, item: BufferedItem) -> bool {
		if let Some(id) = item.id()
			&& self.entries.iter().any(|(_, e)| e.id() == Some(id))
		{
			return false;
		}
		self.entries.push_back((self.next_seq, item));
		self.next_seq += 1;
		while self.entries.len() > self.capacity {
			self.entries.pop_front();
		}
		true
	}

	/// Items after `cursor`, and the cursor of the newest returned item.
	pub fn since(&self, cursor: Option<u64>) -> (Vec<BufferedItem>, Option<u64>) {
		let floor = cursor.unwrap_or(0);
		let items: Vec<_> = self
			.entries
			.iter()
			.filter(|(seq, _)| *seq > floor)
			.map(|(_, item)| item.clone())
			.collect();
		let head = self.entries.back().map(|(seq, _)| *seq).max(cursor);
		(items, head)
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}

#[derive(Debug, Deserialize)]
struct Frame {
	#[serde(rename = "type")]
	kind: String,
	#[serde(default)]
	error: Option<String>,
	#[serde(default)]
	data: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct ChatBatch {
	#[serde(default = "Vec::new")]
	chats: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TrovoChat {
	#[serde(rename = "type", default)]
	kind: i64,
	#[serde(default)]
	content: String,
	#[serde(default)]
	nick_name: Option<String>,
	#[serde(default)]
	user_name: Option<String>,
	#[serde(default)]
	sender_id: Option<i64>,
	#[serde(default)]
	message_id: Option<String>,
	#[serde(default)]
	send_time: Option<i64>,
	#[serde(default = "Vec::new")]
	roles: Vec<String>,
	#[serde(default)]
	sub_lv: Option<String>,
	#[serde(default)]
	content_data: Option<serde_json::Value>,
}

impl TrovoChat {
	fn user(&self) -> Option<UserRef> {
		let id = self.sender_id?.to_string();
		let login = self
			.user_name
			.clone()
			.or_else(|| self.nick_name.clone())
			.unwrap_or_default()
			.to_lowercase();
		Some(UserRef {
			id,
			login,
			display: self.nick_name.clone(),
		})
	}

	fn roles(&self) -> Vec<ChatRole> {
		let mut out: Vec<ChatRole> = Vec::new();
		for r in &self.roles {
			let role = match r.to_ascii_lowercase().as_str() {
				"streamer" => ChatRole::Broadcaster,
				"mod" | "supermod" | "admin" | "warden" => ChatRole::Moderator,
				"vip" => ChatRole::Vip,
				"subscriber" => ChatRole::Subscriber,
				_ => continue,
			};
			if !out.contains(&role) {
				out.push(role);
			}
		}
		out
	}

	fn tier(&self) -> String {
		match self.sub_lv.as_deref() {
			Some("L2") => "2000",
			Some("L3") => "3000",
			_ => "1000",
		}
		.to_string()
	}

	fn leading_number(&self, key: &str) -> Option<u64> {
		let from_data = self.content_data.as_ref().and_then(|d| d.get(key)).and_then(|v| match v {
			serde_json::Value::Number(n) => n.as_u64(),
			serde_json::Value::String(s) => s.parse().ok(),
			_ => None,
		});
		from_data.or_else(|| {
			let digits: String = self
				.content
				.chars()
				.skip_while(|c| !c.is_ascii_digit())
				.take_while(char::is_ascii_digit)
				.collect();
			digits.parse().ok()
		})
	}
}

/// Map one chat entry to a buffered item. Unknown types and anonymous entries are dropped.
pub fn decode_chat(raw: serde_json::Value) -> Option<BufferedItem> {
	let chat: TrovoChat = serde_json::from_value(raw.clone()).ok()?;
	let user = chat.user()?;
	let id = chat.message_id.clone()?;
	let at_ms = chat.send_time.map(|s| s * 1000).unwrap_or_default();

	let kind = match chat.kind {
		CHAT_TYPE_MESSAGE => {
			if chat.content.trim().is_empty() {
				return None;
			}
			let mut msg = ChatMessage::new(id, user, chat.content.clone()).with_roles(chat.roles());
			msg.sent_at_ms = chat.send_time.map(|s| s * 1000);
			return Some(BufferedItem::Chat(msg));
		}
		CHAT_TYPE_FOLLOW => PlatformEventKind::Follow,
		CHAT_TYPE_SUBSCRIBE => PlatformEventKind::Subscribe {
			tier: chat.tier(),
			is_prime: false,
			is_gift: false,
		},
		CHAT_TYPE_GIFT_RANDOM => PlatformEventKind::GiftSubs {
			count: chat
				.leading_number("num")
				.and_then(|n| u32::try_from(n).ok())
				.unwrap_or(1),
			tier: chat.tier(),
		},
		CHAT_TYPE_GIFT => PlatformEventKind::GiftSubs {
			count: 1,
			tier: chat.tier(),
		},
		CHAT_TYPE_RAID => PlatformEventKind::Raid {
			viewers: chat.leading_number("raiderNum").unwrap_or(0),
		},
		_ => return None,
	};

	Some(BufferedItem::Event(PlatformEvent {
		event_id: Some(id),
		user: Some(user),
		kind,
		occurred_at_ms: at_ms,
		raw,
	}))
}

/// Where and how a chat socket authenticates.
#[derive(Clone)]
pub struct ChatConnectInfo {
	pub ws_url: String,
	pub ping_interval: Duration,
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub token_source: Arc<dyn ChatTokenSource>,
}

/// Issues single-use chat tokens for a channel.
#[async_trait::async_trait]
pub trait ChatTokenSource: Send + Sync + 'static {
	async fn chat_token(&self, channel_id: &str) -> anyhow::Result<String>;
}

/// Running chat socket for one channel. Aborted on drop.
pub struct ChatSocket {
	pub platform_channel_id: String,
	pub buffer: Arc<Mutex<ChatBuffer>>,
	task: JoinHandle<()>,
}

impl ChatSocket {
	pub fn spawn(platform_channel_id: String, capacity: usize, info: ChatConnectInfo) -> Self {
		let buffer = Arc::new(Mutex::new(ChatBuffer::new(capacity)));
		let task = tokio::spawn(run_socket(platform_channel_id.clone(), buffer.clone(), info));
		Self {
			platform_channel_id,
			buffer,
			task,
		}
	}
}

impl Drop for ChatSocket {
	fn drop(&mut self) {
		self.task.abort();
	}
}

fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	let d = Duration::from_millis(u64::try_from(ms).unwrap_or(u64::MAX));
	d.min(max).max(min)
}

fn unix_secs() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as i64)
		.unwrap_or_default()
}

async fn run_socket(channel_id: String, buffer: Arc<Mutex<ChatBuffer>>, info: ChatConnectInfo) {
	let mut attempt: u32 = 0;
	loop {
		if attempt > 0 {
			let delay = backoff_delay(attempt, info.reconnect_min_delay, info.reconnect_max_delay);
			debug!(channel_id = %channel_id, ?delay, attempt, "trovo chat reconnecting");
			tokio::time::sleep(delay).await;
		}

		match run_connection(&channel_id, &buffer, &info, &mut attempt).await {
			Ok(()) => info!(channel_id = %channel_id, "trovo chat socket closed"),
			Err(e) => warn!(channel_id = %channel_id, error = %e, "trovo chat socket failed"),
		}
		attempt = attempt.saturating_add(1);
		metrics::counter!("memebot_trovo_chat_reconnects_total").increment(1);
	}
}

async fn run_connection(
	channel_id: &str,
	buffer: &Mutex<ChatBuffer>,
	info: &ChatConnectInfo,
	attempt: &mut u32,
) -> anyhow::Result<()> {
	let token = info.token_source.chat_token(channel_id).await?;
	let (mut ws, _) = tokio_tungstenite::connect_async(info.ws_url.as_str())
		.await
		.context("connect trovo chat socket")?;

	let auth = serde_json::json!({
		"type": "AUTH",
		"nonce": next_nonce(),
		"data": { "token": token },
	});
	ws.send(Message::text(auth.to_string()))
		.await
		.context("send trovo AUTH")?;

	// History replayed on connect predates this timestamp.
	let connected_at = unix_secs();
	let mut ping = tokio::time::interval(info.ping_interval);
	ping.tick().await;

	loop {
		tokio::select! {
			_ = ping.tick() => {
				let frame = serde_json::json!({ "type": "PING", "nonce": next_nonce() });
				ws.send(Message::text(frame.to_string())).await.context("send trovo PING")?;
			}
			msg = ws.next() => {
				let Some(msg) = msg else {
					return Ok(());
				};
				match msg.context("read trovo chat socket")? {
					Message::Text(text) => {
						let frame: Frame = match serde_json::from_str(text.as_str()) {
							Ok(f) => f,
							Err(e) => {
								debug!(error = %e, "skipping undecodable trovo frame");
								continue;
							}
						};
						match frame.kind.as_str() {
							"RESPONSE" => {
								if let Some(err) = frame.error.filter(|e| !e.is_empty()) {
									return Err(anyhow!("trovo AUTH rejected: {err}"));
								}
								*attempt = 0;
								debug!(channel_id, "trovo chat authenticated");
							}
							"CHAT" => {
								let Some(data) = frame.data else { continue };
								let batch: ChatBatch = serde_json::from_value(data).unwrap_or(ChatBatch { chats: Vec::new() });
								let mut buf = buffer.lock();
								for raw in batch.chats {
									let fresh = raw
										.get("send_time")
										.and_then(serde_json::Value::as_i64)
										.is_none_or(|t| t >= connected_at);
									if !fresh {
										continue;
									}
									if let Some(item) = decode_chat(raw) {
										buf.push(item);
									}
								}
							}
							"PONG" | "PING" => {}
							other => debug!(kind = other, "ignoring trovo frame"),
						}
					}
					Message::Close(frame) => {
						debug!(?frame, "trovo chat socket close frame");
						return Ok(());
					}
					_ => {}
				}
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn chat(id: &str, kind: i64, content: &str) -> serde_json::Value {
		serde_json::json!({
			"type": kind,
			"content": content,
			"nick_name": "Viewer",
			"user_name": "viewer",
			"sender_id": 42,
			"message_id": id,
			"send_time": 1_700_000_000,
			"roles": ["mod", "subscriber"],
			"sub_lv": "L2",
		})
	}

	#[test]
	fn chat_entries_decode() {
		let Some(BufferedItem::Chat(msg)) = decode_chat(chat("m1", CHAT_TYPE_MESSAGE, "!points")) else {
			panic!("expected chat");
		};
		assert_eq!(msg.text, "!points");
		assert_eq!(msg.author.id, "42");
		assert_eq!(msg.roles, vec![ChatRole::Moderator, ChatRole::Subscriber]);

		let Some(BufferedItem::Event(ev)) = decode_chat(chat("m2", CHAT_TYPE_SUBSCRIBE, "subscribed")) else {
			panic!("expected event");
		};
		assert_eq!(
			ev.kind,
			PlatformEventKind::Subscribe {
				tier: "2000".into(),
				is_prime: false,
				is_gift: false
			}
		);

		let Some(BufferedItem::Event(ev)) = decode_chat(chat("m3", CHAT_TYPE_GIFT_RANDOM, "gifted 5 subs")) else {
			panic!("expected event");
		};
		assert_eq!(ev.kind, PlatformEventKind::GiftSubs { count: 5, tier: "2000".into() });

		assert!(decode_chat(chat("m4", 5004, "welcome")).is_none());
		assert!(decode_chat(serde_json::json!({ "type": 0, "content": "anon" })).is_none());
	}

	fn item(id: &str) -> BufferedItem {
		BufferedItem::Chat(ChatMessage::new(id, UserRef::new("1", "a"), "hi"))
	}

	#[test]
	fn buffer_cursor_and_capacity() {
		let mut buf = ChatBuffer::new(3);
		assert_eq!(buf.since(None), (Vec::new(), None));

		for id in ["a", "b", "c", "d"] {
			assert!(buf.push(item(id)));
		}
		assert_eq!(buf.len(), 3);
		assert!(!buf.push(item("d")));

		let (items, cursor) = buf.since(None);
		assert_eq!(items, vec![item("b"), item("c"), item("d")]);
		assert_eq!(cursor, Some(4));

		let (items, cursor) = buf.since(Some(3));
		assert_eq!(items, vec![item("d")]);
		assert_eq!(cursor, Some(4));

		let (items, cursor) = buf.since(Some(4));
		assert!(items.is_empty());
		assert_eq!(cursor, Some(4));
	}

	#[test]
	fn backoff_is_bounded() {
		let min = Duration::from_millis(500);
		let max = Duration::from_secs(30);
		assert_eq!(backoff_delay(0, min, max), min);
		assert_eq!(backoff_delay(2, min, max), Duration::from_secs(2));
		assert_eq!(backoff_delay(40, min, max), max);
	}
}
