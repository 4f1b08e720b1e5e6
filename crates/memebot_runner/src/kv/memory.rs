#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::KvStore;

struct Entry {
	value: String,
	expires_at: Option<Instant>,
}

impl Entry {
	fn is_live(&self, now: Instant) -> bool {
		self.expires_at.is_none_or(|at| at > now)
	}
}

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct Entries {
	map: HashMap<String, Entry>,
	next_sweep: Instant,
}

/// In-process store for tests and single-runner deployments.
///
/// Expired keys are dropped when read, and writes sweep the whole map at most once per interval.
pub struct MemoryKv {
	entries: Mutex<Entries>,
	sweep_interval: Duration,
}

impl Default for MemoryKv {
	fn default() -> Self {
		Self::with_sweep_interval(SWEEP_INTERVAL)
	}
}

impl MemoryKv {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_sweep_interval(sweep_interval: Duration) -> Self {
		Self {
			entries: Mutex::new(Entries {
				map: HashMap::new(),
				next_sweep: Instant::now() + sweep_interval,
			}),
			sweep_interval,
		}
	}

	fn sweep_if_due(&self, entries: &mut Entries, now: Instant) {
		if now < entries.next_sweep {
			return;
		}
		entries.map.retain(|_, e| e.is_live(now));
		entries.next_sweep = now + self.sweep_interval;
	}

	fn live_value(entries: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
		match entries.get(key) {
			Some(e) if e.is_live(now) => Some(e.value.clone()),
			Some(_) => {
				entries.remove(key);
				None
			}
			None => None,
		}
	}

	fn add(&self, key: &str, delta: i64, ttl: Option<Duration>) -> anyhow::Result<i64> {
		let now = Instant::now();
		let mut guard = self.entries.lock();
		self.sweep_if_due(&mut guard, now);
		let entries = &mut guard.map;
		let current = Self::live_value(entries, key, now);
		let created = current.is_none();
		let value = match current {
			Some(v) => v
				.parse::<i64>()
				.map_err(|_| anyhow!("value at {key} is not an integer"))?,
			None => 0,
		} + delta;
		let expires_at = match entries.get(key) {
			Some(e) if !created => e.expires_at,
			_ => ttl.map(|t| now + t),
		};
		entries.insert(
			key.to_string(),
			Entry {
				value: value.to_string(),
				expires_at,
			},
		);
		Ok(value)
	}
}

#[async_trait]
impl KvStore for MemoryKv {
	async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
		let mut entries = self.entries.lock();
		Ok(Self::live_value(&mut entries.map, key, Instant::now()))
	}

	async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()> {
		let now = Instant::now();
		let mut entries = self.entries.lock();
		self.sweep_if_due(&mut entries, now);
		entries.map.insert(
			key.to_string(),
			Entry {
				value: value.to_string(),
				expires_at: ttl.map(|t| now + t),
			},
		);
		Ok(())
	}

	async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
		let now = Instant::now();
		let mut entries = self.entries.lock();
		self.sweep_if_due(&mut entries, now);
		if Self::live_value(&mut entries.map, key, now).is_some() {
			return Ok(false);
		}
		entries.map.insert(
			key.to_string(),
			Entry {
				value: value.to_string(),
				expires_at: Some(now + ttl),
			},
		);
		Ok(true)
	}

	async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
		self.add(key, 1, Some(ttl))
	}

	async fn decr(&self, key: &str) -> anyhow::Result<i64> {
		self.add(key, -1, None)
	}

	async fn delete(&self, key: &str) -> anyhow::Result<()> {
		self.entries.lock().map.remove(key);
		Ok(())
	}

	async fn delete_if_equals(&self, key: &str, value: &str) -> anyhow::Result<bool> {
		let now = Instant::now();
		let mut entries = self.entries.lock();
		if Self::live_value(&mut entries.map, key, now).as_deref() == Some(value) {
			entries.map.remove(key);
			return Ok(true);
		}
		Ok(false)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn set_nx_only_writes_once() {
		let kv = MemoryKv::new();
		assert!(kv.set_nx("k", "a", Duration::from_secs(60)).await.expect("set_nx"));
		assert!(!kv.set_nx("k", "b", Duration::from_secs(60)).await.expect("set_nx"));
		assert_eq!(kv.get("k").await.expect("get").as_deref(), Some("a"));
	}

	#[tokio::test]
	async fn expired_entries_disappear() {
		let kv = MemoryKv::new();
		kv.set("k", "v", Some(Duration::from_millis(1))).await.expect("set");
		std::thread::sleep(Duration::from_millis(5));
		assert!(kv.get("k").await.expect("get").is_none());
		assert!(kv.set_nx("k", "w", Duration::from_secs(1)).await.expect("set_nx"));
	}

	#[tokio::test]
	async fn counters_keep_their_first_ttl() {
		let kv = MemoryKv::new();
		assert_eq!(kv.incr("c", Duration::from_secs(60)).await.expect("incr"), 1);
		assert_eq!(kv.incr("c", Duration::from_millis(1)).await.expect("incr"), 2);
		std::thread::sleep(Duration::from_millis(5));
		assert_eq!(kv.decr("c").await.expect("decr"), 1);
	}

	#[tokio::test]
	async fn writes_sweep_expired_keys_nobody_reads() {
		let kv = MemoryKv::with_sweep_interval(Duration::ZERO);
		for i in 0..10 {
			kv.set(&format!("dedup:{i}"), "x", Some(Duration::from_millis(1))).await.expect("set");
		}
		kv.incr("window", Duration::from_millis(1)).await.expect("incr");
		std::thread::sleep(Duration::from_millis(5));

		kv.set("fresh", "v", None).await.expect("set");
		assert_eq!(kv.entries.lock().map.len(), 1);
		assert_eq!(kv.get("fresh").await.expect("get").as_deref(), Some("v"));
	}

	#[tokio::test]
	async fn sweeps_wait_for_the_interval() {
		let kv = MemoryKv::with_sweep_interval(Duration::from_secs(3600));
		kv.set("old", "x", Some(Duration::from_millis(1))).await.expect("set");
		std::thread::sleep(Duration::from_millis(5));
		kv.set("fresh", "v", None).await.expect("set");
		assert_eq!(kv.entries.lock().map.len(), 2);
		assert!(kv.get("old").await.expect("get").is_none());
		assert_eq!(kv.entries.lock().map.len(), 1);
	}

	#[tokio::test]
	async fn compare_and_delete() {
		let kv = MemoryKv::new();
		kv.set("lock", "token-a", None).await.expect("set");
		assert!(!kv.delete_if_equals("lock", "token-b").await.expect("cad"));
		assert!(kv.delete_if_equals("lock", "token-a").await.expect("cad"));
		assert!(kv.get("lock").await.expect("get").is_none());
	}
}
