#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::KvStore;

const INCR_WITH_TTL: &str = r"
local v = redis.call('INCR', KEYS[1])
if v == 1 then
	redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return v
";

const DELETE_IF_EQUALS: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
	return redis.call('DEL', KEYS[1])
end
return 0
";

/// Shared store for multiple runners.
#[derive(Clone)]
pub struct RedisKv {
	manager: ConnectionManager,
	incr_script: Script,
	delete_script: Script,
}

impl RedisKv {
	pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
		let client = redis::Client::open(redis_url).context("open redis client")?;
		let manager = client
			.get_connection_manager()
			.await
			.context("failed to connect to redis")?;
		Ok(Self {
			manager,
			incr_script: Script::new(INCR_WITH_TTL),
			delete_script: Script::new(DELETE_IF_EQUALS),
		})
	}
}

fn millis(ttl: Duration) -> u64 {
	(ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KvStore for RedisKv {
	async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
		let mut conn = self.manager.clone();
		conn.get(key).await.with_context(|| format!("redis GET {key}"))
	}

	async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> anyhow::Result<()> {
		let mut conn = self.manager.clone();
		match ttl {
			Some(ttl) => conn
				.pset_ex::<_, _, ()>(key, value, millis(ttl))
				.await
				.with_context(|| format!("redis PSETEX {key}")),
			None => conn
				.set::<_, _, ()>(key, value)
				.await
				.with_context(|| format!("redis SET {key}")),
		}
	}

	async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
		let mut conn = self.manager.clone();
		let reply: Option<String> = redis::cmd("SET")
			.arg(key)
			.arg(value)
			.arg("NX")
			.arg("PX")
			.arg(millis(ttl))
			.query_async(&mut conn)
			.await
			.with_context(|| format!("redis SET NX {key}"))?;
		Ok(reply.is_some())
	}

	async fn incr(&self, key: &str, ttl: Duration) -> anyhow::Result<i64> {
		let mut conn = self.manager.clone();
		self.incr_script
			.key(key)
			.arg(millis(ttl))
			.invoke_async(&mut conn)
			.await
			.with_context(|| format!("redis INCR {key}"))
	}

	async fn decr(&self, key: &str) -> anyhow::Result<i64> {
		let mut conn = self.manager.clone();
		conn.decr(key, 1).await.with_context(|| format!("redis DECR {key}"))
	}

	async fn delete(&self, key: &str) -> anyhow::Result<()> {
		let mut conn = self.manager.clone();
		conn.del::<_, ()>(key).await.with_context(|| format!("redis DEL {key}"))
	}

	async fn delete_if_equals(&self, key: &str, value: &str) -> anyhow::Result<bool> {
		let mut conn = self.manager.clone();
		let deleted: i64 = self
			.delete_script
			.key(key)
			.arg(value)
			.invoke_async(&mut conn)
			.await
			.with_context(|| format!("redis compare-and-delete {key}"))?;
		Ok(deleted == 1)
	}
}
