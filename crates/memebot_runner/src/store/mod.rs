#![forbid(unsafe_code)]

//! Relational persistence: configuration reads, outbox, reward ledger, wallets, credentials.
//!
//! Queries are written once with `?` placeholders and rewritten to `$n` for Postgres.

pub mod commands;
pub mod credentials;
pub mod outbox;
pub mod rewards;
pub mod subscriptions;

#[cfg(test)]
pub(crate) mod fixtures;

use std::borrow::Cow;
use std::str::FromStr;

use anyhow::{Context, anyhow};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, warn};

/// Run `$body` against whichever pool backs `$store`, with the pool bound to `$pool`.
macro_rules! on_pool {
	($store:expr, |$pool:ident| $body:expr) => {
		match &$store.backend {
			$crate::store::StoreBackend::Sqlite($pool) => $body,
			$crate::store::StoreBackend::Postgres($pool) => $body,
		}
	};
}
pub(crate) use on_pool;

#[derive(Clone)]
pub(crate) enum StoreBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

/// Optional features, decided once at startup from the tables that exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreCapabilities {
	pub commands: bool,
	pub smart_commands: bool,
	pub rewards: bool,
}

impl StoreCapabilities {
	pub const ALL: Self = Self {
		commands: true,
		smart_commands: true,
		rewards: true,
	};
}

#[derive(Clone)]
pub struct Store {
	pub(crate) backend: StoreBackend,
	caps: StoreCapabilities,
}

impl Store {
	pub async fn connect(database_url: &str, run_migrations: bool, max_connections: u32) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);
			let pool = SqlitePoolOptions::new()
				.max_connections(max_connections.max(1))
				.connect_with(opts)
				.await
				.context("connect sqlite")?;
			if run_migrations {
				sqlx::migrate!("migrations/sqlite")
					.run(&pool)
					.await
					.context("run sqlite migrations")?;
			}
			StoreBackend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = PgPoolOptions::new()
				.max_connections(max_connections.max(1))
				.connect(database_url)
				.await
				.context("connect postgres")?;
			if run_migrations {
				sqlx::migrate!("migrations/postgres")
					.run(&pool)
					.await
					.context("run postgres migrations")?;
			}
			StoreBackend::Postgres(pool)
		} else {
			return Err(anyhow!("unsupported database_url (expected sqlite: or postgres:)"));
		};

		let mut store = Self {
			backend,
			caps: StoreCapabilities::ALL,
		};
		store.caps = store.probe_capabilities().await?;
		info!(
			commands = store.caps.commands,
			smart_commands = store.caps.smart_commands,
			rewards = store.caps.rewards,
			"store capabilities"
		);
		Ok(store)
	}

	/// Private migrated SQLite database on a single connection.
	pub async fn connect_in_memory() -> anyhow::Result<Self> {
		let opts = SqliteConnectOptions::from_str("sqlite::memory:").context("parse sqlite url")?;
		let pool = SqlitePoolOptions::new()
			.max_connections(1)
			.idle_timeout(None)
			.max_lifetime(None)
			.connect_with(opts)
			.await
			.context("open in-memory sqlite")?;
		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;
		Ok(Self {
			backend: StoreBackend::Sqlite(pool),
			caps: StoreCapabilities::ALL,
		})
	}

	pub fn capabilities(&self) -> StoreCapabilities {
		self.caps
	}

	#[cfg(test)]
	pub(crate) fn with_capabilities(mut self, caps: StoreCapabilities) -> Self {
		self.caps = caps;
		self
	}

	/// Backend-specific placeholder syntax.
	pub(crate) fn sql<'a>(&self, query: &'a str) -> Cow<'a, str> {
		match self.backend {
			StoreBackend::Sqlite(_) => Cow::Borrowed(query),
			StoreBackend::Postgres(_) => Cow::Owned(numbered_placeholders(query)),
		}
	}

	async fn table_exists(&self, table: &str) -> anyhow::Result<bool> {
		let found: Option<String> = match &self.backend {
			StoreBackend::Sqlite(pool) => sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
				.bind(table)
				.fetch_optional(pool)
				.await
				.context("probe table (sqlite)")?,
			StoreBackend::Postgres(pool) => sqlx::query_scalar(
				"SELECT table_name::text FROM information_schema.tables WHERE table_schema = current_schema() AND table_name = $1",
			)
			.bind(table)
			.fetch_optional(pool)
			.await
			.context("probe table (postgres)")?,
		};
		Ok(found.is_some())
	}

	async fn probe_capabilities(&self) -> anyhow::Result<StoreCapabilities> {
		for required in ["bot_subscriptions", "external_accounts", "bot_outbox"] {
			if !self.table_exists(required).await? {
				return Err(anyhow!("required table {required} is missing"));
			}
		}

		let commands = self.table_exists("bot_commands").await?;
		let smart_commands = self.table_exists("channel_smart_commands").await?;
		let mut rewards = true;
		for table in ["channel_reward_configs", "reward_events", "wallets"] {
			if !self.table_exists(table).await? {
				rewards = false;
			}
		}

		if !commands {
			warn!("bot_commands table missing; static commands disabled");
		}
		if !smart_commands {
			warn!("channel_smart_commands table missing; smart commands disabled");
		}
		if !rewards {
			warn!("reward tables missing; rewards disabled");
		}

		Ok(StoreCapabilities {
			commands,
			smart_commands,
			rewards,
		})
	}
}

/// Rewrite `?` placeholders as `$1`, `$2`, ... Queries must not contain literal `?`.
fn numbered_placeholders(query: &str) -> String {
	let mut out = String::with_capacity(query.len() + 8);
	let mut n = 0;
	for c in query.chars() {
		if c == '?' {
			n += 1;
			out.push('$');
			out.push_str(&n.to_string());
		} else {
			out.push(c);
		}
	}
	out
}
