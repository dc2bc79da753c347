#![forbid(unsafe_code)]

//! sqlx-backed `Store` (spec.md §2.A, §4.A): accounts, active-user records,
//! and rooms persisted as JSON documents, dispatched across sqlite/postgres/
//! mysql by `database_url` scheme.
//!
//! Grounded on `audit.rs`'s `AuditBackend` enum-of-pools dispatch pattern.

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use pairlive_domain::{Account, ActiveUser, Room, RoomId, UserId};
use pairlive_platform::{Store, StoreError};

#[derive(Clone)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

#[derive(Clone)]
pub struct SqlStore {
	backend: Backend,
}

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		let backend = if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			Backend::Sqlite(pool)
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			Backend::Postgres(pool)
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			Backend::Mysql(pool)
		} else {
			return Err(anyhow!("unsupported database_url scheme for store"));
		};

		let store = Self { backend };
		store.migrate().await?;
		Ok(store)
	}

	async fn migrate(&self) -> anyhow::Result<()> {
		let stmts = [
			"CREATE TABLE IF NOT EXISTS accounts (id TEXT PRIMARY KEY, doc TEXT NOT NULL)",
			"CREATE TABLE IF NOT EXISTS active_users (id TEXT PRIMARY KEY, doc TEXT NOT NULL)",
			"CREATE TABLE IF NOT EXISTS rooms (id TEXT PRIMARY KEY, creator TEXT NOT NULL, doc TEXT NOT NULL)",
		];
		for stmt in stmts {
			match &self.backend {
				Backend::Sqlite(pool) => {
					sqlx::query(stmt).execute(pool).await.context("migrate sqlite")?;
				}
				Backend::Postgres(pool) => {
					sqlx::query(stmt).execute(pool).await.context("migrate postgres")?;
				}
				Backend::Mysql(pool) => {
					sqlx::query(stmt).execute(pool).await.context("migrate mysql")?;
				}
			}
		}
		Ok(())
	}
}

fn to_backend_err(e: impl std::error::Error + Send + Sync + 'static) -> StoreError {
	StoreError::Backend(e.into())
}

fn decode_doc<T: serde::de::DeserializeOwned>(doc: &str) -> Result<T, StoreError> {
	serde_json::from_str(doc).map_err(|e| StoreError::Backend(e.into()))
}

#[async_trait]
impl Store for SqlStore {
	async fn get_account(&self, id: &UserId) -> Result<Option<Account>, StoreError> {
		let row: Option<(String,)> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as("SELECT doc FROM accounts WHERE id = ?")
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.map_err(to_backend_err)?,
			Backend::Postgres(pool) => sqlx::query_as("SELECT doc FROM accounts WHERE id = $1")
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.map_err(to_backend_err)?,
			Backend::Mysql(pool) => sqlx::query_as("SELECT doc FROM accounts WHERE id = ?")
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.map_err(to_backend_err)?,
		};
		row.map(|(doc,)| decode_doc(&doc)).transpose()
	}

	async fn upsert_account(&self, account: &Account) -> Result<(), StoreError> {
		let doc = serde_json::to_string(account).map_err(|e| StoreError::Backend(e.into()))?;
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("INSERT INTO accounts (id, doc) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET doc = excluded.doc")
					.bind(account.id.as_str())
					.bind(doc)
					.execute(pool)
					.await
					.map_err(to_backend_err)?;
			}
			Backend::Postgres(pool) => {
				sqlx::query("INSERT INTO accounts (id, doc) VALUES ($1, $2) ON CONFLICT(id) DO UPDATE SET doc = excluded.doc")
					.bind(account.id.as_str())
					.bind(doc)
					.execute(pool)
					.await
					.map_err(to_backend_err)?;
			}
			Backend::Mysql(pool) => {
				sqlx::query("INSERT INTO accounts (id, doc) VALUES (?, ?) ON DUPLICATE KEY UPDATE doc = VALUES(doc)")
					.bind(account.id.as_str())
					.bind(doc)
					.execute(pool)
					.await
					.map_err(to_backend_err)?;
			}
		}
		Ok(())
	}

	async fn get_active_user(&self, id: &UserId) -> Result<Option<ActiveUser>, StoreError> {
		let row: Option<(String,)> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as("SELECT doc FROM active_users WHERE id = ?")
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.map_err(to_backend_err)?,
			Backend::Postgres(pool) => sqlx::query_as("SELECT doc FROM active_users WHERE id = $1")
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.map_err(to_backend_err)?,
			Backend::Mysql(pool) => sqlx::query_as("SELECT doc FROM active_users WHERE id = ?")
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.map_err(to_backend_err)?,
		};
		row.map(|(doc,)| decode_doc(&doc)).transpose()
	}

	async fn upsert_active_user(&self, user: &ActiveUser) -> Result<(), StoreError> {
		let doc = serde_json::to_string(user).map_err(|e| StoreError::Backend(e.into()))?;
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("INSERT INTO active_users (id, doc) VALUES (?, ?) ON CONFLICT(id) DO UPDATE SET doc = excluded.doc")
					.bind(user.id.as_str())
					.bind(doc)
					.execute(pool)
					.await
					.map_err(to_backend_err)?;
			}
			Backend::Postgres(pool) => {
				sqlx::query("INSERT INTO active_users (id, doc) VALUES ($1, $2) ON CONFLICT(id) DO UPDATE SET doc = excluded.doc")
					.bind(user.id.as_str())
					.bind(doc)
					.execute(pool)
					.await
					.map_err(to_backend_err)?;
			}
			Backend::Mysql(pool) => {
				sqlx::query("INSERT INTO active_users (id, doc) VALUES (?, ?) ON DUPLICATE KEY UPDATE doc = VALUES(doc)")
					.bind(user.id.as_str())
					.bind(doc)
					.execute(pool)
					.await
					.map_err(to_backend_err)?;
			}
		}
		Ok(())
	}

	async fn delete_active_user(&self, id: &UserId) -> Result<(), StoreError> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("DELETE FROM active_users WHERE id = ?").bind(id.as_str()).execute(pool).await.map_err(to_backend_err)?;
			}
			Backend::Postgres(pool) => {
				sqlx::query("DELETE FROM active_users WHERE id = $1")
					.bind(id.as_str())
					.execute(pool)
					.await
					.map_err(to_backend_err)?;
			}
			Backend::Mysql(pool) => {
				sqlx::query("DELETE FROM active_users WHERE id = ?").bind(id.as_str()).execute(pool).await.map_err(to_backend_err)?;
			}
		}
		Ok(())
	}

	async fn get_room(&self, id: &RoomId) -> Result<Option<Room>, StoreError> {
		let row: Option<(String,)> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as("SELECT doc FROM rooms WHERE id = ?")
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.map_err(to_backend_err)?,
			Backend::Postgres(pool) => sqlx::query_as("SELECT doc FROM rooms WHERE id = $1")
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.map_err(to_backend_err)?,
			Backend::Mysql(pool) => sqlx::query_as("SELECT doc FROM rooms WHERE id = ?")
				.bind(id.as_str())
				.fetch_optional(pool)
				.await
				.map_err(to_backend_err)?,
		};
		row.map(|(doc,)| decode_doc(&doc)).transpose()
	}

	async fn get_room_by_creator(&self, creator: &UserId) -> Result<Option<Room>, StoreError> {
		let row: Option<(String,)> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as("SELECT doc FROM rooms WHERE creator = ?")
				.bind(creator.as_str())
				.fetch_optional(pool)
				.await
				.map_err(to_backend_err)?,
			Backend::Postgres(pool) => sqlx::query_as("SELECT doc FROM rooms WHERE creator = $1")
				.bind(creator.as_str())
				.fetch_optional(pool)
				.await
				.map_err(to_backend_err)?,
			Backend::Mysql(pool) => sqlx::query_as("SELECT doc FROM rooms WHERE creator = ?")
				.bind(creator.as_str())
				.fetch_optional(pool)
				.await
				.map_err(to_backend_err)?,
		};
		row.map(|(doc,)| decode_doc(&doc)).transpose()
	}

	async fn upsert_room(&self, room: &Room) -> Result<(), StoreError> {
		let doc = serde_json::to_string(room).map_err(|e| StoreError::Backend(e.into()))?;
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO rooms (id, creator, doc) VALUES (?, ?, ?) \
					ON CONFLICT(id) DO UPDATE SET creator = excluded.creator, doc = excluded.doc",
				)
				.bind(room.id.as_str())
				.bind(room.creator.as_str())
				.bind(doc)
				.execute(pool)
				.await
				.map_err(to_backend_err)?;
			}
			Backend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO rooms (id, creator, doc) VALUES ($1, $2, $3) \
					ON CONFLICT(id) DO UPDATE SET creator = excluded.creator, doc = excluded.doc",
				)
				.bind(room.id.as_str())
				.bind(room.creator.as_str())
				.bind(doc)
				.execute(pool)
				.await
				.map_err(to_backend_err)?;
			}
			Backend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO rooms (id, creator, doc) VALUES (?, ?, ?) \
					ON DUPLICATE KEY UPDATE creator = VALUES(creator), doc = VALUES(doc)",
				)
				.bind(room.id.as_str())
				.bind(room.creator.as_str())
				.bind(doc)
				.execute(pool)
				.await
				.map_err(to_backend_err)?;
			}
		}
		Ok(())
	}

	async fn delete_room(&self, id: &RoomId) -> Result<(), StoreError> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query("DELETE FROM rooms WHERE id = ?").bind(id.as_str()).execute(pool).await.map_err(to_backend_err)?;
			}
			Backend::Postgres(pool) => {
				sqlx::query("DELETE FROM rooms WHERE id = $1").bind(id.as_str()).execute(pool).await.map_err(to_backend_err)?;
			}
			Backend::Mysql(pool) => {
				sqlx::query("DELETE FROM rooms WHERE id = ?").bind(id.as_str()).execute(pool).await.map_err(to_backend_err)?;
			}
		}
		Ok(())
	}

	async fn count_rooms(&self) -> Result<u64, StoreError> {
		let (count,): (i64,) = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as("SELECT COUNT(*) FROM rooms").fetch_one(pool).await.map_err(to_backend_err)?,
			Backend::Postgres(pool) => sqlx::query_as("SELECT COUNT(*) FROM rooms").fetch_one(pool).await.map_err(to_backend_err)?,
			Backend::Mysql(pool) => sqlx::query_as("SELECT COUNT(*) FROM rooms").fetch_one(pool).await.map_err(to_backend_err)?,
		};
		Ok(count as u64)
	}
}
