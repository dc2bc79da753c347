#![forbid(unsafe_code)]

//! External-collaborator interfaces consumed by the core (spec.md §2, §6): the
//! persistent Store (A), the Auth resolver (B), an RTC room-token minter, and
//! the IM out-of-band notification channel. Concrete implementations either
//! live here (HTTP-backed defaults) or in `pairlive_server` (the sqlx-backed
//! `Store`, grounded on the teacher's `AuditService`).

pub mod auth;
pub mod im;
pub mod rtc;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use pairlive_domain::{Account, ActiveUser, Room, RoomId, UserId};
use thiserror::Error;

pub use auth::{AuthResolver, HmacAuthResolver};
pub use im::{HttpImNotifier, ImNotifier};
pub use rtc::{HttpRtcTokenMinter, RtcTokenMinter};

/// Wrapper that redacts in logs and `Debug` output.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl serde::Serialize for SecretString {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: serde::Serializer,
	{
		serializer.serialize_str("")
	}
}

impl<'de> serde::Deserialize<'de> for SecretString {
	fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
	where
		D: serde::Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Ok(SecretString::new(s))
	}
}

/// Errors surfaced by a `Store` implementation. Handlers never leak these to
/// clients; they are always mapped to `ErrorCode::InvalidParameter` (spec.md §7).
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("backend error: {0}")]
	Backend(#[source] anyhow::Error),

	#[error("conditional update failed: record changed since read")]
	ConditionalUpdateConflict,

	#[error("admission cap exceeded: {0}")]
	AdmissionCapExceeded(String),

	#[error("uniqueness violation: {0}")]
	UniquenessViolation(String),
}

/// Persistent key/document store for accounts, active-user records, and rooms
/// (spec.md §2.A). Optimistic find-then-update, last-write-wins (spec.md §5).
#[async_trait]
pub trait Store: Send + Sync + 'static {
	async fn get_account(&self, id: &UserId) -> Result<Option<Account>, StoreError>;
	async fn upsert_account(&self, account: &Account) -> Result<(), StoreError>;

	async fn get_active_user(&self, id: &UserId) -> Result<Option<ActiveUser>, StoreError>;
	async fn upsert_active_user(&self, user: &ActiveUser) -> Result<(), StoreError>;
	async fn delete_active_user(&self, id: &UserId) -> Result<(), StoreError>;

	async fn get_room(&self, id: &RoomId) -> Result<Option<Room>, StoreError>;
	async fn get_room_by_creator(&self, creator: &UserId) -> Result<Option<Room>, StoreError>;
	async fn upsert_room(&self, room: &Room) -> Result<(), StoreError>;
	async fn delete_room(&self, id: &RoomId) -> Result<(), StoreError>;

	/// Count of live (non-deleted) rooms, for the `maxRooms` admission cap (spec.md §6).
	async fn count_rooms(&self) -> Result<u64, StoreError>;
}

/// TTL and permission scope for a minted RTC room token.
#[derive(Debug, Clone, Copy)]
pub struct RtcTokenRequest {
	pub ttl: Duration,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn secret_string_debug_is_redacted() {
		let s = SecretString::new("super-secret");
		assert_eq!(format!("{s:?}"), "SecretString(<redacted>)");
		assert_eq!(format!("{s}"), "<redacted>");
	}
}
