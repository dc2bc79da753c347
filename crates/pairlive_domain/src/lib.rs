#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

/// Opaque account/user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	/// Generate a fresh random id.
	pub fn new_random() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Opaque room identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}

	pub fn new_random() -> Self {
		Self(uuid::Uuid::new_v4().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;
	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Unordered key for a (proposer, receiver) PK offer pair (spec.md §3, §4.E.8).
///
/// Two `PairKey`s built from `(a, b)` and `(b, a)` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey(UserId, UserId);

impl PairKey {
	pub fn new(a: UserId, b: UserId) -> Self {
		if a.as_str() <= b.as_str() { Self(a, b) } else { Self(b, a) }
	}
}

impl fmt::Display for PairKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.0, self.1)
	}
}

/// Account — created at first successful login, mutated by profile-update, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
	pub id: UserId,
	pub phone: String,
	pub display_name: String,
	pub gender: Gender,
	pub created_at_unix: i64,
	pub updated_at_unix: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Gender {
	Unknown,
	Male,
	Female,
}

/// A currently-logged-in user's session/status record (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveUser {
	pub id: UserId,
	pub token: String,
	pub status: UserStatus,
	/// Room the user is associated with: own room when broadcasting, watched room when watching.
	pub room: Option<RoomId>,
	pub im_user: Option<String>,
}

impl ActiveUser {
	pub fn idle(id: UserId, token: impl Into<String>) -> Self {
		Self {
			id,
			token: token.into(),
			status: UserStatus::Idle,
			room: None,
			im_user: None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UserStatus {
	Idle,
	Watching,
	SingleLive,
	PkWait,
	PkLive,
}

/// A live broadcast room (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
	pub id: RoomId,
	pub display_name: String,
	pub creator: UserId,
	pub play_url: String,
	pub rtc_room: String,
	pub status: RoomStatus,
	/// The *other* anchor's user id when `status` is `waitPK` or `pk`.
	pub pk_anchor: Option<UserId>,
	pub audience: Vec<UserId>,
}

impl Room {
	pub fn new(id: RoomId, creator: UserId, display_name: impl Into<String>) -> Self {
		Self {
			id: id.clone(),
			display_name: display_name.into(),
			creator,
			play_url: String::new(),
			rtc_room: id.into_string(),
			status: RoomStatus::Single,
			pk_anchor: None,
			audience: Vec::new(),
		}
	}

	/// Reset this room back to the quiescent `single` state (spec.md §4.E.4–4.E.7).
	pub fn reset_to_single(&mut self) {
		self.status = RoomStatus::Single;
		self.pk_anchor = None;
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoomStatus {
	Single,
	WaitPk,
	Pk,
}

/// Numeric error codes from spec.md §4.E.2, carried on every typed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
	Ok = 0,
	UnknownMessage = 10001,
	TokenInvalid = 10002,
	NoPermission = 10003,
	RoomNoExist = 10011,
	RoomInPk = 10012,
	RoomNotInPk = 10013,
	PlayerNoExist = 10021,
	PlayerOffline = 10022,
	InvalidParameter = 10031,
}

impl ErrorCode {
	pub fn as_u32(self) -> u32 {
		self as u32
	}

	pub fn is_ok(self) -> bool {
		matches!(self, ErrorCode::Ok)
	}
}

impl fmt::Display for ErrorCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.as_u32())
	}
}
