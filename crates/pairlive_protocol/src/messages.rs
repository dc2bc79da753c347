#![forbid(unsafe_code)]

//! Wire bodies for each frame type (spec.md §4.E.1, §6). Unknown fields are
//! ignored on decode by virtue of plain `serde` struct deserialization.

use serde::{Deserialize, Serialize};

/// `auth{rpcId, token}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthBody {
	pub rpc_id: String,
	pub token: String,
}

/// `auth-res{rpcId, code, error, pongTimeout}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResBody {
	pub rpc_id: String,
	pub code: u32,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub error: String,
	/// Seconds; tells the client the server's liveness threshold.
	pub pong_timeout: u64,
}

/// `ping{clientTimeUnixMs}` — heartbeat carries no rpcId; it is not an RPC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingBody {
	pub client_time_unix_ms: i64,
}

/// `pong{clientTimeUnixMs}`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongBody {
	pub client_time_unix_ms: i64,
}

/// `start-pk{pkRoomId, rpcId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPkBody {
	pub pk_room_id: String,
	pub rpc_id: String,
}

/// A typed `{rpcId, code, error}` response shared by `start-pk-res`, `answer-pk-res`, `end-pk-res`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResultBody {
	pub rpc_id: String,
	pub code: u32,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub error: String,
}

impl RpcResultBody {
	pub fn ok(rpc_id: impl Into<String>) -> Self {
		Self {
			rpc_id: rpc_id.into(),
			code: 0,
			error: String::new(),
		}
	}

	pub fn err(rpc_id: impl Into<String>, code: u32, error: impl Into<String>) -> Self {
		Self {
			rpc_id: rpc_id.into(),
			code,
			error: error.into(),
		}
	}
}

/// `answer-pk{reqRoomId, accept, rpcId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerPkBody {
	pub req_room_id: String,
	pub accept: bool,
	pub rpc_id: String,
}

/// `end-pk{pkRoomId, rpcId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndPkBody {
	pub pk_room_id: String,
	pub rpc_id: String,
}

/// `on-pk-offer{fromUserId, fromNickname, fromRoomId, fromRoomName}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnPkOfferBody {
	pub from_user_id: String,
	pub from_nickname: String,
	pub from_room_id: String,
	pub from_room_name: String,
}

/// `on-pk-answer{reqRoomId, accepted, rtcRoom?, rtcRoomToken?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnPkAnswerBody {
	pub req_room_id: String,
	pub accepted: bool,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rtc_room: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rtc_room_token: Option<String>,
}

/// `on-pk-end{pkRoomId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnPkEndBody {
	pub pk_room_id: String,
}

/// `on-pk-timeout{pkAnchorId, pkRoomId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnPkTimeoutBody {
	pub pk_anchor_id: String,
	pub pk_room_id: String,
}

/// Internal `disconnect` notice — never sent over the wire by a client; synthesized
/// by the connection pump and delivered to the PK coordinator in-process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectBody {}
