#![forbid(unsafe_code)]

//! RTC room-token minting (spec.md §4.E.4: "mint an RTC room token for the
//! proposer to join *self's* RTC room"). Out of scope as a feature (spec.md
//! §1); consumed only through this narrow interface.

use std::time::Duration;

use async_trait::async_trait;
use pairlive_domain::UserId;
use thiserror::Error;

use crate::SecretString;

#[derive(Debug, Error)]
pub enum RtcTokenError {
	#[error("rtc token service error: {0}")]
	Service(#[source] anyhow::Error),
}

/// Permission level granted to the minted token (spec.md §4.E.4: "permission `user`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtcPermission {
	User,
}

#[async_trait]
pub trait RtcTokenMinter: Send + Sync + 'static {
	/// Mint a token granting `user` time-limited access to `rtc_room`.
	async fn mint(
		&self,
		rtc_room: &str,
		user: &UserId,
		permission: RtcPermission,
		ttl: Duration,
	) -> Result<String, RtcTokenError>;
}

/// HTTP-backed default implementation, grounded on the teacher's reqwest-based
/// external-service client shape (`chatty_platform::twitch`).
pub struct HttpRtcTokenMinter {
	client: reqwest::Client,
	base_url: String,
	api_key: SecretString,
}

impl HttpRtcTokenMinter {
	pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Self {
		Self {
			client: reqwest::Client::new(),
			base_url: base_url.into(),
			api_key,
		}
	}
}

#[derive(serde::Serialize)]
struct MintRequest<'a> {
	room: &'a str,
	user_id: &'a str,
	permission: &'static str,
	ttl_seconds: u64,
}

#[derive(serde::Deserialize)]
struct MintResponse {
	token: String,
}

#[async_trait]
impl RtcTokenMinter for HttpRtcTokenMinter {
	async fn mint(
		&self,
		rtc_room: &str,
		user: &UserId,
		permission: RtcPermission,
		ttl: Duration,
	) -> Result<String, RtcTokenError> {
		let permission = match permission {
			RtcPermission::User => "user",
		};

		let resp = self
			.client
			.post(format!("{}/rtc/tokens", self.base_url))
			.bearer_auth(self.api_key.expose())
			.json(&MintRequest {
				room: rtc_room,
				user_id: user.as_str(),
				permission,
				ttl_seconds: ttl.as_secs(),
			})
			.send()
			.await
			.map_err(|e| RtcTokenError::Service(e.into()))?
			.error_for_status()
			.map_err(|e| RtcTokenError::Service(e.into()))?
			.json::<MintResponse>()
			.await
			.map_err(|e| RtcTokenError::Service(e.into()))?;

		Ok(resp.token)
	}
}
