#![forbid(unsafe_code)]

//! Auth resolver (spec.md §2.B): validates an opaque login token, returns a user id.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use pairlive_domain::UserId;
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

use crate::SecretString;

#[derive(Debug, Error)]
pub enum AuthError {
	#[error("token invalid: {0}")]
	Invalid(String),
}

/// Resolves an opaque token to a user id (spec.md §4.C: "Until an `auth` frame
/// with a valid token arrives, no other message type is processed").
#[async_trait]
pub trait AuthResolver: Send + Sync + 'static {
	async fn resolve(&self, token: &str) -> Result<UserId, AuthError>;
}

#[derive(Debug, Deserialize)]
struct AuthClaims {
	sub: String,
	#[serde(default)]
	exp: Option<i64>,
}

/// Injectable source of the current time, so token-expiry checks stay
/// deterministic under test (spec.md §9) instead of reaching for the
/// process-wide clock.
pub trait Clock: Send + Sync + 'static {
	fn now_unix(&self) -> i64;
}

/// Real wall-clock `Clock`, used outside of tests.
pub struct SystemClock;

impl Clock for SystemClock {
	fn now_unix(&self) -> i64 {
		chrono::Utc::now().timestamp()
	}
}

/// HMAC-signed-token auth resolver, grounded on the teacher's `verify_hmac_token`.
///
/// Token format: `v1.<payload_b64>.<sig_b64>` where `payload_b64` decodes to a
/// JSON `{sub, exp?}` object and `sig_b64` is `HMAC-SHA256(secret, payload_b64)`.
pub struct HmacAuthResolver {
	secret: SecretString,
	clock: Box<dyn Clock>,
}

impl HmacAuthResolver {
	pub fn new(secret: SecretString) -> Self {
		Self::with_clock(secret, SystemClock)
	}

	pub fn with_clock(secret: SecretString, clock: impl Clock) -> Self {
		Self { secret, clock: Box::new(clock) }
	}
}

#[async_trait]
impl AuthResolver for HmacAuthResolver {
	async fn resolve(&self, token: &str) -> Result<UserId, AuthError> {
		let claims = verify_hmac_token(token, self.secret.expose()).map_err(|e| AuthError::Invalid(e.to_string()))?;

		if let Some(exp) = claims.exp {
			let now = self.clock.now_unix();
			if now > exp {
				return Err(AuthError::Invalid("token expired".to_string()));
			}
		}

		UserId::new(claims.sub).map_err(|e| AuthError::Invalid(e.to_string()))
	}
}

fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let mut parts = token.split('.');
	let version = parts.next().ok_or_else(|| anyhow::anyhow!("missing version segment"))?;
	if version != "v1" {
		anyhow::bail!("unsupported token version: {version}");
	}
	let payload_b64 = parts.next().ok_or_else(|| anyhow::anyhow!("missing payload segment"))?;
	let sig_b64 = parts.next().ok_or_else(|| anyhow::anyhow!("missing signature segment"))?;
	if parts.next().is_some() {
		anyhow::bail!("unexpected trailing segment");
	}

	let expected_sig = {
		let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())?;
		mac.update(payload_b64.as_bytes());
		mac.finalize().into_bytes()
	};
	let given_sig = URL_SAFE_NO_PAD.decode(sig_b64)?;
	if !constant_time_eq(&expected_sig, &given_sig) {
		anyhow::bail!("signature mismatch");
	}

	let payload = URL_SAFE_NO_PAD.decode(payload_b64)?;
	let claims: AuthClaims = serde_json::from_slice(&payload)?;
	Ok(claims)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}
	diff == 0
}
