#![forbid(unsafe_code)]

//! Alternate notification channel (spec.md §6, §4.F): when the primary
//! transport is unavailable, notifications are encoded as `T=B` frames and
//! delivered over an IM chat provider to a reserved system user.

use async_trait::async_trait;
use thiserror::Error;

use crate::SecretString;

#[derive(Debug, Error)]
pub enum ImNotifyError {
	#[error("im provider error: {0}")]
	Provider(#[source] anyhow::Error),
}

/// Delivers a raw `T=B` frame to `im_user` over the out-of-band IM channel.
#[async_trait]
pub trait ImNotifier: Send + Sync + 'static {
	async fn send_frame(&self, im_user: &str, frame: &[u8]) -> Result<(), ImNotifyError>;
}

/// HTTP-backed default implementation addressing a generic IM provider send API.
pub struct HttpImNotifier {
	client: reqwest::Client,
	base_url: String,
	api_key: SecretString,
}

impl HttpImNotifier {
	pub fn new(base_url: impl Into<String>, api_key: SecretString) -> Self {
		Self {
			client: reqwest::Client::new(),
			base_url: base_url.into(),
			api_key,
		}
	}
}

#[derive(serde::Serialize)]
struct SendRequest<'a> {
	to: &'a str,
	body: &'a str,
}

#[async_trait]
impl ImNotifier for HttpImNotifier {
	async fn send_frame(&self, im_user: &str, frame: &[u8]) -> Result<(), ImNotifyError> {
		let body = String::from_utf8_lossy(frame);

		self.client
			.post(format!("{}/im/send", self.base_url))
			.bearer_auth(self.api_key.expose())
			.json(&SendRequest { to: im_user, body: &body })
			.send()
			.await
			.map_err(|e| ImNotifyError::Provider(e.into()))?
			.error_for_status()
			.map_err(|e| ImNotifyError::Provider(e.into()))?;

		Ok(())
	}
}
