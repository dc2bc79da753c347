#![forbid(unsafe_code)]

//! Notifier (spec.md §4.F): pushes a typed message to a user, resolving
//! through the session registry and falling back to the out-of-band IM
//! channel when the primary transport is unavailable.

use std::sync::Arc;

use pairlive_domain::UserId;
use pairlive_platform::ImNotifier;
use pairlive_protocol::framing::{FrameType, encode_frame_default};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use super::registry::SessionRegistry;

#[derive(Debug, Error)]
pub enum NotifyError {
	#[error("player offline")]
	PlayerOffline,
}

/// `Notify(userId, type, payload) -> error` (spec.md §4.F). Never blocks on
/// network I/O while an E-owned lock is held — callers hold no lock across
/// this call.
pub struct Notifier {
	registry: SessionRegistry,
	im: Arc<dyn ImNotifier>,
}

impl Notifier {
	pub fn new(registry: SessionRegistry, im: Arc<dyn ImNotifier>) -> Self {
		Self { registry, im }
	}

	/// `im_user` is the recipient's alternate-channel handle, if known
	/// (`ActiveUser::im_user`); `None` skips the fallback.
	pub async fn notify<B: Serialize>(
		&self,
		user: &UserId,
		frame_type: FrameType,
		body: &B,
		im_user: Option<&str>,
	) -> Result<(), NotifyError> {
		let frame = encode_frame_default(frame_type, body).expect("notifier bodies always serialize");

		if let Some(conn) = self.registry.lookup(user).await {
			if conn.try_send_frame(frame.clone()) {
				return Ok(());
			}
			warn!(user = %user, frame_type = %frame_type, "notifier: outbound queue full, dropping");
		}

		if let Some(im_user) = im_user
			&& self.im.send_frame(im_user, &frame).await.is_ok()
		{
			return Ok(());
		}

		Err(NotifyError::PlayerOffline)
	}
}
