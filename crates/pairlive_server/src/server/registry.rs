#![forbid(unsafe_code)]

//! Session registry (spec.md §4.D): process-wide mapping from user id to the
//! live, authorized connection. Single-writer per id — a second authorized
//! connection for the same id evicts the first.
//!
//! Grounded on `room_hub.rs`'s `Arc<Mutex<Inner>>` map-of-channels shape,
//! repurposed from per-room fan-out to per-user single-occupancy.

use std::collections::HashMap;
use std::sync::Arc;

use pairlive_domain::UserId;
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

/// Handle to one connection's outbound queue and eviction signal. Held by the
/// registry, the PK coordinator, and the notifier. Cheap to clone; identity
/// (for `unregister`'s stale-handle check) is the connection id.
#[derive(Clone)]
pub struct ConnHandle {
	conn_id: u64,
	outbound: mpsc::Sender<Vec<u8>>,
	evict: mpsc::Sender<()>,
}

impl ConnHandle {
	pub fn new(conn_id: u64, outbound: mpsc::Sender<Vec<u8>>, evict: mpsc::Sender<()>) -> Self {
		Self { conn_id, outbound, evict }
	}

	/// Non-blocking enqueue of an already-encoded frame; drop-on-full (spec.md §4.C).
	pub fn try_send_frame(&self, frame: Vec<u8>) -> bool {
		self.outbound.try_send(frame).is_ok()
	}

	/// Ask this connection's pump to close without reporting an offline transition.
	pub fn evict(&self) {
		let _ = self.evict.try_send(());
	}

	fn is_same_connection(&self, other: &ConnHandle) -> bool {
		self.conn_id == other.conn_id
	}
}

/// Process-wide, per-user single-writer registry.
#[derive(Clone, Default)]
pub struct SessionRegistry {
	inner: Arc<Mutex<HashMap<UserId, ConnHandle>>>,
}

impl SessionRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register `conn` as the authorized handle for `id`. If another connection
	/// was already registered for `id`, it is evicted and returned.
	pub async fn register(&self, id: UserId, conn: ConnHandle) -> Option<ConnHandle> {
		let mut inner = self.inner.lock().await;
		let previous = inner.insert(id.clone(), conn);
		if let Some(prev) = &previous {
			debug!(user = %id, "registry: evicting previous connection");
			prev.evict();
		}
		previous
	}

	/// No-op unless `conn` is still the currently-registered handle for `id`
	/// (defeats races where an evicted pump deregisters after its successor
	/// has already taken over).
	pub async fn unregister(&self, id: &UserId, conn: &ConnHandle) {
		let mut inner = self.inner.lock().await;
		if inner.get(id).is_some_and(|current| current.is_same_connection(conn)) {
			inner.remove(id);
		}
	}

	pub async fn lookup(&self, id: &UserId) -> Option<ConnHandle> {
		self.inner.lock().await.get(id).cloned()
	}
}
